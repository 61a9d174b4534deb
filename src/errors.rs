use proto::NtStatus;

#[derive(Clone, Debug, Fail, PartialEq)]
pub enum NetlogonError {
    #[fail(display = "machine configuration incomplete: {}", _0)] ConfigMissing(&'static str),

    #[fail(display = "crypto provider failure")] CryptoFailure,

    #[fail(display = "RPC transport failure")] TransportFailure,

    #[fail(display = "domain controller returned status 0x{:08x}", _0)] RemoteStatus(u32),

    #[fail(display = "server credential mismatch")] CredentialMismatch,

    #[fail(display = "could not generate a value acceptable to the domain controller")]
    MitigationExhausted,

    #[fail(display = "secure channel is not established")] InvalidChannel,
}

impl NetlogonError {
    /// The NT status reported to callers that speak status codes.
    ///
    /// Remote failures keep the code the DC returned; everything else
    /// collapses to `NT_STATUS_UNSUCCESSFUL`.
    pub fn nt_status(&self) -> u32 {
        match *self {
            NetlogonError::RemoteStatus(status) => status,
            _ => NtStatus::Unsuccessful as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_is_preserved() {
        let err = NetlogonError::RemoteStatus(NtStatus::NoTrustSamAccount as u32);

        assert_eq!(err.nt_status(), 0xC000_018B);
    }

    #[test]
    fn local_failures_collapse_to_unsuccessful() {
        assert_eq!(
            NetlogonError::CredentialMismatch.nt_status(),
            NtStatus::Unsuccessful as u32
        );
        assert_eq!(
            NetlogonError::ConfigMissing("machine password").nt_status(),
            0xC000_0001
        );
    }
}

//! The secure-channel state machine: challenge/response negotiation with
//! the domain controller, the rolling credential chain every authenticated
//! call advances, and trust-account password rotation.
//!
//! A `Channel` is owned by its caller and never shared; the chain seeds
//! advance strictly in call order, so pipelining authenticated calls over
//! one channel is not possible. A call that dies in flight leaves the
//! chain indeterminate and the channel marks itself invalid; recovery is a
//! fresh negotiation.

use time::get_time;
use zeroize::{Zeroize, Zeroizing};

use auth::{gen_client_challenge, gen_credentials, gen_password, gen_session_key_128,
           gen_session_key_64, CredentialError, SessionKey, NETR_MITIGATION_MAX_ATTEMPTS};
use config::{global_policy, MachineConfig, MachineIdentity, Policy};
use errors::NetlogonError;
use proto::{log_rpc_status, NegotiateFlags, NetrAuthenticator, NetrCredential, NetrOpnum,
            SecureChannelType, ServerAuthenticate2, ServerPasswordSet, ServerReqChallenge};
use rpc::{netr_close, netr_open, netr_open_secure, NetrBinding, NetrTransport};

/// Caller flag: authenticate with the initial (pre-join) machine password.
/// Accepted for compatibility but not acted upon; the default machine
/// password is always used, as in the original implementation.
pub const NETR_FLG_INIT: u32 = 0x0000_0002;

/// The flags every negotiation proposes before policy adjustments.
fn netr_server_auth2_flags() -> NegotiateFlags {
    NegotiateFlags::NETR_NEGO_BASE_FLAGS | NegotiateFlags::NETR_NEGO_STRONGKEY_FLAG
        | NegotiateFlags::NETR_NEGO_SECURE_RPC_FLAG
}

/// The credential chain: the session key and the two rolling seeds, plus
/// the flag set the DC agreed to.
#[derive(Debug)]
pub struct ChannelState {
    session_key: SessionKey,
    client_credential: NetrCredential,
    server_credential: NetrCredential,
    nego_flags: NegotiateFlags,
    timestamp: u32,
    valid: bool,
}

impl ChannelState {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn negotiated_flags(&self) -> NegotiateFlags {
        self.nego_flags
    }

    /// Build the authenticator for the next authenticated call: advance
    /// the client seed by `timestamp` and derive a credential from the
    /// advanced seed.
    ///
    /// When the derived credential would trip the DC mitigation filter,
    /// the advance is redone from the untouched seed with the next
    /// timestamp, so a retried call never double-advances the chain.
    pub fn setup_authenticator(
        &mut self,
        timestamp: u32,
    ) -> Result<NetrAuthenticator, NetlogonError> {
        if !self.valid {
            return Err(NetlogonError::InvalidChannel);
        }

        let (a0, a1) = self.client_credential.as_words();
        let mut timestamp = timestamp;

        for _ in 0..NETR_MITIGATION_MAX_ATTEMPTS {
            let seed = NetrCredential::from_words(a0.wrapping_add(timestamp), a1);

            match gen_credentials(&self.session_key, &seed, 0, true) {
                Ok(credential) => {
                    self.client_credential = seed;
                    self.timestamp = timestamp;

                    return Ok(NetrAuthenticator {
                        credential,
                        timestamp,
                    });
                }
                Err(CredentialError::Retry) => timestamp = timestamp.wrapping_add(1),
                Err(CredentialError::Crypto) => return Err(NetlogonError::CryptoFailure),
            }
        }

        Err(NetlogonError::MitigationExhausted)
    }

    /// Check the DC's return authenticator against the server seed
    /// advanced by the timestamp of the outgoing call. A mismatch
    /// destroys the chain; the caller has to authenticate again.
    pub fn validate_chain(&mut self, reply: &NetrAuthenticator) -> Result<(), NetlogonError> {
        if !self.valid {
            return Err(NetlogonError::InvalidChannel);
        }

        let (s0, s1) = self.server_credential.as_words();
        let seed = NetrCredential::from_words(s0.wrapping_add(self.timestamp), s1);

        let expected = gen_credentials(&self.session_key, &seed, 0, false)
            .map_err(NetlogonError::from)?;

        if expected != reply.credential {
            self.invalidate();
            return Err(NetlogonError::CredentialMismatch);
        }

        self.server_credential = seed;

        Ok(())
    }

    /// Wipe the key material and take the channel out of service.
    pub fn invalidate(&mut self) {
        self.session_key.zeroize();
        self.client_credential.zeroize();
        self.server_credential.zeroize();
        self.nego_flags = NegotiateFlags::empty();
        self.timestamp = 0;
        self.valid = false;
    }
}

impl Drop for ChannelState {
    fn drop(&mut self) {
        self.invalidate();
    }
}

/// An established (or establishing) trust channel to one domain
/// controller.
#[derive(Debug)]
pub struct Channel {
    identity: MachineIdentity,
    state: ChannelState,
    policy: Policy,
    /// The DC's FQDN as given to `negotiate`, without the UNC prefix.
    server_fqdn: String,
    /// Caller-supplied `NETR_FLG_*` bits, kept for compatibility.
    flags: u32,
}

impl Channel {
    /// Drive the challenge/response negotiation over an already-bound
    /// handle ([MS-NRPC] 3.1.4.1 "Session-Key Negotiation"): the channel
    /// walks Challenged (after `ServerReqChallenge`) into Authenticated
    /// (after `ServerAuthenticate2` and the server-credential check);
    /// every failure closes it instead.
    ///
    /// Negotiation runs on an unprotected binding; RPC-level protection
    /// only applies to later traffic, through `open_secure`.
    ///
    /// `seqnum_notify` runs exactly once, after the chain is established,
    /// so the kpasswd sequence number can be synchronized.
    pub fn negotiate<T, C, F>(
        handle: &mut T,
        server: &str,
        config: &C,
        policy: Policy,
        flags: u32,
        seqnum_notify: F,
    ) -> Result<Channel, NetlogonError>
    where
        T: NetrTransport,
        C: MachineConfig,
        F: FnOnce(),
    {
        // We should check NETR_FLG_INIT and use the appropriate password,
        // but that never worked; the default one is always used.
        let identity = MachineIdentity::from_config(config, server)?;

        // [MS-NRPC] 3.1.4.1 Step 7: DCs reject negotiate attempts if none
        // of the first 5 bytes of the challenge are unique, so sample
        // until we have one that satisfies the filter.
        let client_challenge = gen_client_challenge()?;

        let server_challenge = server_req_challenge(handle, &identity, &client_challenge)?;

        let mut state =
            server_authenticate2(handle, &identity, policy, &client_challenge, &server_challenge)?;
        state.valid = true;

        seqnum_notify();

        debug!("secure channel to {} established", identity.server());

        Ok(Channel {
            identity,
            state,
            policy,
            server_fqdn: server.to_owned(),
            flags,
        })
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid
    }

    pub fn negotiated_flags(&self) -> NegotiateFlags {
        self.state.nego_flags
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// See `ChannelState::setup_authenticator`.
    pub fn setup_authenticator(
        &mut self,
        timestamp: u32,
    ) -> Result<NetrAuthenticator, NetlogonError> {
        self.state.setup_authenticator(timestamp)
    }

    /// See `ChannelState::validate_chain`.
    pub fn validate_chain(&mut self, reply: &NetrAuthenticator) -> Result<(), NetlogonError> {
        self.state.validate_chain(reply)
    }

    /// Bind a handle for post-negotiation traffic, secured when the DC
    /// agreed to `SECURE_RPC_FLAG`.
    pub fn open_secure<B: NetrBinding>(
        &self,
        binding: &B,
        user: &str,
    ) -> Result<B::Handle, NetlogonError> {
        netr_open_secure(
            binding,
            &self.server_fqdn,
            self.identity.fqdn_domain(),
            user,
            self.state.nego_flags,
            self.policy,
        )
    }

    /// Rotate the trust-account password over the established channel.
    ///
    /// The new password is only installed locally after the DC accepted
    /// the call and its return authenticator validated; any failure
    /// leaves the stored password untouched.
    ///
    /// The DC may legitimately refuse (`ACCESS_DENIED`) when it is
    /// configured to deny trust-account password changes; callers keep
    /// using the original password in that case.
    pub fn change_password<T: NetrTransport>(
        &mut self,
        handle: &mut T,
    ) -> Result<(), NetlogonError> {
        let timestamp = self.next_timestamp();
        let auth = self.state.setup_authenticator(timestamp)?;

        let new_password = Zeroizing::new(gen_password(
            &self.state.session_key,
            &self.identity.owf_password(),
        )?);

        let mut arg = ServerPasswordSet {
            servername: self.identity.server().to_owned(),
            account_name: self.identity.account_name(),
            account_type: SecureChannelType::WkstaTrust,
            hostname: self.identity.hostname().to_owned(),
            auth,
            ret_auth: NetrAuthenticator::default(),
            owf_password: *new_password,
            status: 0,
        };

        if let Err(err) = handle.password_set(&mut arg) {
            // the chain is indeterminate once a call dies in flight
            self.state.invalidate();
            return Err(err);
        }

        arg.owf_password.zeroize();

        if arg.status != 0 {
            log_rpc_status(NetrOpnum::ServerPasswordSet, arg.status);
            handle.release();
            return Err(NetlogonError::RemoteStatus(arg.status));
        }

        let result = self.state.validate_chain(&arg.ret_auth);
        handle.release();
        result?;

        self.identity.set_password(&new_password);

        info!("trust account password updated for {}", self.identity.account_name());

        Ok(())
    }

    /// A free-running per-channel counter; the server only cares that it
    /// increases.
    fn next_timestamp(&self) -> u32 {
        let now = get_time().sec as u32;

        if now > self.state.timestamp {
            now
        } else {
            self.state.timestamp.wrapping_add(1)
        }
    }
}

fn server_req_challenge<T: NetrTransport>(
    handle: &mut T,
    identity: &MachineIdentity,
    client_challenge: &NetrCredential,
) -> Result<NetrCredential, NetlogonError> {
    let mut arg = ServerReqChallenge {
        servername: identity.server().to_owned(),
        hostname: identity.hostname().to_owned(),
        client_challenge: *client_challenge,
        server_challenge: NetrCredential::default(),
        status: 0,
    };

    handle.req_challenge(&mut arg)?;

    if arg.status != 0 {
        log_rpc_status(NetrOpnum::ServerReqChallenge, arg.status);
        handle.release();
        return Err(NetlogonError::RemoteStatus(arg.status));
    }

    handle.release();

    Ok(arg.server_challenge)
}

fn server_authenticate2<T: NetrTransport>(
    handle: &mut T,
    identity: &MachineIdentity,
    policy: Policy,
    client_challenge: &NetrCredential,
    server_challenge: &NetrCredential,
) -> Result<ChannelState, NetlogonError> {
    let mut negotiate_flags = netr_server_auth2_flags();

    // If we've disabled SecureRPC, remove it from the proposal so the
    // returned intersection can't include it either.
    if !policy.use_secure_rpc {
        negotiate_flags.remove(NegotiateFlags::NETR_NEGO_SECURE_RPC_FLAG);
    }

    let session_key = if negotiate_flags.contains(NegotiateFlags::NETR_NEGO_STRONGKEY_FLAG) {
        gen_session_key_128(identity.password(), client_challenge, server_challenge)?
    } else {
        gen_session_key_64(identity.password(), client_challenge, server_challenge)?
    };

    // No retry here: the challenges are already pinned on the wire, so
    // these credentials cannot be resampled.
    let client_credential = gen_credentials(&session_key, client_challenge, 0, false)
        .map_err(NetlogonError::from)?;
    let server_credential = gen_credentials(&session_key, server_challenge, 0, false)
        .map_err(NetlogonError::from)?;

    trace!(
        "server=[{}] account_name=[{}] hostname=[{}]",
        identity.server(),
        identity.account_name(),
        identity.hostname()
    );

    let mut arg = ServerAuthenticate2 {
        servername: identity.server().to_owned(),
        account_name: identity.account_name(),
        account_type: SecureChannelType::WkstaTrust,
        hostname: identity.hostname().to_owned(),
        client_credential,
        negotiate_flags,
        server_credential: NetrCredential::default(),
        status: 0,
    };

    handle.authenticate2(&mut arg)?;

    if arg.status != 0 {
        log_rpc_status(NetrOpnum::ServerAuthenticate2, arg.status);
        handle.release();
        return Err(NetlogonError::RemoteStatus(arg.status));
    }

    // The server returns the intersection of our flags and theirs.
    let nego_flags = arg.negotiate_flags;
    let matched = arg.server_credential == server_credential;

    handle.release();

    if !matched {
        return Err(NetlogonError::CredentialMismatch);
    }

    Ok(ChannelState {
        session_key,
        client_credential,
        server_credential,
        nego_flags,
        timestamp: 0,
        valid: false,
    })
}

/// The core of the NETLOGON authentication protocol: open an anonymous
/// session to the NETLOGON pipe on the DC, run the challenge/response
/// negotiation, and close the pipe.
///
/// On success the established channel carries the credential chain, and
/// the netlogon sequence number has been synchronized through
/// `seqnum_notify`.
pub fn netlogon_auth<B, C, F>(
    binding: &B,
    server: &str,
    domain: &str,
    config: &C,
    flags: u32,
    seqnum_notify: F,
) -> Result<Channel, NetlogonError>
where
    B: NetrBinding,
    C: MachineConfig,
    F: FnOnce(),
{
    let mut handle = match netr_open(binding, server, domain, &config.ipc_user()) {
        Ok(handle) => handle,
        Err(err) => {
            error!("netlogon_auth remote open failed ({})", err);
            return Err(err);
        }
    };

    let result = Channel::negotiate(&mut handle, server, config, global_policy(), flags, seqnum_notify);

    netr_close(&mut handle);

    result
}

//! The configuration seam: where the machine identity comes from, and the
//! process-wide Netlogon policy bits.
//!
//! The flag bits mirror `smbd/netlogon_flags`; the default of 0 enables
//! everything, and setting a bit disables one feature. They are decoded
//! once at startup and read lock-free afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

use zeroize::Zeroizing;

use errors::NetlogonError;
use proto::{NETBIOS_NAME_SZ, NETR_OWF_PASSWORD_SZ};

/// Use unauthenticated RPC on the post-negotiation channel.
pub const NETR_CFG_DISABLE_SECURE_RPC: u32 = 0x0000_0001;
/// Ignore failures when verifying RPC responses.
pub const NETR_CFG_DISABLE_RESP_VERIF: u32 = 0x0000_0002;
/// Always use SamLogon (with authenticators) instead of SamLogonEx.
pub const NETR_CFG_DISABLE_SAMLOGONEX: u32 = 0x0000_0004;

static USE_SECURE_RPC: AtomicBool = AtomicBool::new(true);
static VERIFY_RPC_RESPONSES: AtomicBool = AtomicBool::new(true);
static USE_LOGON_EX: AtomicBool = AtomicBool::new(true);

/// A read-only view of the process-wide policy, captured at the start of
/// an operation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Policy {
    pub use_secure_rpc: bool,
    pub verify_rpc_responses: bool,
    pub use_logon_ex: bool,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            use_secure_rpc: true,
            verify_rpc_responses: true,
            use_logon_ex: true,
        }
    }
}

/// Decode the configured disable bits. Called once when the service
/// starts; changing them afterwards requires a restart, as in the original
/// service.
pub fn init_global_policy(flags: u32) {
    USE_SECURE_RPC.store(flags & NETR_CFG_DISABLE_SECURE_RPC == 0, Ordering::Relaxed);
    VERIFY_RPC_RESPONSES.store(flags & NETR_CFG_DISABLE_RESP_VERIF == 0, Ordering::Relaxed);
    USE_LOGON_EX.store(flags & NETR_CFG_DISABLE_SAMLOGONEX == 0, Ordering::Relaxed);

    debug!("netlogon policy flags 0x{:08x}", flags);
}

pub fn global_policy() -> Policy {
    Policy {
        use_secure_rpc: USE_SECURE_RPC.load(Ordering::Relaxed),
        verify_rpc_responses: VERIFY_RPC_RESPONSES.load(Ordering::Relaxed),
        use_logon_ex: USE_LOGON_EX.load(Ordering::Relaxed),
    }
}

/// Where the member's identity material is read from. The store behind it
/// (SMF properties, a registry, a test fixture) is not this crate's
/// concern.
pub trait MachineConfig {
    /// The trust-account password. `None` when the machine has not joined
    /// a domain.
    fn machine_password(&self) -> Option<Zeroizing<Vec<u8>>>;

    fn netbios_hostname(&self) -> Option<String>;

    fn nb_domain(&self) -> Option<String>;

    fn fqdn_domain(&self) -> Option<String>;

    /// The account the RPC pipe is opened under; anonymous by default.
    fn ipc_user(&self) -> String {
        String::new()
    }
}

/// The member's identity for one negotiation, snapshotted from
/// configuration. The password buffer is wiped when the identity goes
/// away.
#[derive(Debug)]
pub struct MachineIdentity {
    hostname: String,
    nb_domain: String,
    fqdn_domain: String,
    /// `\\` + the DC's FQDN.
    server: String,
    password: Zeroizing<Vec<u8>>,
}

impl MachineIdentity {
    pub fn from_config<C: MachineConfig>(
        config: &C,
        server: &str,
    ) -> Result<MachineIdentity, NetlogonError> {
        let mut hostname = config
            .netbios_hostname()
            .ok_or(NetlogonError::ConfigMissing("netbios hostname"))?;

        if hostname.len() > NETBIOS_NAME_SZ {
            let mut end = NETBIOS_NAME_SZ;
            while !hostname.is_char_boundary(end) {
                end -= 1;
            }
            hostname.truncate(end);
        }

        let nb_domain = config
            .nb_domain()
            .ok_or(NetlogonError::ConfigMissing("netbios domain"))?;
        let fqdn_domain = config
            .fqdn_domain()
            .ok_or(NetlogonError::ConfigMissing("fully-qualified domain"))?;

        let password = config
            .machine_password()
            .filter(|password| !password.is_empty())
            .ok_or(NetlogonError::ConfigMissing("machine password"))?;

        Ok(MachineIdentity {
            hostname,
            nb_domain,
            fqdn_domain,
            server: format!("\\\\{}", server),
            password,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn nb_domain(&self) -> &str {
        &self.nb_domain
    }

    pub fn fqdn_domain(&self) -> &str {
        &self.fqdn_domain
    }

    /// The UNC form the DC expects in `servername` fields.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The trust account: the NetBIOS hostname with `$` appended.
    pub fn account_name(&self) -> String {
        format!("{}$", self.hostname)
    }

    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// The first 16 bytes of the password, zero-padded, as the OWF
    /// rotation input.
    pub fn owf_password(&self) -> Zeroizing<[u8; NETR_OWF_PASSWORD_SZ]> {
        let mut owf = [0u8; NETR_OWF_PASSWORD_SZ];
        let take = self.password.len().min(NETR_OWF_PASSWORD_SZ);
        owf[..take].copy_from_slice(&self.password[..take]);
        Zeroizing::new(owf)
    }

    /// Install a rotated password. The previous buffer is wiped.
    pub fn set_password(&mut self, new_password: &[u8; NETR_OWF_PASSWORD_SZ]) {
        self.password = Zeroizing::new(new_password.to_vec());
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub struct TestConfig {
        pub password: Option<&'static [u8]>,
        pub hostname: Option<&'static str>,
    }

    impl Default for TestConfig {
        fn default() -> TestConfig {
            TestConfig {
                password: Some(b"Pw!"),
                hostname: Some("WKSTA"),
            }
        }
    }

    impl MachineConfig for TestConfig {
        fn machine_password(&self) -> Option<Zeroizing<Vec<u8>>> {
            self.password.map(|p| Zeroizing::new(p.to_vec()))
        }

        fn netbios_hostname(&self) -> Option<String> {
            self.hostname.map(|h| h.to_owned())
        }

        fn nb_domain(&self) -> Option<String> {
            Some("EXAMPLE".to_owned())
        }

        fn fqdn_domain(&self) -> Option<String> {
            Some("example.com".to_owned())
        }
    }

    #[test]
    fn identity_from_config() {
        let identity =
            MachineIdentity::from_config(&TestConfig::default(), "dc1.example.com").unwrap();

        assert_eq!(identity.hostname(), "WKSTA");
        assert_eq!(identity.account_name(), "WKSTA$");
        assert_eq!(identity.server(), "\\\\dc1.example.com");
        assert_eq!(identity.password(), b"Pw!");
    }

    #[test]
    fn hostname_is_clamped_to_netbios_length() {
        let config = TestConfig {
            hostname: Some("AVERYLONGMACHINENAME"),
            ..TestConfig::default()
        };
        let identity = MachineIdentity::from_config(&config, "dc1.example.com").unwrap();

        assert_eq!(identity.hostname(), "AVERYLONGMACHIN");
        assert_eq!(identity.hostname().len(), NETBIOS_NAME_SZ);
    }

    #[test]
    fn missing_password_is_config_missing() {
        let config = TestConfig {
            password: None,
            ..TestConfig::default()
        };

        assert_matches!(
            MachineIdentity::from_config(&config, "dc1.example.com"),
            Err(NetlogonError::ConfigMissing("machine password"))
        );

        let config = TestConfig {
            password: Some(b""),
            ..TestConfig::default()
        };

        assert_matches!(
            MachineIdentity::from_config(&config, "dc1.example.com"),
            Err(NetlogonError::ConfigMissing("machine password"))
        );
    }

    #[test]
    fn owf_password_is_zero_padded() {
        let identity =
            MachineIdentity::from_config(&TestConfig::default(), "dc1.example.com").unwrap();
        let owf = identity.owf_password();

        assert_eq!(&owf[..3], b"Pw!");
        assert!(owf[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn policy_bits_decode() {
        let decode = |flags| {
            init_global_policy(flags);
            global_policy()
        };

        assert_eq!(decode(0), Policy::default());
        assert!(!decode(NETR_CFG_DISABLE_SECURE_RPC).use_secure_rpc);
        assert!(!decode(NETR_CFG_DISABLE_RESP_VERIF).verify_rpc_responses);
        assert!(!decode(NETR_CFG_DISABLE_SAMLOGONEX).use_logon_ex);

        let all = decode(
            NETR_CFG_DISABLE_SECURE_RPC | NETR_CFG_DISABLE_RESP_VERIF
                | NETR_CFG_DISABLE_SAMLOGONEX,
        );

        assert!(!all.use_secure_rpc);
        assert!(!all.verify_rpc_responses);
        assert!(!all.use_logon_ex);

        init_global_policy(0);
    }
}

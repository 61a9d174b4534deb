//! Client side of the Microsoft Netlogon (NRPC) secure channel: session-key
//! negotiation, the rolling credential chain, and trust-account password
//! rotation, for a member server talking to a domain controller.
//!
//! The RPC transport, the configuration store and the SamLogon layer are
//! consumed through the seams in `rpc` and `config`; this crate owns the
//! challenge/response state machine and every byte of the credential
//! arithmetic.

#[macro_use]
extern crate bitflags;
extern crate byteorder;
extern crate bytes;
extern crate crypto;
extern crate des;
extern crate encoding;
#[macro_use]
extern crate failure;
extern crate generic_array;
#[macro_use]
extern crate log;
extern crate md4;
extern crate num;
#[macro_use]
extern crate num_derive;
extern crate rand;
extern crate time;
extern crate zeroize;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;
#[cfg(test)]
#[macro_use]
extern crate matches;

mod errors;

pub mod auth;
pub mod channel;
pub mod config;
pub mod primitives;
pub mod proto;
pub mod rpc;

pub use auth::{gen_credentials, gen_password, gen_session_key_128, gen_session_key_64,
               passes_dc_mitigation, SessionKey};
pub use channel::{netlogon_auth, Channel, ChannelState, NETR_FLG_INIT};
pub use config::{global_policy, init_global_policy, MachineConfig, MachineIdentity, Policy,
                 NETR_CFG_DISABLE_RESP_VERIF, NETR_CFG_DISABLE_SAMLOGONEX,
                 NETR_CFG_DISABLE_SECURE_RPC};
pub use errors::NetlogonError;
pub use proto::{NegotiateFlags, NetrAuthenticator, NetrCredential, NtStatus};
pub use rpc::{netr_close, netr_open, netr_open_secure, NetrBinding, NetrTransport, SspContext};

//! Wire-facing model of the Netlogon negotiation: credentials,
//! authenticators, negotiate flags, opnums and the argument blocks of the
//! three remote operations this crate drives.
//!
//! NDR marshaling belongs to the transport; everything here is the
//! fixed-size material both sides compute over. All multi-byte integers
//! crossing the wire are little-endian regardless of the host.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;
use failure::Error;
use num::FromPrimitive;
use zeroize::Zeroize;

pub const NETR_CRED_DATA_SZ: usize = 8;
pub const NETR_OWF_PASSWORD_SZ: usize = 16;
/// credential || little-endian u32 timestamp
pub const NETR_AUTHENTICATOR_WIRE_SZ: usize = 12;
pub const NETBIOS_NAME_SZ: usize = 15;

pub fn load_le_u32(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(buf)
}

pub fn store_le_u32(buf: &mut [u8], value: u32) {
    LittleEndian::write_u32(buf, value)
}

pub trait WriteTo {
    fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<usize, Error>;
}

/// An 8-byte Netlogon credential: a challenge, a chain seed, or a derived
/// proof of session-key possession, depending on where it travels.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct NetrCredential(pub [u8; NETR_CRED_DATA_SZ]);

impl NetrCredential {
    /// The two little-endian 32-bit words the chain arithmetic runs on.
    pub fn as_words(&self) -> (u32, u32) {
        (load_le_u32(&self.0[0..4]), load_le_u32(&self.0[4..8]))
    }

    pub fn from_words(w0: u32, w1: u32) -> NetrCredential {
        let mut data = [0u8; NETR_CRED_DATA_SZ];
        store_le_u32(&mut data[0..4], w0);
        store_le_u32(&mut data[4..8], w1);
        NetrCredential(data)
    }
}

impl fmt::Debug for NetrCredential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NetrCredential(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl Zeroize for NetrCredential {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl WriteTo for NetrCredential {
    fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<usize, Error> {
        buf.put_slice(&self.0);

        Ok(NETR_CRED_DATA_SZ)
    }
}

/// The per-call authenticator: a credential derived from the rolling chain
/// seed plus the timestamp the seed was advanced by.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NetrAuthenticator {
    pub credential: NetrCredential,
    pub timestamp: u32,
}

impl WriteTo for NetrAuthenticator {
    fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<usize, Error> {
        self.credential.write_to(buf)?;
        buf.put_u32::<LittleEndian>(self.timestamp);

        Ok(NETR_AUTHENTICATOR_WIRE_SZ)
    }
}

bitflags! {
    /// Capabilities proposed by the client and intersected by the DC on
    /// `ServerAuthenticate2`.
    pub struct NegotiateFlags: u32 {
        /// The legacy capability bits every member sends.
        const NETR_NEGO_BASE_FLAGS = 0x0000_01FF;
        /// Selects the 128-bit HMAC-MD5 session-key computation.
        const NETR_NEGO_STRONGKEY_FLAG = 0x0000_4000;
        /// The DC supports Netlogon SSP secure RPC on the established channel.
        const NETR_NEGO_SECURE_RPC_FLAG = 0x4000_0000;
    }
}

/// The kind of trust account behind the channel, as sent on the wire.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
#[repr(u32)]
pub enum SecureChannelType {
    Null = 0,
    /// A member workstation trust account (`HOSTNAME$`).
    WkstaTrust = 2,
    DomainTrust = 3,
    ServerTrust = 5,
}

/// Opnums of the NRPC operations the negotiation core invokes.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
#[repr(u16)]
pub enum NetrOpnum {
    ServerReqChallenge = 4,
    ServerPasswordSet = 6,
    ServerAuthenticate2 = 15,
}

/// NT status codes the DC is known to answer the negotiation with.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
#[repr(u32)]
pub enum NtStatus {
    Success = 0x0000_0000,
    Unsuccessful = 0xC000_0001,
    InvalidParameter = 0xC000_000D,
    AccessDenied = 0xC000_0022,
    InternalError = 0xC000_00E5,
    NoTrustSamAccount = 0xC000_018B,
    InsufficientLogonInfo = 0xC000_0250,
}

/// Log a non-success status the way the RPC layer reports one, with the
/// symbolic name when we know it.
pub fn log_rpc_status(opnum: NetrOpnum, status: u32) {
    match NtStatus::from_u32(status) {
        Some(nt) => error!("[{:?}] request failed, {:?}", opnum, nt),
        None => error!("[{:?}] request failed, status 0x{:08x}", opnum, status),
    }
}

/// `NetrServerReqChallenge` argument block.
#[derive(Clone, Debug, Default)]
pub struct ServerReqChallenge {
    /// `\\` + the DC's FQDN.
    pub servername: String,
    pub hostname: String,
    pub client_challenge: NetrCredential,
    /// Filled in by the DC.
    pub server_challenge: NetrCredential,
    pub status: u32,
}

/// `NetrServerAuthenticate2` argument block.
#[derive(Clone, Debug)]
pub struct ServerAuthenticate2 {
    pub servername: String,
    /// The trust account, `HOSTNAME$`.
    pub account_name: String,
    pub account_type: SecureChannelType,
    pub hostname: String,
    pub client_credential: NetrCredential,
    /// Proposed by the client; replaced by the server-intersected set on
    /// return.
    pub negotiate_flags: NegotiateFlags,
    /// Filled in by the DC.
    pub server_credential: NetrCredential,
    pub status: u32,
}

/// `NetrServerPasswordSet` argument block.
#[derive(Clone, Debug)]
pub struct ServerPasswordSet {
    pub servername: String,
    pub account_name: String,
    pub account_type: SecureChannelType,
    pub hostname: String,
    pub auth: NetrAuthenticator,
    /// The DC's return authenticator.
    pub ret_auth: NetrAuthenticator,
    pub owf_password: [u8; NETR_OWF_PASSWORD_SZ],
    pub status: u32,
}

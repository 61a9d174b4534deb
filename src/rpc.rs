//! The seam to the RPC runtime.
//!
//! The negotiation core never marshals NDR itself; it hands fully-typed
//! argument blocks to a `NetrTransport` and reads the out-fields back.
//! Session-key negotiation runs on an unprotected binding ([MS-NRPC]
//! 3.1.4.1); the secure variant only comes into play for post-negotiation
//! traffic, and only when `SECURE_RPC` survived the flag intersection.

use std::sync::atomic::{AtomicUsize, Ordering};

use config::Policy;
use errors::NetlogonError;
use proto::{NegotiateFlags, ServerAuthenticate2, ServerPasswordSet, ServerReqChallenge};

/// One bound NETR pipe. Every call returns `TransportFailure` when the
/// transport itself gives up; a DC-reported status travels back in the
/// argument block instead.
pub trait NetrTransport {
    fn req_challenge(&mut self, arg: &mut ServerReqChallenge) -> Result<(), NetlogonError>;

    fn authenticate2(&mut self, arg: &mut ServerAuthenticate2) -> Result<(), NetlogonError>;

    fn password_set(&mut self, arg: &mut ServerPasswordSet) -> Result<(), NetlogonError>;

    /// Free per-call state held by the transport.
    fn release(&mut self);

    /// Tear down the binding.
    fn unbind(&mut self);
}

/// Produces bound pipes. `bind` opens the pipe anonymously; `bind_secure`
/// attaches the Netlogon SSP context for message-level protection.
pub trait NetrBinding {
    type Handle: NetrTransport;

    fn bind(
        &self,
        server: &str,
        domain: &str,
        user: &str,
    ) -> Result<Self::Handle, NetlogonError>;

    fn bind_secure(
        &self,
        server: &str,
        domain: &str,
        user: &str,
        ssp: &SspContext,
    ) -> Result<Self::Handle, NetlogonError>;
}

static AUTH_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Handle material for the Netlogon SSP authenticator. The SSP itself
/// lives with the transport; the core only allocates context ids and
/// forwards the response-verification policy.
#[derive(Clone, Debug)]
pub struct SspContext {
    pub auth_context_id: u32,
    pub verify_responses: bool,
}

impl SspContext {
    pub fn allocate(policy: Policy) -> SspContext {
        SspContext {
            auth_context_id: AUTH_CONTEXT_ID.fetch_add(1, Ordering::Relaxed) as u32,
            verify_responses: policy.verify_rpc_responses,
        }
    }
}

/// Open an anonymous session to the NETLOGON pipe on a domain controller
/// and bind to the NETR RPC interface.
pub fn netr_open<B: NetrBinding>(
    binding: &B,
    server: &str,
    domain: &str,
    user: &str,
) -> Result<B::Handle, NetlogonError> {
    binding.bind(server, domain, user)
}

/// Bind for post-negotiation traffic. If the server didn't offer
/// `SECURE_RPC_FLAG`, or we disabled secure RPC, the flag won't be in the
/// negotiated set and a plain bind is used instead.
pub fn netr_open_secure<B: NetrBinding>(
    binding: &B,
    server: &str,
    domain: &str,
    user: &str,
    nego_flags: NegotiateFlags,
    policy: Policy,
) -> Result<B::Handle, NetlogonError> {
    if nego_flags.contains(NegotiateFlags::NETR_NEGO_SECURE_RPC_FLAG) {
        binding.bind_secure(server, domain, user, &SspContext::allocate(policy))
    } else {
        binding.bind(server, domain, user)
    }
}

/// Close a NETLOGON pipe and free the RPC context.
pub fn netr_close<T: NetrTransport>(handle: &mut T) {
    handle.unbind();
}

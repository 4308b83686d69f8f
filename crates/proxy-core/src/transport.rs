//! Facade traits for the collaborators this crate treats as external: the
//! SIP stack that actually puts bytes on the wire, and the control
//! channel that carries commands in from and replies out to remote
//! application clients.

use async_trait::async_trait;

/// Outcome reported back to a remote client over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Ok,
    Nok,
}

/// Opaque handle to an inbound server transaction, as delivered by the
/// SIP stack. The proxy core never inspects this; it only hands it back
/// to [`SipTransport`] calls that need to address a specific incoming
/// transaction.
pub type ServerTransactionHandle = String;

/// The SIP stack boundary this crate consumes. A production embedding
/// wires this to whatever UDP/TCP transport and message parser it runs;
/// tests wire it to an in-memory recorder.
#[async_trait]
pub trait SipTransport: Send + Sync {
    /// Send a request statelessly to `destination`. Returns an error if
    /// the underlying transport could not accept the message (closed
    /// socket, DNS failure, ...); the caller treats this as
    /// [`crate::error::ProxyError::SendFailure`].
    async fn send_request(
        &self,
        request: rsip::Request,
        destination: &rsip::Uri,
    ) -> Result<(), String>;

    /// Forward a response upstream on behalf of the given server
    /// transaction.
    async fn forward_response(
        &self,
        server_txn: &ServerTransactionHandle,
        response: rsip::Response,
    ) -> Result<(), String>;

    /// Locally generate and send a final response for an incoming server
    /// transaction — used for synthesized 408/483/487/500 and for
    /// dialog-maker-composed responses.
    async fn stateful_reply(
        &self,
        server_txn: &ServerTransactionHandle,
        status: rsip::StatusCode,
        reason: Option<String>,
        headers: Vec<rsip::Header>,
        body: Vec<u8>,
    ) -> Result<(), String>;
}

/// The control channel boundary this crate consumes.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Reply to a previously issued command, identified by the message id
    /// the client supplied when it issued the command.
    async fn route_api_response(
        &self,
        client_msg_id: &str,
        outcome: ControlOutcome,
        body: Option<serde_json::Value>,
    );
}

/// An inbound request buffered by the registrar/pending-request store
/// while a remote client decides whether (and where) to proxy it.
#[derive(Debug, Clone)]
pub struct PendingProxyRequest {
    pub server_txn: ServerTransactionHandle,
    pub call_id: String,
    pub request: rsip::Request,
}

/// The registrar/pending-request store boundary this crate consumes.
/// `proxy_request` looks up a buffered request by the transaction id the
/// control channel supplied when it first surfaced the request to the
/// remote client.
#[async_trait]
pub trait PendingRequestStore: Send + Sync {
    /// Look up and remove a buffered request. Returns `None` if no
    /// request is pending under that id (already handled, expired, or
    /// never existed), in which case the caller replies `NOK`.
    async fn find_and_remove(&self, transaction_id: &str) -> Option<PendingProxyRequest>;
}

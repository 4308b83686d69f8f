//! Server-side transaction wrapping the inbound request a [`crate::proxy::core::ProxyCore`]
//! is forking on behalf of.

use std::sync::Arc;

use rsip::prelude::HeadersExt;
use tracing::debug;

use crate::cdr::{stop_reason_for_status, CdrEvent, CdrReason, CdrSide, CdrSink};
use crate::transport::{ServerTransactionHandle, SipTransport};

/// Wraps the original inbound request and tracks what has already been
/// forwarded upstream so a second final response is absorbed rather than
/// sent twice.
pub struct ServerTransaction {
    handle: ServerTransactionHandle,
    request: rsip::Request,
    last_forwarded_status: Option<u16>,
}

impl ServerTransaction {
    pub fn new(handle: ServerTransactionHandle, request: rsip::Request) -> Self {
        ServerTransaction {
            handle,
            request,
            last_forwarded_status: None,
        }
    }

    pub fn handle(&self) -> &ServerTransactionHandle {
        &self.handle
    }

    pub fn request(&self) -> &rsip::Request {
        &self.request
    }

    /// Duplicate the received message for per-branch mutation. `rsip`
    /// messages are owned values, so this is an ordinary clone rather
    /// than a reference-count bump; it exists as its own method so the
    /// call site documents that a fresh per-branch copy is being taken.
    pub fn msg_dup(&self) -> rsip::Request {
        self.request.clone()
    }

    fn is_invite(&self) -> bool {
        self.request.method == rsip::Method::Invite
    }

    /// Whether `status` would be a *final* response (>=200).
    fn is_final(status: u16) -> bool {
        status >= 200
    }

    /// Forward a response upstream. Finals after the first are absorbed
    /// silently rather than re-sent — this is the mechanism behind "the
    /// server transaction forwards at most one final response".
    pub async fn forward_response(
        &mut self,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
        response: rsip::Response,
        call_id: &str,
    ) -> Result<(), String> {
        let status: u16 = response.status_code.clone().into();

        if Self::is_final(status) {
            if let Some(prev) = self.last_forwarded_status {
                if Self::is_final(prev) {
                    debug!(handle = %self.handle, status, "absorbing retransmitted final, already forwarded one");
                    return Ok(());
                }
            }
        }

        transport.forward_response(&self.handle, response).await?;

        if Self::is_final(status) {
            self.last_forwarded_status = Some(status);
            if self.is_invite() {
                let event = if status < 300 {
                    CdrEvent::Start {
                        side: CdrSide::Application,
                        reason: CdrReason::ProxyUas,
                    }
                } else {
                    CdrEvent::Stop {
                        side: CdrSide::Application,
                        reason: stop_reason_for_status(status),
                    }
                };
                cdr.post_cdr(call_id, event).await;
            }
        } else {
            self.last_forwarded_status = Some(status);
        }
        Ok(())
    }

    /// Synthesize and send a locally-generated final response (408, 483,
    /// 487, 500, ...) directly through the stack's stateful-reply
    /// primitive, bypassing `forward_response`'s dedup (there is nothing
    /// to dedup against — this is always the core, not a branch,
    /// producing the response).
    pub async fn generate_response(
        &mut self,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
        status: rsip::StatusCode,
        reason: Option<String>,
        call_id: &str,
    ) -> Result<(), String> {
        let status_code: u16 = status.clone().into();
        transport
            .stateful_reply(&self.handle, status, reason, Vec::new(), Vec::new())
            .await?;
        self.last_forwarded_status = Some(status_code);
        if self.is_invite() && Self::is_final(status_code) {
            cdr.post_cdr(
                call_id,
                CdrEvent::Stop {
                    side: CdrSide::Application,
                    reason: CdrReason::CallRejected,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Whether `candidate` is a retransmission of the original request:
    /// same method, assuming the caller has already matched on Call-ID
    /// (the controller's job, per the registry design).
    pub fn is_retransmission(&self, candidate: &rsip::Request) -> bool {
        candidate.method == self.request.method
            && candidate.cseq_header().ok().map(|h| h.to_string())
                == self.request.cseq_header().ok().map(|h| h.to_string())
    }
}

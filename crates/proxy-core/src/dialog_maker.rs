//! Incoming-INVITE response composer.
//!
//! A remote client deciding how to answer an incoming INVITE (ringing,
//! declining, answering with a locally-built SDP, ...) does not speak SIP
//! wire format; it hands back a status code, an optional reason phrase,
//! and a bag of header name/value pairs over the control channel. This
//! module turns that bag into an actual [`rsip::Response`] and issues it
//! on the matching server transaction.
//!
//! Like [`crate::proxy::controller::ProxyController::proxy_request`], the
//! control-channel-facing entry point here — `respond_to_sip_request` —
//! only ever marshals a command onto the event-loop queue. The stack
//! mutation happens in `do_respond_to_sip_request`, on the event-loop
//! thread.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::headers::{classify_header, HeaderDecision};
use crate::transport::{ServerTransactionHandle, SipTransport};

/// One incoming INVITE transaction awaiting a delayed response from a
/// remote client, registered under both its SIP-stack handle (`irq`) and
/// the opaque message id the control channel assigned it.
#[derive(Debug, Clone)]
struct InviteInProgress {
    irq: ServerTransactionHandle,
    msg_id: String,
}

/// The payload a `respond_to_sip_request` command carries across threads.
pub struct RespondToSipRequestCommand {
    pub msg_id: String,
    pub payload: Value,
}

/// Registries and cross-thread posting for incoming-INVITE responses.
/// Holds no proxying state of its own — each IIP is independent of any
/// [`crate::proxy::core::ProxyCore`].
pub struct DialogMaker {
    by_irq: DashMap<ServerTransactionHandle, InviteInProgress>,
    by_msg_id: DashMap<String, InviteInProgress>,
    cmd_tx: mpsc::Sender<RespondToSipRequestCommand>,
    cmd_rx: tokio::sync::Mutex<Option<mpsc::Receiver<RespondToSipRequestCommand>>>,
    transport: Arc<dyn SipTransport>,
}

impl DialogMaker {
    pub fn new(transport: Arc<dyn SipTransport>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        DialogMaker {
            by_irq: DashMap::new(),
            by_msg_id: DashMap::new(),
            cmd_tx,
            cmd_rx: tokio::sync::Mutex::new(Some(cmd_rx)),
            transport,
        }
    }

    /// Register an IIP under both keys. Called from the event-loop thread
    /// when an incoming INVITE is first surfaced to the control channel.
    pub fn add_incoming_invite_transaction(
        &self,
        _leg: &str,
        irq: ServerTransactionHandle,
        msg_id: String,
    ) {
        let iip = InviteInProgress {
            irq: irq.clone(),
            msg_id: msg_id.clone(),
        };
        self.by_irq.insert(irq, iip.clone());
        self.by_msg_id.insert(msg_id, iip);
    }

    /// Control-channel entry point: posts to the event loop without
    /// touching either registry on the caller's thread.
    pub async fn respond_to_sip_request(&self, msg_id: String, payload: Value) {
        if self
            .cmd_tx
            .send(RespondToSipRequestCommand { msg_id, payload })
            .await
            .is_err()
        {
            error!("failed to post respondToSipRequest to event loop, queue closed");
        }
    }

    /// Drain `respond_to_sip_request` commands until the channel closes.
    /// Intended to run alongside
    /// [`crate::proxy::controller::ProxyController::run_event_loop`] on
    /// the same event-loop task (e.g. as another arm of its `select!`).
    pub async fn run_event_loop(&self) {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .await
            .take()
            .expect("run_event_loop called more than once");
        while let Some(cmd) = cmd_rx.recv().await {
            self.do_respond_to_sip_request(&cmd.msg_id, &cmd.payload).await;
        }
    }

    /// Event-loop-thread implementation of `respond_to_sip_request`. The
    /// wire payload nests everything under `data`, matching the control
    /// channel's actual JSON shape (`{ data: { code, status?, opts?: {
    /// headers? } } }`), not a flattened top-level object.
    async fn do_respond_to_sip_request(&self, msg_id: &str, payload: &Value) {
        let Some(iip) = self.by_msg_id.get(msg_id).map(|e| e.clone()) else {
            warn!(msg_id, "respondToSipRequest: no IIP registered under this message id");
            return;
        };

        let data = payload.get("data");

        let Some(code) = data.and_then(|d| d.get("code")).and_then(Value::as_u64) else {
            error!(msg_id, "respondToSipRequest: payload missing integer \"data.code\"");
            return;
        };
        let code = code as u16;

        let reason = data
            .and_then(|d| d.get("status"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let mut out_headers = Vec::new();
        if let Some(headers) = data
            .and_then(|d| d.get("opts"))
            .and_then(|o| o.get("headers"))
            .and_then(Value::as_object)
        {
            for (name, value) in headers {
                let Some(value) = value.as_str() else {
                    error!(msg_id, header = %name, "respondToSipRequest: header value is not a string, skipping");
                    continue;
                };
                match classify_header(name, value) {
                    HeaderDecision::Immutable(canon) => {
                        error!(msg_id, header = %canon, "respondToSipRequest: refusing client override of immutable header");
                    }
                    HeaderDecision::Mapped(wire_name) => {
                        out_headers.push(mapped_header(wire_name, value));
                    }
                    HeaderDecision::Custom => {
                        out_headers.push(rsip::Header::Other(name.clone(), value.to_string()));
                    }
                    HeaderDecision::Malformed(why) => {
                        error!(msg_id, header = %name, %why, "respondToSipRequest: rejecting malformed header");
                    }
                }
            }
        }

        let status = rsip::StatusCode::from(code);
        if let Err(reason_err) = self
            .transport
            .stateful_reply(&iip.irq, status, reason, out_headers, Vec::new())
            .await
        {
            error!(msg_id, reason = %reason_err, "failed to issue composed response");
        }

        if code >= 200 {
            self.by_msg_id.remove(msg_id);
            self.by_irq.remove(&iip.irq);
            debug!(msg_id, code, "IIP finalized and removed");
        }
    }
}


/// Emit a header already known to be in [`crate::headers::MAPPED_HEADERS`]
/// under its canonical wire name. Built via the untyped `Other` variant
/// rather than each header's individual typed constructor — the same
/// tradeoff made for `Record-Route` in `transaction::client` — since the
/// value here is always an opaque string handed up from a remote client,
/// not something this crate needs to parse back apart.
fn mapped_header(wire_name: &'static str, value: &str) -> rsip::Header {
    rsip::Header::Other(wire_name.to_string(), value.to_string())
}

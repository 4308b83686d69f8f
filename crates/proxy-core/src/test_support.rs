//! Shared fixtures for in-crate unit tests: minimal but RFC-3261-shaped
//! request/response builders and no-op collaborator stubs. Not part of
//! the public API — gated entirely behind `#[cfg(test)]` in `lib.rs`.

/// Build a minimal INVITE addressed to `target`, with a synthetic
/// Call-ID, From/To/CSeq, and an initial Max-Forwards of 70 — enough for
/// the transaction-layer code under test to read the headers it cares
/// about (Max-Forwards, CSeq method/seq, Call-ID).
pub fn sample_invite(call_id: &str, target: &str) -> rsip::Request {
    sample_request(rsip::Method::Invite, call_id, target, 1)
}

pub fn sample_request(
    method: rsip::Method,
    call_id: &str,
    target: &str,
    seq: u32,
) -> rsip::Request {
    let uri = rsip::Uri::try_from(target).expect("valid test URI");
    let headers: Vec<rsip::Header> = vec![
        rsip::Header::Via("SIP/2.0/UDP upstream.example.com:5060;branch=z9hG4bK-upstream".into()),
        rsip::Header::CallId(call_id.to_string().into()),
        rsip::Header::From("<sip:caller@example.com>;tag=abc123".into()),
        rsip::Header::To("<sip:callee@example.com>".into()),
        rsip::Header::CSeq(
            rsip::typed::CSeq {
                seq,
                method,
            }
            .into(),
        ),
        rsip::Header::MaxForwards(70.into()),
    ];
    rsip::Request {
        method,
        uri,
        headers: headers.into(),
        body: Vec::new(),
        version: rsip::Version::V2,
    }
}

/// Build a response to `req` carrying `status`, copying Call-ID, From,
/// To, and CSeq (with the Via branch the test supplies, simulating what
/// a downstream target would actually echo back).
pub fn sample_response(req: &rsip::Request, status: u16, branch: &str) -> rsip::Response {
    use rsip::prelude::HeadersExt;
    let mut headers = rsip::Headers::default();
    headers.push(rsip::Header::Via(
        format!("SIP/2.0/UDP downstream.example.com:5060;branch={branch}").into(),
    ));
    if let Ok(call_id) = req.call_id_header() {
        headers.push(rsip::Header::CallId(call_id.clone()));
    }
    if let Ok(from) = req.from_header() {
        headers.push(rsip::Header::From(from.clone()));
    }
    headers.push(rsip::Header::To("<sip:callee@example.com>;tag=xyz789".into()));
    if let Ok(cseq) = req.cseq_header() {
        headers.push(rsip::Header::CSeq(cseq.clone()));
    }
    rsip::Response {
        status_code: status.into(),
        version: rsip::Version::V2,
        headers,
        body: Vec::new(),
    }
}

/// Extract the branch parameter this crate stamped onto `req`'s topmost
/// Via, for tests that assert on what was actually sent.
pub fn via_branch(req: &rsip::Request) -> Option<String> {
    use rsip::prelude::HeadersExt;
    let via = req.via_header().ok()?;
    let raw = via.to_string();
    raw.split("branch=")
        .nth(1)
        .map(|rest| rest.split(';').next().unwrap_or(rest).trim().to_string())
}

use std::sync::Mutex;

use async_trait::async_trait;

use crate::cdr::{CdrEvent, CdrSink};
use crate::transport::{
    ControlChannel, ControlOutcome, PendingProxyRequest, PendingRequestStore,
    ServerTransactionHandle, SipTransport,
};

/// An in-memory [`SipTransport`] that records every call instead of
/// touching a network. `send_failures` lets a test make specific target
/// URIs fail, exercising the `SendFailure` path.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent_requests: Mutex<Vec<(rsip::Request, rsip::Uri)>>,
    pub forwarded_responses: Mutex<Vec<(ServerTransactionHandle, rsip::Response)>>,
    pub stateful_replies: Mutex<Vec<(ServerTransactionHandle, rsip::StatusCode)>>,
    pub send_failures: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn fail_target(&self, uri: &str) {
        self.send_failures.lock().unwrap().push(uri.to_string());
    }
}

#[async_trait]
impl SipTransport for RecordingTransport {
    async fn send_request(
        &self,
        request: rsip::Request,
        destination: &rsip::Uri,
    ) -> Result<(), String> {
        let dest = destination.to_string();
        if self.send_failures.lock().unwrap().iter().any(|f| f == &dest) {
            return Err(format!("simulated send failure to {dest}"));
        }
        self.sent_requests
            .lock()
            .unwrap()
            .push((request, destination.clone()));
        Ok(())
    }

    async fn forward_response(
        &self,
        server_txn: &ServerTransactionHandle,
        response: rsip::Response,
    ) -> Result<(), String> {
        self.forwarded_responses
            .lock()
            .unwrap()
            .push((server_txn.clone(), response));
        Ok(())
    }

    async fn stateful_reply(
        &self,
        server_txn: &ServerTransactionHandle,
        status: rsip::StatusCode,
        _reason: Option<String>,
        _headers: Vec<rsip::Header>,
        _body: Vec<u8>,
    ) -> Result<(), String> {
        self.stateful_replies
            .lock()
            .unwrap()
            .push((server_txn.clone(), status));
        Ok(())
    }
}

/// An in-memory [`CdrSink`] that records every posted event.
#[derive(Default)]
pub struct RecordingCdrSink {
    pub events: Mutex<Vec<(String, CdrEvent)>>,
}

#[async_trait]
impl CdrSink for RecordingCdrSink {
    async fn post_cdr(&self, call_id: &str, event: CdrEvent) {
        self.events
            .lock()
            .unwrap()
            .push((call_id.to_string(), event));
    }
}

/// An in-memory [`ControlChannel`] that records every reply.
#[derive(Default)]
pub struct RecordingControlChannel {
    pub replies: Mutex<Vec<(String, ControlOutcome, Option<serde_json::Value>)>>,
}

#[async_trait]
impl ControlChannel for RecordingControlChannel {
    async fn route_api_response(
        &self,
        client_msg_id: &str,
        outcome: ControlOutcome,
        body: Option<serde_json::Value>,
    ) {
        self.replies
            .lock()
            .unwrap()
            .push((client_msg_id.to_string(), outcome, body));
    }
}

/// A [`PendingRequestStore`] backed by a fixed in-memory table, for tests
/// that drive `ProxyController::proxy_request` without a real registrar.
#[derive(Default)]
pub struct FixedPendingRequestStore {
    pub pending: Mutex<std::collections::HashMap<String, PendingProxyRequest>>,
}

impl FixedPendingRequestStore {
    pub fn with(transaction_id: &str, request: PendingProxyRequest) -> Self {
        let store = FixedPendingRequestStore::default();
        store
            .pending
            .lock()
            .unwrap()
            .insert(transaction_id.to_string(), request);
        store
    }
}

#[async_trait]
impl PendingRequestStore for FixedPendingRequestStore {
    async fn find_and_remove(&self, transaction_id: &str) -> Option<PendingProxyRequest> {
        self.pending.lock().unwrap().remove(transaction_id)
    }
}

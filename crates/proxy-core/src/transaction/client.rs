//! RFC 3261 client transaction state machine, one per forked branch.
//!
//! A [`ClientTransaction`] does not own a reference to its parent
//! [`crate::proxy::core::ProxyCore`] — per the cyclic-ownership note, the
//! parent owns its children uniquely and any code that needs to act on a
//! sibling (CDR posting, forwarding) is driven by the parent, which passes
//! in whatever collaborators (transport, CDR sink, timer manager) the
//! operation needs. Timer firings carry a branch key, not a pointer, and
//! are looked up in the parent's client list at fire time.

use std::sync::Arc;
use std::time::Duration;

use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use tracing::{debug, warn};

use crate::cdr::{stop_reason_for_status, CdrEvent, CdrReason, CdrSide, CdrSink};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::timer::{TimerClass, TimerFired, TimerHandle, TimerKind, TimerManager};
use crate::transaction::key::BranchKey;
use crate::transport::SipTransport;

/// States a client transaction moves through. `NotStarted` exists so a
/// [`crate::proxy::core::ProxyCore`] can hold a branch that has not yet
/// been launched (serial launch policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NotStarted,
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// One forked branch of a proxied request.
pub struct ClientTransaction {
    branch: BranchKey,
    target: rsip::Uri,
    request: rsip::Request,
    state: ClientState,
    /// Final status stored once the branch completes; `None` until then.
    final_response: Option<rsip::Response>,
    /// Synthetic or observed status used for best-response ranking even
    /// before a real final response has been stored (e.g. 503 on send
    /// failure, 408 on timeout).
    status: Option<u16>,
    retransmit_count: u32,
    retransmit_interval: Duration,
    transmit_count: u32,
    timer_a: Option<TimerHandle>,
    timer_b: Option<TimerHandle>,
    timer_c: Option<TimerHandle>,
    timer_d: Option<TimerHandle>,
}

impl ClientTransaction {
    /// Build a not-yet-started branch targeting `target`. `request` is
    /// the template to fork — the branch clones and mutates it on
    /// [`ClientTransaction::forward_request`].
    pub fn new(target: rsip::Uri, request: rsip::Request) -> Self {
        ClientTransaction {
            branch: BranchKey::generate(),
            target,
            request,
            state: ClientState::NotStarted,
            final_response: None,
            status: None,
            retransmit_count: 0,
            retransmit_interval: Duration::ZERO,
            transmit_count: 0,
            timer_a: None,
            timer_b: None,
            timer_c: None,
            timer_d: None,
        }
    }

    pub fn branch(&self) -> &BranchKey {
        &self.branch
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn final_response(&self) -> Option<&rsip::Response> {
        self.final_response.as_ref()
    }

    /// This branch's forwarding target, needed by the parent to know
    /// where a CANCEL it builds for this branch should be sent.
    pub fn cancel_target(&self) -> rsip::Uri {
        self.target.clone()
    }

    pub fn is_invite(&self) -> bool {
        self.request.method == rsip::Method::Invite
    }

    fn cancel_timers_a_b(&mut self) {
        if let Some(t) = self.timer_a.take() {
            t.cancel();
        }
        if let Some(t) = self.timer_b.take() {
            t.cancel();
        }
    }

    fn cancel_timer_c(&mut self) {
        if let Some(t) = self.timer_c.take() {
            t.cancel();
        }
    }

    fn cancel_timer_d(&mut self) {
        if let Some(t) = self.timer_d.take() {
            t.cancel();
        }
    }

    /// Mutate a clone of the template request for transmission: decrement
    /// or insert Max-Forwards, rewrite the Request-URI to the branch
    /// target, optionally append Record-Route and the core's custom
    /// header string, and stamp the Via branch. Record-Route is only
    /// appended when the core was asked to record-route (`record_route`)
    /// *and* the embedding application configured a canonical Record-Route
    /// URI to insert — either alone is not enough, per spec.md §4.1.2 step 3.
    fn build_wire_request(
        &self,
        config: &ProxyConfig,
        custom_headers: &[rsip::Header],
        record_route: bool,
    ) -> rsip::Request {
        let mut req = self.request.clone();
        req.uri = self.target.clone();

        let mut found_mf = false;
        let mut rebuilt: Vec<rsip::Header> = Vec::with_capacity(req.headers.iter().count());
        for header in req.headers.iter() {
            match header {
                rsip::Header::MaxForwards(mf) => {
                    found_mf = true;
                    let decremented = mf
                        .value()
                        .trim()
                        .parse::<u32>()
                        .unwrap_or(config.default_max_forwards)
                        .saturating_sub(1);
                    rebuilt.push(rsip::Header::MaxForwards(decremented.into()));
                }
                other => rebuilt.push(other.clone()),
            }
        }
        if !found_mf {
            rebuilt.push(rsip::Header::MaxForwards(config.default_max_forwards.into()));
        }
        req.headers = rebuilt.into();

        if record_route {
            if let Some(rr) = &config.record_route {
                req.headers
                    .push(rsip::Header::RecordRoute(format!("<{rr}>").into()));
            }
        }

        for h in custom_headers {
            req.headers.push(h.clone());
        }

        req.headers.push(rsip::Header::Via(
            format!(
                "SIP/2.0/UDP {};branch={}",
                config.local_sent_by, self.branch
            )
            .into(),
        ));

        req
    }

    /// Transmit (or retransmit) the request for this branch. On first
    /// transmission of an INVITE branch, posts a `CdrAttempt`. On send
    /// failure, transitions to `terminated` with synthetic 503 and
    /// returns the error so the parent can fold it into accounting.
    pub async fn forward_request(
        &mut self,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
        config: &ProxyConfig,
        custom_headers: &[rsip::Header],
        call_id: &str,
        record_route: bool,
    ) -> ProxyResult<()> {
        let wire_req = self.build_wire_request(config, custom_headers, record_route);
        self.transmit_count += 1;
        if self.is_invite() && self.transmit_count == 1 {
            cdr.post_cdr(call_id, CdrEvent::Attempt { side: CdrSide::Network })
                .await;
        }

        match transport.send_request(wire_req, &self.target).await {
            Ok(()) => {
                if self.state == ClientState::NotStarted {
                    self.state = ClientState::Calling;
                }
                Ok(())
            }
            Err(reason) => {
                self.cancel_timers_a_b();
                self.cancel_timer_c();
                self.state = ClientState::Terminated;
                self.status = Some(503);
                warn!(branch = %self.branch, %reason, "downstream send failed, branch terminated with synthetic 503");
                Err(ProxyError::SendFailure {
                    branch: self.branch.to_string(),
                    reason,
                })
            }
        }
    }

    /// Arm Timer A (retransmit) and Timer B (transaction timeout) on
    /// entering `calling`, plus Timer C if this is an INVITE branch.
    /// Non-INVITE branches do not use Timer A/D in this crate's scope (no
    /// non-INVITE forking scenario is specified), but Timer C/B still
    /// bound how long a branch may stay outstanding.
    pub fn arm_initial_timers(&mut self, timers: &TimerManager, config: &ProxyConfig) {
        if self.is_invite() {
            self.timer_a = Some(timers.schedule(
                TimerClass::Default,
                self.branch.clone(),
                TimerKind::A,
                config.t1,
            ));
            self.retransmit_interval = config.t1;
        }
        self.timer_b = Some(timers.schedule(
            TimerClass::Default,
            self.branch.clone(),
            TimerKind::B,
            config.timer_b,
        ));
        self.timer_c = Some(timers.schedule(
            TimerClass::C,
            self.branch.clone(),
            TimerKind::C,
            config.timer_c,
        ));
    }

    /// Timer A fired: retransmit and double the interval, up to the
    /// configured cap, then re-arm.
    pub async fn on_timer_a(
        &mut self,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
        config: &ProxyConfig,
        custom_headers: &[rsip::Header],
        call_id: &str,
        timers: &TimerManager,
        record_route: bool,
    ) {
        if self.state != ClientState::Calling {
            return;
        }
        self.retransmit_count += 1;
        debug!(branch = %self.branch, count = self.retransmit_count, "timer A fired, retransmitting");
        let _ = self
            .forward_request(transport, cdr, config, custom_headers, call_id, record_route)
            .await;
        if self.state == ClientState::Calling {
            self.retransmit_interval = (self.retransmit_interval * 2).min(config.t2_cap);
            self.timer_a = Some(timers.schedule(
                TimerClass::Default,
                self.branch.clone(),
                TimerKind::A,
                self.retransmit_interval,
            ));
        }
    }

    /// Timer B fired: the branch timed out waiting for any response.
    pub fn on_timer_b(&mut self) -> ProxyResult<()> {
        if self.state != ClientState::Calling {
            return Ok(());
        }
        self.cancel_timers_a_b();
        self.cancel_timer_c();
        self.state = ClientState::Terminated;
        self.status = Some(408);
        Err(ProxyError::TimeoutB {
            branch: self.branch.to_string(),
        })
    }

    /// Timer C fired: if still `proceeding`, this branch must be
    /// canceled; the CANCEL is built here, while the branch is still
    /// `proceeding` (the only state [`ClientTransaction::build_cancel`]
    /// allows), and handed back for the parent to actually transmit —
    /// it owns the decision of where to send it. Either way the branch
    /// terminates with synthetic 408.
    pub fn on_timer_c(&mut self, config: &ProxyConfig) -> (ProxyResult<()>, Option<rsip::Request>) {
        let cancel = if self.state == ClientState::Proceeding {
            self.build_cancel(config)
        } else {
            None
        };
        if self.state == ClientState::Calling || self.state == ClientState::Proceeding {
            self.cancel_timers_a_b();
            self.state = ClientState::Terminated;
            self.status = Some(408);
            return (
                Err(ProxyError::TimeoutC {
                    branch: self.branch.to_string(),
                }),
                cancel,
            );
        }
        (Ok(()), None)
    }

    /// Timer D fired: a completed branch is swept to terminated.
    pub fn on_timer_d(&mut self) {
        if self.state == ClientState::Completed {
            self.state = ClientState::Terminated;
        }
    }

    /// A response arrived on this branch. Returns the portion, if any,
    /// that the parent must forward upstream immediately (1xx >100, or a
    /// first-seen 2xx). Responses >=300 are stored for best-response
    /// selection rather than forwarded here. Returns `None` for responses
    /// that are discarded outright (100 Trying, late arrivals, responses
    /// to our own CANCEL, retransmitted finals).
    pub async fn process_response(
        &mut self,
        response: rsip::Response,
        timers: &TimerManager,
        config: &ProxyConfig,
        cdr: &Arc<dyn CdrSink>,
        call_id: &str,
    ) -> Option<rsip::Response> {
        if self.state == ClientState::Terminated {
            debug!(branch = %self.branch, "discarding response on terminated branch");
            return None;
        }

        if let Ok(cseq) = response.cseq_header().and_then(|h| h.typed()) {
            if cseq.method == rsip::Method::Cancel {
                debug!(branch = %self.branch, "discarding response to our own CANCEL");
                return None;
            }
        }

        let status: u16 = response.status_code.clone().into();

        if (100..200).contains(&status) {
            if status == 100 {
                debug!(branch = %self.branch, "discarding 100 Trying, stateful proxy absorbs it");
                return None;
            }
            if self.state == ClientState::Calling {
                self.cancel_timers_a_b();
                self.state = ClientState::Proceeding;
            }
            self.cancel_timer_c();
            self.timer_c = Some(timers.schedule(
                TimerClass::C,
                self.branch.clone(),
                TimerKind::C,
                config.timer_c,
            ));
            return Some(response);
        }

        if (200..300).contains(&status) {
            self.cancel_timers_a_b();
            self.cancel_timer_c();
            self.state = ClientState::Terminated;
            self.status = Some(status);
            if self.is_invite() {
                cdr.post_cdr(
                    call_id,
                    CdrEvent::Start {
                        side: CdrSide::Network,
                        reason: CdrReason::ProxyUac,
                    },
                )
                .await;
            }
            return Some(response);
        }

        // >= 300: store for best-response selection, ACK locally
        // (non-INVITE branches have no ACK step but the state transition
        // still applies).
        self.cancel_timers_a_b();
        self.cancel_timer_c();
        self.state = ClientState::Completed;
        self.status = Some(status);
        self.final_response = Some(response.clone());
        self.timer_d = Some(timers.schedule(
            TimerClass::D,
            self.branch.clone(),
            TimerKind::D,
            config.timer_d,
        ));
        if self.is_invite() {
            cdr.post_cdr(
                call_id,
                CdrEvent::Stop {
                    side: CdrSide::Network,
                    reason: stop_reason_for_status(status),
                },
            )
            .await;
        }
        None
    }

    /// A retransmitted final for an already-`completed` branch: re-ACK
    /// locally, forward nothing.
    pub fn note_retransmitted_final(&self) {
        debug!(branch = %self.branch, "retransmitted final absorbed, re-acking locally");
    }

    /// Build a stateless CANCEL for this branch. Legal only while
    /// `proceeding`; a no-op (returns `None`) in every other state,
    /// matching the source's behavior of silently dropping cancels that
    /// arrive too early or too late rather than deferring them. The CANCEL
    /// copies To/From/Call-ID/Max-Forwards from the original inbound
    /// request but gets its own Via, stamped with this branch's own
    /// branch key rather than the upstream Via the inbound request
    /// carried — the CANCEL belongs to this branch's own transaction, not
    /// the original one.
    pub fn build_cancel(&self, config: &ProxyConfig) -> Option<rsip::Request> {
        if self.state != ClientState::Proceeding {
            return None;
        }
        let mut headers = rsip::Headers::default();
        headers.push(rsip::Header::Via(
            format!(
                "SIP/2.0/UDP {};branch={}",
                config.local_sent_by, self.branch
            )
            .into(),
        ));
        for h in self.request.headers.iter() {
            match h {
                rsip::Header::From(_) | rsip::Header::To(_) | rsip::Header::CallId(_) => {
                    headers.push(h.clone())
                }
                rsip::Header::CSeq(cseq) => {
                    if let Ok(typed) = cseq.typed() {
                        headers.push(rsip::Header::CSeq(
                            rsip::typed::CSeq {
                                seq: typed.seq,
                                method: rsip::Method::Cancel,
                            }
                            .into(),
                        ));
                    }
                }
                rsip::Header::MaxForwards(_) => headers.push(h.clone()),
                _ => {}
            }
        }
        Some(rsip::Request {
            method: rsip::Method::Cancel,
            uri: self.target.clone(),
            headers,
            body: Vec::new(),
            version: rsip::Version::V2,
        })
    }

    /// Drop all timers. Called when the branch is swept by the parent.
    pub fn cleanup_timers(&mut self) {
        self.cancel_timers_a_b();
        self.cancel_timer_c();
        self.cancel_timer_d();
    }
}

//! Proxy controller: the registries, command dispatch, and cross-thread
//! posting that sit above individual [`ProxyCore`]s.
//!
//! Only two entry points are reachable from an arbitrary control-channel
//! thread: [`ProxyController::proxy_request`] and the dialog maker's
//! `respond_to_sip_request` (in [`crate::dialog_maker`]). Everything else
//! — inbound SIP requests and responses, timer firings — is assumed to
//! already be running on the single event-loop task, matching how the
//! SIP stack callback and the timer-fired channel are drained by
//! [`ProxyController::run_event_loop`].

use std::sync::Arc;

use dashmap::DashMap;
use rsip::prelude::HeadersExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cdr::{CdrEvent, CdrReason, CdrSide, CdrSink};
use crate::config::ProxyConfig;
use crate::proxy::core::{LaunchPolicy, ProxyCore, ProxyFlags};
use crate::timer::{TimerFired, TimerManager};
use crate::transaction::key::BranchKey;
use crate::transport::{
    ControlChannel, ControlOutcome, PendingRequestStore, ServerTransactionHandle, SipTransport,
};

/// Arguments for a `proxy_request` command, mirroring the control
/// channel's wire shape one field at a time rather than as raw JSON.
pub struct ProxyRequestCommand {
    pub client_msg_id: String,
    pub transaction_id: String,
    pub record_route: bool,
    pub full_response: bool,
    pub follow_redirects: bool,
    pub targets: Vec<rsip::Uri>,
    pub custom_headers: Vec<rsip::Header>,
    pub launch_policy: LaunchPolicy,
}

/// Work items posted onto the event-loop task's queue. `DoProxy` is the
/// only command a control-channel thread ever posts; the rest are
/// produced internally.
enum ControllerCommand {
    DoProxy {
        client_msg_id: String,
        transaction_id: String,
    },
}

/// Owns the call-id and transaction-id registries and drives the single
/// event-loop task that all proxy-core mutation happens on.
pub struct ProxyController {
    call_id_index: DashMap<String, String>,
    cores: DashMap<String, ProxyCore>,
    cmd_tx: mpsc::Sender<ControllerCommand>,
    cmd_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ControllerCommand>>>,
    timer_tx: mpsc::Sender<TimerFired>,
    timer_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TimerFired>>>,
    timers: TimerManager,
    config: ProxyConfig,
    transport: Arc<dyn SipTransport>,
    cdr: Arc<dyn CdrSink>,
    control: Arc<dyn ControlChannel>,
    pending: Arc<dyn PendingRequestStore>,
}

impl ProxyController {
    pub fn new(
        config: ProxyConfig,
        transport: Arc<dyn SipTransport>,
        cdr: Arc<dyn CdrSink>,
        control: Arc<dyn ControlChannel>,
        pending: Arc<dyn PendingRequestStore>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (timer_tx, timer_rx) = mpsc::channel(256);
        let timers = TimerManager::new(timer_tx.clone());
        ProxyController {
            call_id_index: DashMap::new(),
            cores: DashMap::new(),
            cmd_tx,
            cmd_rx: tokio::sync::Mutex::new(Some(cmd_rx)),
            timer_tx,
            timer_rx: tokio::sync::Mutex::new(Some(timer_rx)),
            timers,
            config,
            transport,
            cdr,
            control,
            pending,
        }
    }

    /// `|call_id_index| == |cores|` outside the insertion/removal calls
    /// that maintain both together — the invariant the two registries are
    /// meant to uphold.
    pub fn registry_sizes_match(&self) -> bool {
        self.call_id_index.len() == self.cores.len()
    }

    /// A control thread's read-only admission check: is this Call-ID
    /// currently being proxied.
    pub fn is_proxying_call(&self, call_id: &str) -> bool {
        self.call_id_index.contains_key(call_id)
    }

    fn insert_core(&self, core: ProxyCore) {
        self.call_id_index
            .insert(core.call_id().to_string(), core.transaction_id().to_string());
        self.cores.insert(core.transaction_id().to_string(), core);
    }

    fn remove_by_transaction_id(&self, transaction_id: &str) {
        if let Some((_, core)) = self.cores.remove(transaction_id) {
            self.call_id_index.remove(core.call_id());
        }
    }

    fn remove_by_call_id(&self, call_id: &str) {
        if let Some((_, transaction_id)) = self.call_id_index.remove(call_id) {
            self.cores.remove(&transaction_id);
        }
    }

    // ---- control-channel entry points --------------------------------

    /// Handle a `proxy_request` command. Looks up the buffered pending
    /// request, builds the `ProxyCore`, inserts it into both registries,
    /// then posts `DoProxy` to the event loop. On lookup failure, replies
    /// `NOK` synchronously without touching the event loop at all.
    pub async fn proxy_request(&self, cmd: ProxyRequestCommand) {
        let Some(pending) = self.pending.find_and_remove(&cmd.transaction_id).await else {
            warn!(transaction_id = %cmd.transaction_id, "proxy_request: no pending request buffered");
            self.control
                .route_api_response(&cmd.client_msg_id, ControlOutcome::Nok, None)
                .await;
            return;
        };

        let flags = ProxyFlags {
            record_route: cmd.record_route,
            full_response: cmd.full_response,
            follow_redirects: cmd.follow_redirects,
        };

        let core = ProxyCore::initialize(
            cmd.transaction_id.clone(),
            pending.call_id,
            pending.server_txn,
            pending.request,
            cmd.targets,
            cmd.launch_policy,
            flags,
            cmd.custom_headers,
        );
        self.insert_core(core);

        if self
            .cmd_tx
            .send(ControllerCommand::DoProxy {
                client_msg_id: cmd.client_msg_id.clone(),
                transaction_id: cmd.transaction_id.clone(),
            })
            .await
            .is_err()
        {
            error!("failed to post doProxy to event loop, queue closed");
            self.remove_by_transaction_id(&cmd.transaction_id);
            self.control
                .route_api_response(&cmd.client_msg_id, ControlOutcome::Nok, None)
                .await;
        }
    }

    /// Event-loop-thread implementation of `doProxy`: admission check on
    /// Max-Forwards, provisional 100 Trying, then launch.
    async fn do_proxy(&self, client_msg_id: &str, transaction_id: &str) {
        let max_forwards_exhausted = self
            .cores
            .get(transaction_id)
            .map(|core| {
                core.server_transaction()
                    .request()
                    .headers
                    .iter()
                    .find_map(|h| match h {
                        rsip::Header::MaxForwards(mf) => {
                            use rsip::prelude::UntypedHeader;
                            mf.value().trim().parse::<u32>().ok()
                        }
                        _ => None,
                    })
            })
            .map(|mf| mf == Some(0))
            .unwrap_or(false);

        if max_forwards_exhausted {
            if let Some(mut entry) = self.cores.get_mut(transaction_id) {
                let call_id = entry.call_id().to_string();
                let _ = entry
                    .server_transaction_mut()
                    .generate_response(
                        &self.transport,
                        &self.cdr,
                        rsip::StatusCode::TooManyHops,
                        None,
                        &call_id,
                    )
                    .await;
            }
            self.remove_by_transaction_id(transaction_id);
            self.control
                .route_api_response(client_msg_id, ControlOutcome::Nok, None)
                .await;
            return;
        }

        if let Some(mut entry) = self.cores.get_mut(transaction_id) {
            let call_id = entry.call_id().to_string();
            let _ = entry
                .server_transaction_mut()
                .generate_response(
                    &self.transport,
                    &self.cdr,
                    rsip::StatusCode::Trying,
                    None,
                    &call_id,
                )
                .await;
        }

        let started = if let Some(mut entry) = self.cores.get_mut(transaction_id) {
            entry
                .start_requests(&self.transport, &self.cdr, &self.timers, &self.config)
                .await
        } else {
            0
        };

        if started == 0 {
            if let Some(mut entry) = self.cores.get_mut(transaction_id) {
                let call_id = entry.call_id().to_string();
                let _ = entry
                    .server_transaction_mut()
                    .generate_response(
                        &self.transport,
                        &self.cdr,
                        rsip::StatusCode::ServerInternalError,
                        None,
                        &call_id,
                    )
                    .await;
            }
            self.remove_by_transaction_id(transaction_id);
            self.control
                .route_api_response(client_msg_id, ControlOutcome::Nok, None)
                .await;
            return;
        }

        let full_response = self
            .cores
            .get(transaction_id)
            .map(|c| c.flags().full_response)
            .unwrap_or(true);
        if !full_response {
            self.control
                .route_api_response(
                    client_msg_id,
                    ControlOutcome::Ok,
                    Some(serde_json::json!({"status": "done"})),
                )
                .await;
        }
    }

    // ---- event-loop-thread entry points (called by the SIP stack) ----

    /// Route an inbound response: find the owning `ProxyCore` by Call-ID,
    /// and within it the branch matching the response's Via branch.
    /// Returns `false` if no core owns this Call-ID — the caller is
    /// expected to forward the response statelessly in that case.
    pub async fn process_response(&self, call_id: &str, response: rsip::Response) -> bool {
        let Some(transaction_id) = self.call_id_index.get(call_id).map(|e| e.clone()) else {
            return false;
        };

        let Some(branch) = extract_branch(&response) else {
            debug!(call_id, "response has no Via branch, discarding");
            return true;
        };

        if let Some(mut core) = self.cores.get_mut(&transaction_id) {
            if let Err(e) = core
                .process_response(&branch, response, &self.transport, &self.cdr, &self.timers, &self.config)
                .await
            {
                warn!(%e, "error processing response");
            }
            let done = core.all_clients_terminated() && !core.searching();
            if done {
                drop(core);
                self.remove_by_transaction_id(&transaction_id);
            }
        }
        true
    }

    /// Route-header-bearing in-dialog request: pop the top Route and
    /// forward stateless. BYE posts CDR stops on both sides.
    pub async fn process_request_with_route(&self, mut request: rsip::Request, next_hop: rsip::Uri) {
        let is_bye = request.method == rsip::Method::Bye;
        let call_id = request
            .call_id_header()
            .ok()
            .map(|h| h.to_string())
            .unwrap_or_default();

        let mut popped = false;
        request.headers = request
            .headers
            .iter()
            .filter(|h| {
                if !popped && matches!(h, rsip::Header::Route(_)) {
                    popped = true;
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect::<Vec<_>>()
            .into();

        if let Err(reason) = self.transport.send_request(request, &next_hop).await {
            warn!(%reason, "failed to forward route-header request statelessly");
        }

        if is_bye {
            self.cdr
                .post_cdr(
                    &call_id,
                    CdrEvent::Stop {
                        side: CdrSide::Network,
                        reason: CdrReason::NormalRelease,
                    },
                )
                .await;
            self.cdr
                .post_cdr(
                    &call_id,
                    CdrEvent::Stop {
                        side: CdrSide::Application,
                        reason: CdrReason::NormalRelease,
                    },
                )
                .await;
        }
    }

    /// Route-less in-dialog request: legal only as a CANCEL against an
    /// active proxy transaction. Replies 200 to the CANCEL, synthesizes
    /// 487 upstream, and cascades cancellation to every branch.
    pub async fn process_request_without_route(
        &self,
        request: &rsip::Request,
        server_txn: &ServerTransactionHandle,
    ) {
        if request.method != rsip::Method::Cancel {
            debug!(method = %request.method, "route-less non-CANCEL request, nothing to do");
            return;
        }

        let call_id = request
            .call_id_header()
            .ok()
            .map(|h| h.to_string())
            .unwrap_or_default();

        if let Err(reason) = self
            .transport
            .stateful_reply(server_txn, rsip::StatusCode::OK, None, Vec::new(), Vec::new())
            .await
        {
            warn!(%reason, "failed to reply 200 to CANCEL");
        }

        let Some(transaction_id) = self.call_id_index.get(&call_id).map(|e| e.clone()) else {
            return;
        };

        let cancels = if let Some(mut core) = self.cores.get_mut(&transaction_id) {
            let _ = core
                .server_transaction_mut()
                .generate_response(
                    &self.transport,
                    &self.cdr,
                    rsip::StatusCode::RequestTerminated,
                    None,
                    &call_id,
                )
                .await;
            core.cancel_outstanding_requests(&self.config)
        } else {
            Vec::new()
        };

        for (target, cancel_req) in cancels {
            if let Err(reason) = self.transport.send_request(cancel_req, &target).await {
                warn!(%reason, "failed to send downstream CANCEL");
            }
        }
    }

    // ---- event loop ----------------------------------------------------

    /// Drain both the command queue and the timer-fired queue until both
    /// channels close. Intended to run as a single dedicated task for the
    /// lifetime of the embedding application.
    pub async fn run_event_loop(&self) {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .await
            .take()
            .expect("run_event_loop called more than once");
        let mut timer_rx = self
            .timer_rx
            .lock()
            .await
            .take()
            .expect("run_event_loop called more than once");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ControllerCommand::DoProxy { client_msg_id, transaction_id }) => {
                            self.do_proxy(&client_msg_id, &transaction_id).await;
                        }
                        None => break,
                    }
                }
                fired = timer_rx.recv() => {
                    match fired {
                        Some(fired) => self.dispatch_timer(fired).await,
                        None => break,
                    }
                }
            }
        }
        info!("proxy controller event loop exiting");
    }

    async fn dispatch_timer(&self, fired: TimerFired) {
        // Find which core owns this branch; a linear scan over the small
        // set of live cores is cheap relative to the SIP round trip a
        // fired timer represents, and avoids a third registry keyed by
        // branch.
        let owner = self
            .cores
            .iter()
            .find(|entry| entry.value().clients().iter().any(|c| c.branch() == &fired.branch))
            .map(|entry| entry.key().clone());

        let Some(transaction_id) = owner else {
            return;
        };

        let outcome = if let Some(mut core) = self.cores.get_mut(&transaction_id) {
            core.on_timer(fired, &self.transport, &self.cdr, &self.timers, &self.config)
                .await
        } else {
            return;
        };

        match outcome {
            Ok(Some((target, cancel_req))) => {
                if let Err(reason) = self.transport.send_request(cancel_req, &target).await {
                    warn!(%reason, "failed to send CANCEL triggered by timer C");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%e, "error dispatching timer"),
        }

        let reap = self
            .cores
            .get(&transaction_id)
            .map(|c| c.all_clients_terminated() && !c.searching())
            .unwrap_or(false);
        if reap {
            self.remove_by_transaction_id(&transaction_id);
        }
    }
}

/// Pull the branch parameter out of a response's topmost Via.
fn extract_branch(response: &rsip::Response) -> Option<BranchKey> {
    response.via_header().ok().and_then(|via| {
        let raw = via.to_string();
        raw.split("branch=")
            .nth(1)
            .map(|rest| rest.split(';').next().unwrap_or(rest).trim().to_string())
            .map(BranchKey::from_wire)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        sample_invite, sample_request, sample_response, FixedPendingRequestStore,
        RecordingCdrSink, RecordingControlChannel, RecordingTransport,
    };
    use crate::transport::PendingProxyRequest;

    fn new_controller(
        pending: FixedPendingRequestStore,
    ) -> (
        ProxyController,
        Arc<RecordingTransport>,
        Arc<RecordingCdrSink>,
        Arc<RecordingControlChannel>,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let cdr = Arc::new(RecordingCdrSink::default());
        let control = Arc::new(RecordingControlChannel::default());
        let controller = ProxyController::new(
            ProxyConfig::default(),
            transport.clone(),
            cdr.clone(),
            control.clone(),
            Arc::new(pending),
        );
        (controller, transport, cdr, control)
    }

    fn base_command(targets: Vec<&str>) -> ProxyRequestCommand {
        ProxyRequestCommand {
            client_msg_id: "msg-1".to_string(),
            transaction_id: "txn-1".to_string(),
            record_route: false,
            full_response: true,
            follow_redirects: false,
            targets: targets
                .into_iter()
                .map(|t| rsip::Uri::try_from(t).unwrap())
                .collect(),
            custom_headers: Vec::new(),
            launch_policy: LaunchPolicy::Serial,
        }
    }

    #[tokio::test]
    async fn proxy_request_unknown_transaction_replies_nok_synchronously() {
        let (controller, _transport, _cdr, control) =
            new_controller(FixedPendingRequestStore::default());

        controller.proxy_request(base_command(vec!["sip:a@example.com"])).await;

        let replies = control.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1, ControlOutcome::Nok);
        assert!(!controller.is_proxying_call("call-1"));
    }

    #[tokio::test]
    async fn max_forwards_zero_declines_with_483_and_nok() {
        let mut req = sample_invite("call-mf0", "sip:a@example.com");
        let mut rebuilt: Vec<rsip::Header> = Vec::new();
        for header in req.headers.iter() {
            match header {
                rsip::Header::MaxForwards(_) => rebuilt.push(rsip::Header::MaxForwards(0.into())),
                other => rebuilt.push(other.clone()),
            }
        }
        req.headers = rebuilt.into();
        let pending = FixedPendingRequestStore::with(
            "txn-1",
            PendingProxyRequest {
                server_txn: "irq-1".to_string(),
                call_id: "call-mf0".to_string(),
                request: req,
            },
        );
        let (controller, transport, _cdr, control) = new_controller(pending);

        controller
            .proxy_request(base_command(vec!["sip:a@example.com"]))
            .await;
        controller.do_proxy("msg-1", "txn-1").await;

        let replies = transport.stateful_replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        let status: u16 = replies[0].1.clone().into();
        assert_eq!(status, 483);

        let control_replies = control.replies.lock().unwrap();
        assert!(control_replies
            .iter()
            .any(|(_, outcome, _)| *outcome == ControlOutcome::Nok));
        assert!(!controller.is_proxying_call("call-mf0"));
    }

    #[tokio::test]
    async fn do_proxy_sends_trying_then_launches() {
        let req = sample_invite("call-ok", "sip:a@example.com");
        let pending = FixedPendingRequestStore::with(
            "txn-1",
            PendingProxyRequest {
                server_txn: "irq-1".to_string(),
                call_id: "call-ok".to_string(),
                request: req,
            },
        );
        let (controller, transport, _cdr, control) = new_controller(pending);

        controller
            .proxy_request(base_command(vec!["sip:a@example.com"]))
            .await;
        controller.do_proxy("msg-1", "txn-1").await;

        let replies = transport.stateful_replies.lock().unwrap();
        let status: u16 = replies[0].1.clone().into();
        assert_eq!(status, 100);

        let sent = transport.sent_requests.lock().unwrap();
        assert_eq!(sent.len(), 1);

        // full_response defaulted true, so no early OK/done on the control
        // channel — the caller is waiting for further responses.
        assert!(control.replies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn route_less_cancel_replies_200_then_487_then_cascades() {
        let req = sample_invite("call-cancel", "sip:a@example.com");
        let pending = FixedPendingRequestStore::with(
            "txn-1",
            PendingProxyRequest {
                server_txn: "irq-1".to_string(),
                call_id: "call-cancel".to_string(),
                request: req,
            },
        );
        let (controller, transport, _cdr, _control) = new_controller(pending);
        controller
            .proxy_request(base_command(vec!["sip:a@example.com"]))
            .await;
        controller.do_proxy("msg-1", "txn-1").await;

        // Drive the branch to `proceeding` so it's eligible for a real
        // CANCEL rather than the calling-state no-op.
        let branch = {
            let core = controller.cores.get("txn-1").unwrap();
            core.clients()[0].branch().clone()
        };
        let req_template = {
            let core = controller.cores.get("txn-1").unwrap();
            core.server_transaction().request().clone()
        };
        let resp_180 = sample_response(&req_template, 180, branch.as_str());
        controller.process_response("call-cancel", resp_180).await;

        let cancel_req = sample_request(rsip::Method::Cancel, "call-cancel", "sip:a@example.com", 1);
        let server_txn: ServerTransactionHandle = "irq-1".to_string();
        controller
            .process_request_without_route(&cancel_req, &server_txn)
            .await;

        let replies = transport.stateful_replies.lock().unwrap();
        let statuses: Vec<u16> = replies.iter().map(|(_, s)| s.clone().into()).collect();
        assert!(statuses.contains(&200));
        assert!(statuses.contains(&487));

        let sent = transport.sent_requests.lock().unwrap();
        assert!(sent.iter().any(|(r, _)| r.method == rsip::Method::Cancel));
    }
}

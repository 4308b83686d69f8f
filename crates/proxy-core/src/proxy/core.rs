//! `ProxyCore`: one forking proxy transaction, owning a server transaction
//! and the client transactions forked from it.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cdr::CdrSink;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::timer::{TimerFired, TimerKind, TimerManager};
use crate::transaction::key::BranchKey;
use crate::transaction::{ClientState, ClientTransaction, ServerTransaction};
use crate::transport::SipTransport;

/// How targets are launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Try targets one at a time; only launch the next once the current
    /// one completes without a 2xx.
    Serial,
    /// Launch every target immediately.
    Parallel,
}

/// Per-proxy flags carried from the originating `proxy_request` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyFlags {
    pub record_route: bool,
    pub full_response: bool,
    pub follow_redirects: bool,
}

/// One proxied upstream request: a server transaction plus every client
/// transaction forked from it.
pub struct ProxyCore {
    transaction_id: String,
    call_id: String,
    launch_policy: LaunchPolicy,
    flags: ProxyFlags,
    custom_headers: Vec<rsip::Header>,
    canceled: bool,
    searching: bool,
    server: ServerTransaction,
    clients: Vec<ClientTransaction>,
}

impl ProxyCore {
    /// Build the server transaction and one not-yet-started client
    /// transaction per target.
    pub fn initialize(
        transaction_id: String,
        call_id: String,
        server_handle: crate::transport::ServerTransactionHandle,
        inbound: rsip::Request,
        targets: Vec<rsip::Uri>,
        launch_policy: LaunchPolicy,
        flags: ProxyFlags,
        custom_headers: Vec<rsip::Header>,
    ) -> Self {
        let server = ServerTransaction::new(server_handle, inbound.clone());
        let clients = targets
            .into_iter()
            .map(|target| ClientTransaction::new(target, inbound.clone()))
            .collect();
        ProxyCore {
            transaction_id,
            call_id,
            launch_policy,
            flags,
            custom_headers,
            canceled: false,
            searching: true,
            server,
            clients,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn flags(&self) -> ProxyFlags {
        self.flags
    }

    pub fn searching(&self) -> bool {
        self.searching
    }

    pub fn server_transaction(&self) -> &ServerTransaction {
        &self.server
    }

    pub fn server_transaction_mut(&mut self) -> &mut ServerTransaction {
        &mut self.server
    }

    pub fn clients(&self) -> &[ClientTransaction] {
        &self.clients
    }

    /// Launch every not-started client permitted by the launch policy.
    /// Returns zero immediately if the proxy is no longer searching
    /// (matches the source's early-return when a winner was already
    /// found or the proxy was canceled).
    pub async fn start_requests(
        &mut self,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
        timers: &TimerManager,
        config: &ProxyConfig,
    ) -> u32 {
        if !self.searching {
            return 0;
        }
        let mut started = 0u32;
        for client in self.clients.iter_mut() {
            if client.state() != ClientState::NotStarted {
                continue;
            }
            let result = client
                .forward_request(
                    transport,
                    cdr,
                    config,
                    &self.custom_headers,
                    &self.call_id,
                    self.flags.record_route,
                )
                .await;
            if result.is_ok() {
                client.arm_initial_timers(timers, config);
                started += 1;
                if self.launch_policy == LaunchPolicy::Serial {
                    break;
                }
            }
            // On failure the branch is already terminated with a
            // synthetic 503 and remains eligible for best-response
            // selection; serial launch still moves on to try the next
            // target rather than giving up.
        }
        started
    }

    /// Route an inbound response to the client transaction whose branch
    /// matches, then reap terminated branches. If the branch's final was
    /// ≥300 and we're launching serially, start the next not-yet-tried
    /// target (crank-through) before checking whether every branch has
    /// now terminated; only then forward the best response upstream.
    pub async fn process_response(
        &mut self,
        branch: &BranchKey,
        response: rsip::Response,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
        timers: &TimerManager,
        config: &ProxyConfig,
    ) -> ProxyResult<()> {
        let idx = self.clients.iter().position(|c| c.branch() == branch);
        let Some(idx) = idx else {
            debug!(%branch, "response for unknown branch, discarding");
            return Ok(());
        };

        let incoming_status: u16 = response.status_code.clone().into();

        let to_forward = self.clients[idx]
            .process_response(response, timers, config, cdr, &self.call_id)
            .await;

        if let Some(resp) = to_forward {
            let status: u16 = resp.status_code.clone().into();
            if (200..300).contains(&status) {
                self.server
                    .forward_response(transport, cdr, resp, &self.call_id)
                    .await
                    .map_err(|reason| ProxyError::SendFailure {
                        branch: branch.to_string(),
                        reason,
                    })?;
                for (target, cancel_req) in self.notify_forwarded_2xx(branch, config) {
                    if let Err(e) = transport.send_request(cancel_req, &target).await {
                        tracing::warn!(reason = %e, "failed to send CANCEL to losing branch");
                    }
                }
            } else {
                // 1xx, forwarded immediately and in order.
                self.server
                    .forward_response(transport, cdr, resp, &self.call_id)
                    .await
                    .map_err(|reason| ProxyError::SendFailure {
                        branch: branch.to_string(),
                        reason,
                    })?;
            }
        }

        self.reap_terminated();

        if self.searching && incoming_status >= 300 && self.launch_policy == LaunchPolicy::Serial {
            // serial crank-through: the branch just dispatched to reached
            // a non-2xx final, so start the next not-started target
            // before deciding whether every branch is spent. Must run
            // before the all-terminated check below, or an unlaunched
            // target would be mistaken for an exhausted one.
            self.start_requests(transport, cdr, timers, config).await;
        }

        if self.searching && self.all_clients_terminated() {
            self.forward_best_response(transport, cdr).await?;
        }

        Ok(())
    }

    /// `searching` becomes false once a 2xx is forwarded; cancel every
    /// other non-terminated branch. Returns the CANCELs to transmit,
    /// paired with their target, mirroring
    /// [`ProxyCore::cancel_outstanding_requests`].
    pub fn notify_forwarded_2xx(
        &mut self,
        winner: &BranchKey,
        config: &ProxyConfig,
    ) -> Vec<(rsip::Uri, rsip::Request)> {
        self.searching = false;
        let mut cancels = Vec::new();
        for client in &self.clients {
            if client.branch() != winner && client.state() != ClientState::Terminated {
                if let Some(cancel_req) = client.build_cancel(config) {
                    cancels.push((self.target_for(client), cancel_req));
                }
            }
        }
        cancels
    }

    /// Upstream CANCEL: stop searching and cancel every non-terminated
    /// branch. Returns the CANCEL requests to actually transmit, paired
    /// with their target, since cancellation is the parent's
    /// responsibility to dispatch through the transport.
    pub fn cancel_outstanding_requests(
        &mut self,
        config: &ProxyConfig,
    ) -> Vec<(rsip::Uri, rsip::Request)> {
        self.canceled = true;
        self.searching = false;
        let mut cancels = Vec::new();
        for client in &self.clients {
            if client.state() != ClientState::Terminated {
                if let Some(cancel_req) = client.build_cancel(config) {
                    cancels.push((self.target_for(client), cancel_req));
                }
            }
        }
        cancels
    }

    fn target_for(&self, client: &ClientTransaction) -> rsip::Uri {
        // The CANCEL's destination is always the branch's own target.
        client.cancel_target()
    }

    /// Timer A/B/C/D dispatch. Returns any CANCEL that must be
    /// transmitted as a result (Timer C on a `proceeding` branch).
    pub async fn on_timer(
        &mut self,
        fired: TimerFired,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
        timers: &TimerManager,
        config: &ProxyConfig,
    ) -> ProxyResult<Option<(rsip::Uri, rsip::Request)>> {
        let idx = self.clients.iter().position(|c| c.branch() == &fired.branch);
        let Some(idx) = idx else {
            return Ok(None);
        };

        let outcome = match fired.kind {
            TimerKind::A => {
                self.clients[idx]
                    .on_timer_a(
                        transport,
                        cdr,
                        config,
                        &[],
                        &self.call_id,
                        timers,
                        self.flags.record_route,
                    )
                    .await;
                None
            }
            TimerKind::B => {
                if let Err(e) = self.clients[idx].on_timer_b() {
                    info!(branch = %fired.branch, "{e}");
                }
                None
            }
            TimerKind::C => {
                let (result, cancel) = self.clients[idx].on_timer_c(config);
                if let Err(e) = result {
                    info!(branch = %fired.branch, "{e}");
                }
                cancel.map(|req| (self.target_for(&self.clients[idx]), req))
            }
            TimerKind::D => {
                self.clients[idx].on_timer_d();
                None
            }
        };

        self.reap_terminated();

        if self.searching && self.exhausted_all_targets() {
            self.forward_best_response(transport, cdr).await?;
        }

        Ok(outcome)
    }

    fn reap_terminated(&mut self) {
        for client in self.clients.iter_mut() {
            if client.state() == ClientState::Terminated {
                client.cleanup_timers();
            }
        }
    }

    /// No branch is still `calling` or `proceeding`.
    pub fn exhausted_all_targets(&self) -> bool {
        !self
            .clients
            .iter()
            .any(|c| matches!(c.state(), ClientState::Calling | ClientState::Proceeding))
    }

    pub fn all_clients_terminated(&self) -> bool {
        self.clients
            .iter()
            .all(|c| c.state() == ClientState::Terminated)
    }

    /// Order completed branches per RFC 3261 §16.7.6 and forward the best
    /// one; if none completed, synthesize 408.
    pub async fn forward_best_response(
        &mut self,
        transport: &Arc<dyn SipTransport>,
        cdr: &Arc<dyn CdrSink>,
    ) -> ProxyResult<()> {
        let best = self
            .clients
            .iter()
            .filter(|c| c.state() == ClientState::Completed && c.final_response().is_some())
            .min_by(|a, b| best_response_order(a, b))
            .map(|winner| (winner.branch().to_string(), winner.final_response().cloned().unwrap()));

        match best {
            Some((branch, resp)) => {
                self.server
                    .forward_response(transport, cdr, resp, &self.call_id)
                    .await
                    .map_err(|reason| ProxyError::SendFailure { branch, reason })?;
            }
            None => {
                self.server
                    .generate_response(
                        transport,
                        cdr,
                        rsip::StatusCode::RequestTimeout,
                        None,
                        &self.call_id,
                    )
                    .await
                    .map_err(|reason| ProxyError::SendFailure {
                        branch: self.transaction_id.clone(),
                        reason,
                    })?;
            }
        }
        self.searching = false;
        Ok(())
    }
}

/// Comparator implementing the best-response ranking from RFC 3261
/// §16.7.6 as narrowed by the source: completed beats incomplete (callers
/// pre-filter to completed only, so this only matters among completed
/// branches); 6xx beats everything; among 4xx, a short priority list of
/// auth/media-negotiation codes beats the rest; otherwise 4xx beats 5xx;
/// otherwise order is arbitrary-but-stable.
fn best_response_order(a: &ClientTransaction, b: &ClientTransaction) -> std::cmp::Ordering {
    let sa = a.status().unwrap_or(600);
    let sb = b.status().unwrap_or(600);
    rank(sa).cmp(&rank(sb))
}

/// 4xx codes the source prefers over an otherwise-lower-ranked 4xx, in
/// priority order.
const PREFERRED_4XX: [u16; 5] = [401, 407, 415, 420, 484];

fn rank(status: u16) -> (u8, u8, u16) {
    if (600..700).contains(&status) {
        return (0, 0, status);
    }
    if (400..500).contains(&status) {
        if let Some(pos) = PREFERRED_4XX.iter().position(|&c| c == status) {
            return (1, pos as u8, status);
        }
        return (2, 0, status);
    }
    if (500..600).contains(&status) {
        return (3, 0, status);
    }
    (4, 0, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_invite, sample_response, RecordingCdrSink, RecordingTransport};

    fn build_core(
        targets: Vec<&str>,
        policy: LaunchPolicy,
    ) -> ProxyCore {
        let req = sample_invite("call-1", targets[0]);
        let targets: Vec<rsip::Uri> = targets
            .into_iter()
            .map(|t| rsip::Uri::try_from(t).unwrap())
            .collect();
        ProxyCore::initialize(
            "txn-1".to_string(),
            "call-1".to_string(),
            "irq-1".to_string(),
            req,
            targets,
            policy,
            ProxyFlags::default(),
            Vec::new(),
        )
    }

    struct Harness {
        transport: Arc<RecordingTransport>,
        transport_dyn: Arc<dyn SipTransport>,
        cdr: Arc<RecordingCdrSink>,
        cdr_dyn: Arc<dyn CdrSink>,
        timers: TimerManager,
        _timer_rx: tokio::sync::mpsc::Receiver<TimerFired>,
        config: ProxyConfig,
    }

    impl Harness {
        fn new() -> Self {
            let transport = Arc::new(RecordingTransport::default());
            let cdr = Arc::new(RecordingCdrSink::default());
            let (tx, rx) = tokio::sync::mpsc::channel(64);
            Harness {
                transport_dyn: transport.clone(),
                transport,
                cdr_dyn: cdr.clone(),
                cdr,
                timers: TimerManager::new(tx),
                _timer_rx: rx,
                config: ProxyConfig::default(),
            }
        }
    }

    #[test]
    fn best_response_order_prefers_6xx_over_everything() {
        let req = sample_invite("call", "sip:a@example.com");
        let mut a = ClientTransaction::new(rsip::Uri::try_from("sip:a@example.com").unwrap(), req.clone());
        let mut b = ClientTransaction::new(rsip::Uri::try_from("sip:b@example.com").unwrap(), req);
        force_status(&mut a, 486);
        force_status(&mut b, 606);
        assert_eq!(best_response_order(&b, &a), std::cmp::Ordering::Less);
    }

    #[test]
    fn best_response_order_prefers_priority_4xx_list() {
        let req = sample_invite("call", "sip:a@example.com");
        let mut a = ClientTransaction::new(rsip::Uri::try_from("sip:a@example.com").unwrap(), req.clone());
        let mut b = ClientTransaction::new(rsip::Uri::try_from("sip:b@example.com").unwrap(), req.clone());
        let mut c = ClientTransaction::new(rsip::Uri::try_from("sip:c@example.com").unwrap(), req);
        force_status(&mut a, 404);
        force_status(&mut b, 407);
        force_status(&mut c, 500);
        let mut all = [&a, &b, &c];
        all.sort_by(|x, y| best_response_order(x, y));
        assert_eq!(all[0].status(), Some(407));
    }

    fn force_status(client: &mut ClientTransaction, status: u16) {
        client.status = Some(status);
    }

    #[tokio::test]
    async fn serial_fork_second_target_succeeds() {
        let mut core = build_core(vec!["sip:a@example.com", "sip:b@example.com"], LaunchPolicy::Serial);
        let h = Harness::new();

        let started = core
            .start_requests(&h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await;
        assert_eq!(started, 1);

        let branch_a = core.clients()[0].branch().clone();
        let resp_486 = sample_response(core.server_transaction().request(), 486, branch_a.as_str());
        core.process_response(&branch_a, resp_486, &h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await
            .unwrap();

        // crank-through should have launched target B
        assert_eq!(core.clients()[1].state(), ClientState::Calling);

        let branch_b = core.clients()[1].branch().clone();
        let resp_200 = sample_response(core.server_transaction().request(), 200, branch_b.as_str());
        core.process_response(&branch_b, resp_200, &h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await
            .unwrap();

        let forwarded = h.transport.forwarded_responses.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        let (_, resp) = &forwarded[0];
        let status: u16 = resp.status_code.clone().into();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn parallel_fork_selects_best_of_completed() {
        let mut core = build_core(
            vec!["sip:a@example.com", "sip:b@example.com", "sip:c@example.com"],
            LaunchPolicy::Parallel,
        );
        let h = Harness::new();
        let started = core
            .start_requests(&h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await;
        assert_eq!(started, 3);

        let branches: Vec<_> = core.clients().iter().map(|c| c.branch().clone()).collect();
        let statuses = [404u16, 407, 500];
        for (branch, status) in branches.iter().zip(statuses.iter()) {
            let resp = sample_response(core.server_transaction().request(), *status, branch.as_str());
            core.process_response(branch, resp, &h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
                .await
                .unwrap();
        }

        let forwarded = h.transport.forwarded_responses.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        let (_, resp) = &forwarded[0];
        let status: u16 = resp.status_code.clone().into();
        assert_eq!(status, 407);
    }

    #[tokio::test]
    async fn winning_2xx_cancels_other_branches() {
        let mut core = build_core(vec!["sip:a@example.com", "sip:b@example.com"], LaunchPolicy::Parallel);
        let h = Harness::new();
        core.start_requests(&h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await;

        let branch_a = core.clients()[0].branch().clone();
        let branch_b = core.clients()[1].branch().clone();

        // B reaches proceeding so it is eligible for CANCEL.
        let resp_180 = sample_response(core.server_transaction().request(), 180, branch_b.as_str());
        core.process_response(&branch_b, resp_180, &h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await
            .unwrap();

        let resp_200 = sample_response(core.server_transaction().request(), 200, branch_a.as_str());
        core.process_response(&branch_a, resp_200, &h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await
            .unwrap();

        assert!(!core.searching());
        let sent = h.transport.sent_requests.lock().unwrap();
        assert!(sent.iter().any(|(req, _)| req.method == rsip::Method::Cancel));
    }

    #[tokio::test]
    async fn no_completed_branch_synthesizes_408() {
        let mut core = build_core(vec!["sip:a@example.com"], LaunchPolicy::Serial);
        let h = Harness::new();
        core.forward_best_response(&h.transport_dyn, &h.cdr_dyn)
            .await
            .unwrap();

        let replies = h.transport.stateful_replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        let status: u16 = replies[0].1.clone().into();
        assert_eq!(status, 408);
    }

    #[tokio::test]
    async fn upstream_cancel_cancels_every_non_terminated_branch() {
        let mut core = build_core(vec!["sip:a@example.com", "sip:b@example.com"], LaunchPolicy::Parallel);
        let h = Harness::new();
        core.start_requests(&h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await;
        let branch_a = core.clients()[0].branch().clone();
        let resp_180 = sample_response(core.server_transaction().request(), 180, branch_a.as_str());
        core.process_response(&branch_a, resp_180, &h.transport_dyn, &h.cdr_dyn, &h.timers, &h.config)
            .await
            .unwrap();

        let cancels = core.cancel_outstanding_requests(&h.config);
        assert!(!core.searching());
        // Only branch A reached `proceeding`; B is still `calling` and a
        // CANCEL there is a no-op per spec.md's permitted alternative, so
        // exactly one CANCEL is produced.
        assert_eq!(cancels.len(), 1);
    }
}

//! Tunables for transaction timers and default proxy behavior.
//!
//! RFC 3261 pins most of these to specific values (T1 = 500ms, Timer B =
//! 64*T1, ...); this struct exists so tests can shrink them and so an
//! embedding application can override the retransmit cap, rather than to
//! suggest the defaults should normally change.

use std::time::Duration;

/// Timer and policy configuration for a [`crate::proxy::ProxyController`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// RFC 3261 T1 (500ms default).
    pub t1: Duration,
    /// Timer B: INVITE client transaction timeout, normally 64*T1.
    pub timer_b: Duration,
    /// Timer C: proxy INVITE timeout, not defined by the transaction layer
    /// itself but required of proxies forwarding INVITE (RFC 3261 §16.6).
    pub timer_c: Duration,
    /// Timer D: wait time for response retransmissions after a completed
    /// INVITE client transaction.
    pub timer_d: Duration,
    /// Cap on the doubling retransmit interval for Timer A (T2).
    pub t2_cap: Duration,
    /// Max-Forwards value inserted when the inbound request has none.
    pub default_max_forwards: u32,
    /// Canonical Record-Route URI inserted into forwarded requests when a
    /// proxy command asks for record-routing. `None` disables the feature
    /// even if a command requests it.
    pub record_route: Option<rsip::Uri>,
    /// This proxy's own `sent-by` host:port, stamped into the Via header
    /// added on top of every forwarded request. The transport layer is
    /// the one actually listening on this address; the core only needs
    /// it to compose a correct Via.
    pub local_sent_by: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            t1: Duration::from_millis(500),
            timer_b: Duration::from_millis(500 * 64),
            timer_c: Duration::from_secs(30),
            timer_d: Duration::from_millis(32_500),
            t2_cap: Duration::from_secs(4),
            default_max_forwards: 70,
            record_route: None,
            local_sent_by: "0.0.0.0:5060".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Build a config with the RFC defaults and no record-route URI.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a record-route URI, enabling record-routing for commands
    /// that request it.
    pub fn with_record_route(mut self, uri: rsip::Uri) -> Self {
        self.record_route = Some(uri);
        self
    }

    /// Set the `sent-by` host:port this proxy stamps into outbound Via
    /// headers.
    pub fn with_local_sent_by(mut self, sent_by: impl Into<String>) -> Self {
        self.local_sent_by = sent_by.into();
        self
    }
}

//! Call detail record posting.
//!
//! The proxy core never writes CDRs anywhere itself; it posts events to
//! whatever [`CdrSink`] the embedding application supplies. A CDR is
//! posted exactly once per INVITE final response per side, which the unit
//! tests in `transaction::client` and `transaction::server` check directly.

use async_trait::async_trait;

/// Which side of the proxy a CDR event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdrSide {
    /// The downstream leg toward a forked target.
    Network,
    /// The upstream leg toward the original caller.
    Application,
}

/// Why a call leg ended, for `CdrStop`/`CdrAttempt` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdrReason {
    /// This proxy generated the final response acting as a UAS.
    ProxyUas,
    /// This proxy generated the final response acting as a UAC.
    ProxyUac,
    /// A BYE completed a call normally.
    NormalRelease,
    /// The call was canceled (response was 487).
    CallCanceled,
    /// The call was rejected (any other non-2xx final).
    CallRejected,
}

/// A single call detail record event.
#[derive(Debug, Clone)]
pub enum CdrEvent {
    /// A leg started successfully (2xx final observed).
    Start { side: CdrSide, reason: CdrReason },
    /// A leg stopped, successfully or not.
    Stop { side: CdrSide, reason: CdrReason },
    /// A downstream attempt was made (first transmit of a forked INVITE).
    Attempt { side: CdrSide },
}

/// External collaborator that records CDR events. The proxy core is
/// agnostic to where these end up — a file, a database, a message bus.
#[async_trait]
pub trait CdrSink: Send + Sync {
    /// Post one CDR event, tagged with the Call-ID it pertains to.
    async fn post_cdr(&self, call_id: &str, event: CdrEvent);
}

/// A [`CdrSink`] that discards everything. Useful as a default when an
/// embedding application has no accounting backend wired up yet.
#[derive(Debug, Default)]
pub struct NullCdrSink;

#[async_trait]
impl CdrSink for NullCdrSink {
    async fn post_cdr(&self, _call_id: &str, _event: CdrEvent) {}
}

/// Classify a final status code into the `(reason)` a CDR stop should
/// carry, per the `call_canceled` vs `call_rejected` split used
/// throughout the controller.
pub fn stop_reason_for_status(status: u16) -> CdrReason {
    if status == 487 {
        CdrReason::CallCanceled
    } else {
        CdrReason::CallRejected
    }
}

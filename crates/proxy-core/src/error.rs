//! Error types for the forking proxy core.
//!
//! Every variant here corresponds to one of the recoverable or terminal
//! conditions the proxy core can reach: an unknown transaction id handed
//! in from the control channel, a branch that exhausted Max-Forwards, a
//! downstream send that failed, and so on. None of these are meant to be
//! fatal to the process — the policy throughout this crate is that a
//! `ProxyError` always resolves into either a defined SIP response or a
//! `NOK` reply on the control channel, never a panic.

use thiserror::Error;

/// Standard result alias used across the proxy core.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// The taxonomy of failures the proxy core can produce.
///
/// Each variant documents, in its propagation, what the caller is expected
/// to do with it — most are absorbed internally and folded into a SIP
/// response or a control-channel outcome rather than bubbled up raw.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    /// No pending request was buffered under the given transaction id.
    ///
    /// Surfaces as `NOK` to the control channel; the command is dropped.
    #[error("unknown transaction: {transaction_id}")]
    UnknownTransaction { transaction_id: String },

    /// The inbound request's Max-Forwards reached zero before forking.
    ///
    /// Resolved by replying 483 upstream, posting a CDR stop with reason
    /// `call_rejected`, deleting the `ProxyCore`, and replying `NOK`.
    #[error("max-forwards exhausted for transaction {transaction_id}")]
    MaxForwardsExceeded { transaction_id: String },

    /// `start_requests` transmitted to zero targets.
    ///
    /// Resolved by replying 500 upstream, posting a CDR stop, deleting the
    /// `ProxyCore`, and replying `NOK`.
    #[error("no targets reachable for transaction {transaction_id}")]
    NoTargetsReachable { transaction_id: String },

    /// The transport's send primitive returned an error for a branch.
    ///
    /// The branch transitions to `terminated` with a synthetic 503 and may
    /// still participate in best-response selection.
    #[error("send failed on branch {branch}: {reason}")]
    SendFailure { branch: String, reason: String },

    /// A message arrived for a branch or dialog that can no longer accept
    /// it (terminated branch, ACK to a non-2xx final). Discarded silently
    /// by the caller; this variant exists so the discard can be logged.
    #[error("late-arriving message for {context}")]
    LateArrivingMessage { context: String },

    /// The dialog maker was asked to set a header the client must not
    /// override. The header is skipped and composition continues.
    #[error("refusing to override immutable header {header}")]
    ImmutableHeaderOverride { header: String },

    /// A custom header's name or value failed validation (bad character
    /// class in the name, or CR/LF in the value). The header is skipped.
    #[error("malformed custom header {header}: {reason}")]
    MalformedCustomHeader { header: String, reason: String },

    /// Timer B (INVITE transaction timeout) fired with no completed
    /// branch to fall back on.
    #[error("timer B expired on branch {branch}")]
    TimeoutB { branch: String },

    /// Timer C (proxy INVITE timeout) fired.
    #[error("timer C expired on branch {branch}")]
    TimeoutC { branch: String },

    /// The cross-thread command queue to the event-loop task was full or
    /// closed. Resolved as `NOK` to the control channel.
    #[error("failed to post command to event loop: {reason}")]
    InternalPostFailure { reason: String },
}

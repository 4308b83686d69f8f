//! Stateful RFC 3261 forking SIP proxy core.
//!
//! This crate owns the transaction state machines (RFC 3261 §17), the
//! forking logic that launches one client transaction per target and
//! picks the best final response per §16.7.6, and the incoming-INVITE
//! response composer used when a remote application answers a call on
//! the proxy's behalf. It does not parse SIP wire format, hold media, or
//! talk to a network socket — those are the caller's responsibility,
//! reached through the facade traits in [`transport`].
//!
//! Everything in this crate runs on a single cooperative event-loop task
//! except the two command entry points explicitly documented as
//! cross-thread: [`proxy::controller::ProxyController::proxy_request`]
//! and [`dialog_maker::DialogMaker::respond_to_sip_request`].

pub mod cdr;
pub mod config;
pub mod dialog_maker;
pub mod error;
pub mod headers;
pub mod proxy;
pub mod timer;
pub mod transaction;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use cdr::{CdrEvent, CdrReason, CdrSide, CdrSink};
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use proxy::controller::{ProxyController, ProxyRequestCommand};
pub use proxy::core::{LaunchPolicy, ProxyFlags};
pub use transport::{ControlChannel, ControlOutcome, PendingRequestStore, SipTransport};

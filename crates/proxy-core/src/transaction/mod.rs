//! Transaction-layer types: the client state machine for each forked
//! branch and the server transaction wrapping the inbound request.

pub mod client;
pub mod key;
pub mod server;

pub use client::{ClientState, ClientTransaction};
pub use key::{BranchKey, TransactionId};
pub use server::ServerTransaction;

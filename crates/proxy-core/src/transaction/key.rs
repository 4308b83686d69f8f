//! Identifiers used to address transactions and branches.

use uuid::Uuid;

/// A unique Via branch for one forked request, of the form
/// `z9hG4bK-<uuid>`. Never reused within the lifetime of a [`crate::proxy::core::ProxyCore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BranchKey(String);

impl BranchKey {
    /// Mint a fresh branch id.
    pub fn generate() -> Self {
        BranchKey(format!("z9hG4bK-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a branch parameter already extracted from a received Via
    /// header. Used when matching an inbound response back to the branch
    /// that sent the request.
    pub fn from_wire(branch: String) -> Self {
        BranchKey(branch)
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The id a remote client uses to refer to a buffered pending request and,
/// later, to the proxy transaction it spawns. Opaque to this crate —
/// assigned and interpreted entirely by the pending-request store, an
/// external collaborator.
pub type TransactionId = String;

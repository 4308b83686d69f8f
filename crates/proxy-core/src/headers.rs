//! Header allow/deny policy for the dialog maker.
//!
//! A remote client composes a final response by handing back a bag of
//! header name/value pairs. Three things can happen to each one:
//!
//! - it names a header the proxy itself must own (From, Via, Call-ID, ...)
//!   and is refused, because letting a client override it would corrupt
//!   transaction identity or contradict a value the proxy already computed
//!   (Content-Length, Record-Route);
//! - it names a header we recognize, in which case it is emitted under its
//!   canonical wire spelling regardless of how the client capitalized it;
//! - it's anything else, in which case it is emitted verbatim provided its
//!   name and value pass a narrow validation grammar that rules out
//!   response splitting.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

/// Headers whose values the composer sets itself. A client attempting to
/// set one of these is refused outright — see [`ImmutableHeaderOverride`](
/// crate::error::ProxyError::ImmutableHeaderOverride).
pub static IMMUTABLE_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "from",
        "to",
        "call_id",
        "cseq",
        "via",
        "route",
        "contact",
        "rseq",
        "rack",
        "record_route",
        "content_length",
        "payload",
    ]
    .into_iter()
    .collect()
});

/// Canonicalized-name → correctly-cased wire name for every standard
/// header a client is allowed to set on a composed response. Anything not
/// in this table but passing [`validate_custom_header`] is still emitted,
/// just under the client's own casing.
pub static MAPPED_HEADERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("user_agent", "User-Agent"),
        ("subject", "Subject"),
        ("max_forwards", "Max-Forwards"),
        ("proxy_require", "Proxy-Require"),
        ("request_disposition", "Request-Disposition"),
        ("accept_contact", "Accept-Contact"),
        ("reject_contact", "Reject-Contact"),
        ("expires", "Expires"),
        ("date", "Date"),
        ("retry_after", "Retry-After"),
        ("timestamp", "Timestamp"),
        ("min_expires", "Min-Expires"),
        ("priority", "Priority"),
        ("call_info", "Call-Info"),
        ("organization", "Organization"),
        ("server", "Server"),
        ("in_reply_to", "In-Reply-To"),
        ("accept", "Accept"),
        ("accept_encoding", "Accept-Encoding"),
        ("accept_language", "Accept-Language"),
        ("allow", "Allow"),
        ("require", "Require"),
        ("supported", "Supported"),
        ("unsupported", "Unsupported"),
        ("event", "Event"),
        ("allow_events", "Allow-Events"),
        ("subscription_state", "Subscription-State"),
        ("proxy_authenticate", "Proxy-Authenticate"),
        ("proxy_authentication_info", "Proxy-Authentication-Info"),
        ("proxy_authorization", "Proxy-Authorization"),
        ("authorization", "Authorization"),
        ("www_authenticate", "WWW-Authenticate"),
        ("authentication_info", "Authentication-Info"),
        ("error_info", "Error-Info"),
        ("warning", "Warning"),
        ("refer_to", "Refer-To"),
        ("referred_by", "Referred-By"),
        ("replaces", "Replaces"),
        ("session_expires", "Session-Expires"),
        ("min_se", "Min-SE"),
        ("path", "Path"),
        ("service_route", "Service-Route"),
        ("reason", "Reason"),
        ("security_client", "Security-Client"),
        ("security_server", "Security-Server"),
        ("security_verify", "Security-Verify"),
        ("privacy", "Privacy"),
        ("etag", "ETag"),
        ("if_match", "If-Match"),
        ("mime_version", "MIME-Version"),
        ("content_type", "Content-Type"),
        ("content_encoding", "Content-Encoding"),
        ("content_language", "Content-Language"),
        ("content_disposition", "Content-Disposition"),
        ("error", "Error"),
    ]
    .into_iter()
    .collect()
});

/// Lowercase a header name and turn dashes into underscores, the form
/// both policy tables are keyed by.
pub fn canonicalize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_lowercase() })
        .collect()
}

/// A header name must consist only of letters, digits, underscore and
/// dash — the same grammar RFC 3261 token headers use — to be accepted as
/// a custom header. This is checked against the client's *original* name,
/// not the canonicalized one.
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A header value must not contain a bare CR or LF — allowing either
/// would let a client smuggle extra header lines or a forged body
/// boundary into the response (response splitting).
pub fn is_valid_header_value(value: &str) -> bool {
    !value.contains('\r') && !value.contains('\n')
}

/// The outcome of classifying one client-supplied header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderDecision {
    /// Refused: this is an immutable header. Carries the canonical name
    /// for logging.
    Immutable(String),
    /// Accepted: emit under this canonical wire name.
    Mapped(&'static str),
    /// Accepted: emit verbatim under the client's own name.
    Custom,
    /// Refused: failed the custom-header grammar. Carries a reason.
    Malformed(&'static str),
}

/// Classify a single `(name, value)` pair supplied by a remote client.
pub fn classify_header(name: &str, value: &str) -> HeaderDecision {
    let canon = canonicalize(name);
    if IMMUTABLE_HEADERS.contains(canon.as_str()) {
        return HeaderDecision::Immutable(canon);
    }
    if let Some(&wire_name) = MAPPED_HEADERS.get(canon.as_str()) {
        return HeaderDecision::Mapped(wire_name);
    }
    if !is_valid_header_name(name) {
        return HeaderDecision::Malformed("header name contains characters outside [A-Za-z0-9_-]");
    }
    if !is_valid_header_value(value) {
        return HeaderDecision::Malformed("header value contains CR or LF");
    }
    HeaderDecision::Custom
}

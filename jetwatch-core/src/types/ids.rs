//! Newtypes for the identifiers this crate passes around everywhere.
//!
//! These are thin wrappers over `String`, not validated parsers: a DID is
//! treated as an opaque identifier string, so we don't reject anything
//! that isn't `did:plc:` or `did:web:` prefixed here. Validation
//! that matters (duplicate detection, ignore-list membership) happens in
//! `persistence`, keyed on the raw string.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A decentralized identifier. Never mutated once assigned to an account.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Did(pub String);

impl Did {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `did:web:<host>` decomposes into the host the well-known document
    /// lives on; anything else (including `did:plc:*`) resolves via the
    /// configured directory instead.
    pub fn web_host(&self) -> Option<&str> {
        self.0.strip_prefix("did:web:")
    }

    pub fn is_plc(&self) -> bool {
        self.0.starts_with("did:plc:")
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Did {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Did {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A human-readable handle aliased to a DID. Empty string stands in for
/// "unknown" rather than `Option<Handle>` everywhere, since a handle is
/// routinely absent and this spares every call site an `Option` unwrap.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Handle(pub String);

impl Handle {
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Handle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<Option<String>> for Handle {
    fn from(s: Option<String>) -> Self {
        Self(s.unwrap_or_default())
    }
}

/// Microsecond timestamp as produced by the upstream. The engine's notion of
/// "now" for replay purposes is defined by the highest cursor value it has
/// advanced past, never by wall-clock time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Cursor(pub i64);

impl Cursor {
    pub fn micros(self) -> i64 {
        self.0
    }

    pub fn from_micros(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

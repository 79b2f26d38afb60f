//! Viewing session identifiers
//!
//! A session names the book (or other viewing context) that is currently open.
//! Every cached resource and every prefetch task is stamped with the session it
//! was created for, so results that outlive a context switch can be recognised
//! as stale and discarded.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identifier of an open book/viewing context.
///
/// Cloning is cheap (shared string), so tasks can capture a snapshot of the
/// session they were created for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Create a session identifier
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_equality() {
        let a = SessionId::new("book-a.cbz");
        let b = SessionId::from("book-a.cbz");
        let c = SessionId::from(String::from("book-b.cbz"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "book-a.cbz");
        assert_eq!(c.to_string(), "book-b.cbz");
    }

    #[test]
    fn test_session_clone_shares_storage() {
        let a = SessionId::new("shared");
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn test_session_serializes_as_string() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Snapshot {
            session: SessionId,
        }

        let snapshot = Snapshot {
            session: SessionId::new("book-a.cbz"),
        };
        let text = toml::to_string(&snapshot).unwrap();
        assert_eq!(text.trim(), r#"session = "book-a.cbz""#);

        let parsed: Snapshot = toml::from_str(&text).unwrap();
        assert_eq!(parsed, snapshot);
    }
}

//! Errors surfaced by the index engine.

use crate::config::ConfigError;
use crate::storage::HostError;

/// Errors that can occur during index operations.
///
/// Absent keys are not errors: lookups return `Option` and removals `bool`.
#[derive(Debug)]
pub enum IndexError {
    /// A record or node failed to parse (bad sentinel, lengths past their bounds).
    Malformed(String),
    /// The operation is not supported, e.g. an update that changes an entry's size.
    Unsupported(String),
    /// A single entry is too large to fit in any node.
    Exhausted { entry_size: usize, capacity: usize },
    /// The tree and its backing store disagree (e.g. a block missing from the bitmap).
    Inconsistent(String),
    /// The stored collation rule is not one the engine implements.
    UnknownCollation(u32),
    /// Hosting record or stream error.
    Host(HostError),
    /// Invalid configuration.
    Config(ConfigError),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed index record: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported index operation: {msg}"),
            Self::Exhausted {
                entry_size,
                capacity,
            } => write!(
                f,
                "index entry of {entry_size} bytes cannot fit a node of {capacity} bytes"
            ),
            Self::Inconsistent(msg) => write!(f, "index inconsistent: {msg}"),
            Self::UnknownCollation(code) => write!(f, "unknown collation rule: 0x{code:02x}"),
            Self::Host(e) => write!(f, "host error: {e}"),
            Self::Config(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Host(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HostError> for IndexError {
    fn from(e: HostError) -> Self {
        Self::Host(e)
    }
}

impl From<ConfigError> for IndexError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_display() {
        let e = IndexError::Exhausted {
            entry_size: 600,
            capacity: 488,
        };
        assert!(e.to_string().contains("600 bytes"));
        assert_eq!(
            IndexError::UnknownCollation(0x02).to_string(),
            "unknown collation rule: 0x02"
        );
    }

    #[test]
    fn test_source_chain() {
        let e = IndexError::from(HostError::OutOfBounds { pos: 1, len: 0 });
        assert!(e.source().is_some());
        assert!(IndexError::Malformed("x".to_string()).source().is_none());
    }
}

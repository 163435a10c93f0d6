//! Structured error types for tracemap
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Kernel failures keep their errno as the `io::Error` source so callers can
//! tell "no such entry" apart from permission or argument errors.

use std::io;
use std::path::PathBuf;

use super::types::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("lookup of key {key} failed: {source}")]
    Lookup { key: String, source: io::Error },

    #[error("update of key {key} to {leaf} failed: {source}")]
    Update { key: String, leaf: String, source: io::Error },

    #[error("delete of key {key} failed: {source}")]
    Delete { key: String, source: io::Error },

    #[error("unable to delete element while clearing table: {source}")]
    DeleteAll { source: io::Error },

    #[error("formatting {what} failed: {reason}")]
    Format { what: &'static str, reason: String },

    #[error("error scanning {what} ({input:?}) from string: {reason}")]
    Parse { what: &'static str, input: String, reason: String },

    #[error("leaf for key {key} vanished during iteration")]
    IterationInconsistency { key: String },

    #[error("invalid map descriptor: {0}")]
    Descriptor(String),

    #[error("failed to determine possible CPUs: {0}")]
    PossibleCpus(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TableError {
    /// True when the kernel reported ENOENT for the operation
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Lookup { source, .. }
            | Self::Update { source, .. }
            | Self::Delete { source, .. }
            | Self::DeleteAll { source }
            | Self::Io(source) => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("invalid regex {pattern} : {source}")]
    InvalidPattern { pattern: String, source: regex::Error },

    #[error("no symbol resolver available for {pid}: {reason}")]
    ResolutionUnavailable { pid: Pid, reason: String },

    #[error("unable to locate symbol {name} in module {module}")]
    NotFound { module: String, name: String },

    #[error("module {0} not found")]
    ModuleNotFound(String),

    #[error("unable to list symbols for {module}: {reason}")]
    Enumeration { module: String, reason: String },

    #[error("failed to parse object file {path}: {source}")]
    Object { path: PathBuf, source: object::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_display() {
        let err = TableError::Lookup {
            key: "0x1".to_string(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(err.to_string().starts_with("lookup of key 0x1 failed"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_parse_error_keeps_input() {
        let err = TableError::Parse {
            what: "key",
            input: "{ 0x1 zz }".to_string(),
            reason: "bad integer".to_string(),
        };
        assert!(err.to_string().contains("{ 0x1 zz }"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_symbol_error() {
        let err = SymbolError::NotFound { module: "c".to_string(), name: "malloc".to_string() };
        assert_eq!(err.to_string(), "unable to locate symbol malloc in module c");
    }

    #[test]
    fn test_resolution_unavailable_mentions_pid() {
        let err = SymbolError::ResolutionUnavailable {
            pid: Pid(99),
            reason: "process exited".to_string(),
        };
        assert!(err.to_string().contains("PID:99"));
    }
}

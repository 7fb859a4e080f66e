//! Error types for contend.
//!
//! Taxonomy:
//! - Recoverable: a single slot degrades (spawn failure, unusable output)
//! - Fatal: the session cannot continue (no clock, no eviction buffer)
//! - Internal: invariant violations (bugs)

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for contend.
#[derive(Debug, Error)]
pub enum ContendError {
    // ═══════════════════════════════════════════════════════════════════
    // INPUT: the operator asked for something we cannot do
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // SLOT-LOCAL: degrade the affected slot, keep the session going
    // ═══════════════════════════════════════════════════════════════════

    #[error("Failed to spawn workload {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // SESSION-FATAL: no meaningful degraded mode exists
    // ═══════════════════════════════════════════════════════════════════

    #[error("Clock unavailable: {0}")]
    Clock(String),

    #[error("Eviction set allocation failed ({bytes} bytes)")]
    EvictionSetAlloc { bytes: usize },

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("Rendezvous timed out after {0:?}")]
    RendezvousTimeout(std::time::Duration),

    #[error("In-flight slot actions exceed capacity {capacity}")]
    CapacityExceeded { capacity: usize },

    // ═══════════════════════════════════════════════════════════════════
    // INTERNAL: invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContendError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error must abort the whole session.
    ///
    /// Everything else is recovered locally by degrading one slot to an
    /// erasure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Spawn { .. } | Self::Io { .. } | Self::ParseError(_))
    }
}

/// Result type alias for contend.
pub type Result<T> = std::result::Result<T, ContendError>;

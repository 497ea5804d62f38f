//! Error types for shardlease
//!
//! Covers lease store failures, optimistic write conflicts and
//! configuration problems. Membership change is never an error.

use thiserror::Error;

use crate::agent::AgentId;

/// Primary error type for all coordination operations
#[derive(Debug, Error)]
pub enum CoordinationError {
    // ========== Store Errors ==========

    /// The lease store could not be reached or failed the operation
    #[error("Lease store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// The row was deleted or changed since it was read
    #[error("Optimistic conflict on agent {agent_id}")]
    OptimisticConflict { agent_id: AgentId },

    // ========== Configuration Errors ==========

    /// Static shard assignment contradicts the discovered topology
    #[error("Configuration conflict: {reason}")]
    ConfigurationConflict { reason: String },

    /// Configuration values are unusable
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Shard index outside of the shard count
    #[error("Invalid shard assignment: index {index} of {total}")]
    InvalidAssignment { index: u32, total: u32 },

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoordinationError {
    /// Returns true if the next pulse may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::StoreUnavailable { .. }
                | CoordinationError::OptimisticConflict { .. }
        )
    }

    /// Returns true if the node must stop coordinating
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinationError::ConfigurationConflict { .. }
                | CoordinationError::InvalidConfig { .. }
                | CoordinationError::InvalidAssignment { .. }
        )
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoordinationError>;

//! Shardlease Core - lease-based coordination over a shared table
//!
//! Lets independent nodes split asynchronous indexing work between them
//! using nothing but a persistent agent table:
//! - Lease renewal and pruning of expired agents
//! - Deterministic shard assignment from the ordered live agents
//! - A SUSPENDED / REBALANCING / RUNNING state machine per node

pub mod agent;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod storage;

pub use agent::{Agent, AgentId, AgentReference, AgentRepository, AgentState, AgentType};
pub use config::CoordinationConfig;
pub use coordinator::{ClusterDescriptor, Pulser, PulserHandle, ShardAssignmentDescriptor, ShardCoordinator};
pub use error::{CoordinationError, Result};

/// Default coordination group
pub const DEFAULT_AGENT_TYPE: &str = "event-processing";

/// Default pulse interval in milliseconds
pub const DEFAULT_PULSE_INTERVAL_MS: u64 = 2_000;

/// Default lease duration in milliseconds
pub const DEFAULT_LEASE_DURATION_MS: u64 = 30_000;

/// Minimum ratio between lease duration and pulse interval
pub const MIN_LEASE_TO_PULSE_RATIO: u32 = 3;

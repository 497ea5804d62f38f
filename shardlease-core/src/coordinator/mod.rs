//! Store-polled coordination
//!
//! Lease renewal, cluster view computation, shard assignment and the
//! rebalancing state machine.

pub mod epoch;
pub mod membership;
pub mod pulser;
pub mod shard_assigner;

use async_trait::async_trait;

use crate::agent::AgentReference;
use crate::error::Result;

pub use epoch::{EpochTracker, ViewObservation, MIN_STABLE_PULSES};
pub use membership::ClusterDescriptor;
pub use pulser::{PulseOutcome, PulseReport, Pulser, PulserHandle};
pub use shard_assigner::ShardAssignmentDescriptor;

/// A running election: gives this node one disjoint shard per epoch.
///
/// Store polling is one transport; push-based ones (group membership
/// callbacks, cache compare-and-swap) would implement the same contract.
#[async_trait]
pub trait ShardCoordinator: Send + Sync {
    /// Handle of this node's participant, if registered
    fn self_reference(&self) -> Option<AgentReference>;

    /// Shard this node may process right now
    fn assignment(&self) -> Option<ShardAssignmentDescriptor>;

    /// Leave the cluster and release resources
    async fn stop(self: Box<Self>) -> Result<()>;
}

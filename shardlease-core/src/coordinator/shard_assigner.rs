//! Deterministic shard assignment
//!
//! A node's shard is its position in the ascending list of live agent ids.
//! No negotiation is needed: nodes converge once they observe the same view.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use crate::agent::AgentId;
use crate::error::{CoordinationError, Result};

/// `{total, index}` shard ownership of one agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawAssignment")]
pub struct ShardAssignmentDescriptor {
    total_shard_count: u32,
    assigned_shard_index: u32,
}

#[derive(Deserialize)]
struct RawAssignment {
    total_shard_count: u32,
    assigned_shard_index: u32,
}

impl TryFrom<RawAssignment> for ShardAssignmentDescriptor {
    type Error = CoordinationError;

    fn try_from(raw: RawAssignment) -> Result<Self> {
        Self::new(raw.total_shard_count, raw.assigned_shard_index)
    }
}

impl ShardAssignmentDescriptor {
    /// Create an assignment, rejecting an index outside `[0, total)`
    pub fn new(total_shard_count: u32, assigned_shard_index: u32) -> Result<Self> {
        if assigned_shard_index >= total_shard_count {
            return Err(CoordinationError::InvalidAssignment {
                index: assigned_shard_index,
                total: total_shard_count,
            });
        }
        Ok(Self {
            total_shard_count,
            assigned_shard_index,
        })
    }

    /// Pin the `node`-th of several co-located nodes to `node % total`
    pub fn round_robin(total_shard_count: u32, node: usize) -> Result<Self> {
        if total_shard_count == 0 {
            return Err(CoordinationError::InvalidAssignment {
                index: u32::try_from(node).unwrap_or(u32::MAX),
                total: 0,
            });
        }
        let index = node % total_shard_count as usize;
        Self::new(total_shard_count, index as u32)
    }

    /// Position of `self_id` among `member_ids`.
    ///
    /// `member_ids` must be ascending. Returns `None` when `self_id` is not a
    /// member, which means the node was pruned and has to register again.
    pub fn from_cluster_member_list(member_ids: &[AgentId], self_id: AgentId) -> Option<Self> {
        let index = member_ids.iter().position(|&id| id == self_id)?;
        Some(Self {
            total_shard_count: member_ids.len() as u32,
            assigned_shard_index: index as u32,
        })
    }

    pub fn total_shard_count(&self) -> u32 {
        self.total_shard_count
    }

    pub fn assigned_shard_index(&self) -> u32 {
        self.assigned_shard_index
    }

    /// Shard owning `hash` when the 32-bit hash space is cut into
    /// `total_shard_count` contiguous ranges
    pub fn shard_for_hash(hash: u32, total_shard_count: u32) -> u32 {
        ((u64::from(hash) * u64::from(total_shard_count)) >> 32) as u32
    }

    /// Hashes owned by this assignment
    pub fn hash_range(&self) -> RangeInclusive<u32> {
        let total = u64::from(self.total_shard_count);
        let index = u64::from(self.assigned_shard_index);
        // First hash h with h * total >= index * 2^32
        let lower = |i: u64| ((i << 32) + total - 1) / total;
        let start = lower(index);
        let end = lower(index + 1) - 1;
        start as u32..=end as u32
    }

    /// Whether a work item with this hash belongs to this assignment
    pub fn owns_hash(&self, hash: u32) -> bool {
        Self::shard_for_hash(hash, self.total_shard_count) == self.assigned_shard_index
    }
}

impl fmt::Display for ShardAssignmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.assigned_shard_index, self.total_shard_count)
    }
}

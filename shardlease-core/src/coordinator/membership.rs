//! Cluster view computation
//!
//! Derives the ordered list of live agents from the rows of one group.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::shard_assigner::ShardAssignmentDescriptor;
use crate::agent::{Agent, AgentId};

/// Ascending ids of the live members of a coordination group
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ClusterDescriptor {
    member_ids: Vec<AgentId>,
}

impl ClusterDescriptor {
    /// Build a descriptor from ids in any order
    pub fn new(mut member_ids: Vec<AgentId>) -> Self {
        member_ids.sort_unstable();
        member_ids.dedup();
        Self { member_ids }
    }

    /// Agents whose lease is still valid at `now`
    pub fn from_agents(agents: &[Agent], now: DateTime<Utc>) -> Self {
        Self::new(
            agents
                .iter()
                .filter(|a| !a.is_expired(now))
                .map(|a| a.id)
                .collect(),
        )
    }

    pub fn member_ids(&self) -> &[AgentId] {
        &self.member_ids
    }

    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.member_ids.binary_search(&id).is_ok()
    }

    /// The assignment this view implies for `id`
    pub fn assignment_for(&self, id: AgentId) -> Option<ShardAssignmentDescriptor> {
        ShardAssignmentDescriptor::from_cluster_member_list(&self.member_ids, id)
    }
}

impl fmt::Display for ClusterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, id) in self.member_ids.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", id)?;
        }
        f.write_str("]")
    }
}

/// Ids of rows whose lease lapsed at `now`, other than `keep`
pub fn expired_agent_ids(agents: &[Agent], now: DateTime<Utc>, keep: AgentId) -> Vec<AgentId> {
    agents
        .iter()
        .filter(|a| a.id != keep && a.is_expired(now))
        .map(|a| a.id)
        .collect()
}

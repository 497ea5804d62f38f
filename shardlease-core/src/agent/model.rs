//! Agent data model
//!
//! The persistent descriptor of one coordination participant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::coordinator::ShardAssignmentDescriptor;

/// Store-assigned agent identifier
///
/// Ids are handed out in increasing order, so id order approximates join order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coordination group discriminator
///
/// Agents only see and rebalance against agents of the same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentType(String);

impl AgentType {
    /// Create a new agent type tag
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// Registered but not owning any shard
    Suspended,
    /// A new shard plan was observed, waiting for the cluster to settle
    Rebalancing,
    /// Owns its assigned shard
    Running,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Suspended => "SUSPENDED",
            AgentState::Rebalancing => "REBALANCING",
            AgentState::Running => "RUNNING",
        };
        f.write_str(name)
    }
}

/// A persisted agent row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Store-assigned id
    pub id: AgentId,
    /// Coordination group
    pub agent_type: AgentType,
    /// Human readable node name
    pub name: String,
    /// Absolute lease deadline
    pub expiration: DateTime<Utc>,
    /// Current state
    pub state: AgentState,
    /// Shard count and index, present or absent together
    pub shard_assignment: Option<ShardAssignmentDescriptor>,
    /// Opaque bytes, reserved
    pub payload: Vec<u8>,
    /// Optimistic concurrency counter, bumped by the store on every update
    pub version: u64,
}

impl Agent {
    /// Version of a freshly created row
    pub const INITIAL_VERSION: u64 = 0;

    /// Stable handle for logging and ownership checks
    pub fn reference(&self) -> AgentReference {
        AgentReference {
            id: self.id,
            name: self.name.clone(),
        }
    }

    /// A lease is valid strictly before its expiration
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    pub fn total_shard_count(&self) -> Option<u32> {
        self.shard_assignment.map(|a| a.total_shard_count())
    }

    pub fn assigned_shard_index(&self) -> Option<u32> {
        self.shard_assignment.map(|a| a.assigned_shard_index())
    }
}

/// Row contents submitted for insertion, before the store assigns an id
#[derive(Debug, Clone)]
pub struct AgentDraft {
    pub agent_type: AgentType,
    pub name: String,
    pub expiration: DateTime<Utc>,
    pub state: AgentState,
    pub shard_assignment: Option<ShardAssignmentDescriptor>,
    pub payload: Vec<u8>,
}

impl AgentDraft {
    /// Materialize the draft as the row the store holds under `id`
    pub fn into_agent(self, id: AgentId) -> Agent {
        Agent {
            id,
            agent_type: self.agent_type,
            name: self.name,
            expiration: self.expiration,
            state: self.state,
            shard_assignment: self.shard_assignment,
            payload: self.payload,
            version: Agent::INITIAL_VERSION,
        }
    }
}

/// `(id, name)` handle of an agent
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentReference {
    pub id: AgentId,
    pub name: String,
}

impl fmt::Display for AgentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

//! Lease store interface
//!
//! Any keyed store offering optimistic updates can back the coordination
//! protocol. See [`crate::storage::InMemoryAgentRepository`] for the
//! in-process implementation.

use async_trait::async_trait;

use super::model::{Agent, AgentDraft, AgentId, AgentType};
use crate::error::Result;

/// Persistent table of agent rows
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert a new row. The store assigns an id greater than every id it
    /// has handed out before, and stores the row at [`Agent::INITIAL_VERSION`].
    async fn create(&self, draft: AgentDraft) -> Result<AgentId>;

    /// Load a single row
    async fn find(&self, id: AgentId) -> Result<Option<Agent>>;

    /// Load every row of a coordination group, ascending by id
    async fn find_all_order_by_id(&self, agent_type: &AgentType) -> Result<Vec<Agent>>;

    /// Write `agent` if the stored row still has `agent.version`.
    ///
    /// Fails with [`OptimisticConflict`](crate::error::CoordinationError::OptimisticConflict)
    /// when the row was deleted or changed concurrently. Returns the stored
    /// row carrying its new version.
    async fn update(&self, agent: &Agent) -> Result<Agent>;

    /// Delete rows. Missing ids are ignored.
    async fn delete(&self, ids: &[AgentId]) -> Result<()>;
}

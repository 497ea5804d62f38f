//! Owner-side control of a node's own agent row
//!
//! Every transition is idempotent: asking for the state the row is already
//! in performs no write.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::model::{Agent, AgentDraft, AgentReference, AgentState, AgentType};
use super::repository::AgentRepository;
use crate::coordinator::ShardAssignmentDescriptor;
use crate::error::Result;

/// Controller for exactly one agent row
#[derive(Debug)]
pub struct AgentPersister {
    agent_type: AgentType,
    name: String,
    static_assignment: Option<ShardAssignmentDescriptor>,
    self_reference: Option<AgentReference>,
}

impl AgentPersister {
    /// Create a persister that has not registered yet
    pub fn new(
        agent_type: AgentType,
        name: String,
        static_assignment: Option<ShardAssignmentDescriptor>,
    ) -> Self {
        Self {
            agent_type,
            name,
            static_assignment,
            self_reference: None,
        }
    }

    /// Reference of the row this node currently owns
    pub fn self_reference(&self) -> Option<&AgentReference> {
        self.self_reference.as_ref()
    }

    pub fn static_assignment(&self) -> Option<ShardAssignmentDescriptor> {
        self.static_assignment
    }

    pub fn agent_type(&self) -> &AgentType {
        &self.agent_type
    }

    /// Register a new row for this node.
    ///
    /// The created row is also inserted into `current_agents`, which must be
    /// ascending by id, so the caller can keep working on the list it loaded
    /// without reading it again.
    pub async fn create_self(
        &mut self,
        repo: &dyn AgentRepository,
        current_agents: &mut Vec<Agent>,
        expiration: DateTime<Utc>,
    ) -> Result<Agent> {
        let draft = AgentDraft {
            agent_type: self.agent_type.clone(),
            name: self.name.clone(),
            expiration,
            state: AgentState::Suspended,
            shard_assignment: self.static_assignment,
            payload: Vec::new(),
        };
        let id = repo.create(draft.clone()).await?;
        let agent = draft.into_agent(id);

        if let Some(previous) = self.self_reference.replace(agent.reference()) {
            info!("Agent {} re-registered as {}", previous, agent.reference());
        } else {
            info!("Agent {} registered in group {}", agent.reference(), self.agent_type);
        }

        let position = current_agents
            .binary_search_by_key(&id, |a| a.id)
            .unwrap_or_else(|pos| pos);
        current_agents.insert(position, agent.clone());

        Ok(agent)
    }

    /// Find this node's row in a freshly loaded list.
    ///
    /// `None` means the node never registered or its row was pruned by
    /// another node.
    pub fn extract_self(&self, agents: &[Agent]) -> Option<Agent> {
        let reference = self.self_reference.as_ref()?;
        agents.iter().find(|a| a.id == reference.id).cloned()
    }

    /// Delete this node's row, if any
    pub async fn leave_cluster(&mut self, repo: &dyn AgentRepository) -> Result<()> {
        let Some(reference) = self.self_reference.take() else {
            debug!("Leaving group {} without a registered agent", self.agent_type);
            return Ok(());
        };

        if let Err(e) = repo.delete(&[reference.id]).await {
            warn!("Agent {} failed to delete its row on leave: {}", reference, e);
            return Err(e);
        }
        info!("Agent {} left group {}", reference, self.agent_type);
        Ok(())
    }

    /// Stop owning shards. Without a static assignment the shard pair is cleared.
    pub async fn set_suspended(
        &self,
        repo: &dyn AgentRepository,
        agent: &mut Agent,
    ) -> Result<bool> {
        self.apply(repo, agent, AgentState::Suspended, self.static_assignment)
            .await
    }

    /// Announce a new shard plan without claiming it yet
    pub async fn set_rebalancing(
        &self,
        repo: &dyn AgentRepository,
        agent: &mut Agent,
        assignment: ShardAssignmentDescriptor,
    ) -> Result<bool> {
        let assignment = self.static_assignment.unwrap_or(assignment);
        self.apply(repo, agent, AgentState::Rebalancing, Some(assignment))
            .await
    }

    /// Claim ownership of the assigned shard
    pub async fn set_running(
        &self,
        repo: &dyn AgentRepository,
        agent: &mut Agent,
        assignment: ShardAssignmentDescriptor,
    ) -> Result<bool> {
        let assignment = self.static_assignment.unwrap_or(assignment);
        self.apply(repo, agent, AgentState::Running, Some(assignment))
            .await
    }

    /// Write the row as is, persisting its renewed expiration
    pub async fn renew(&self, repo: &dyn AgentRepository, agent: &mut Agent) -> Result<()> {
        *agent = repo.update(agent).await?;
        Ok(())
    }

    async fn apply(
        &self,
        repo: &dyn AgentRepository,
        agent: &mut Agent,
        state: AgentState,
        assignment: Option<ShardAssignmentDescriptor>,
    ) -> Result<bool> {
        if agent.state == state && agent.shard_assignment == assignment {
            return Ok(false);
        }

        let mut candidate = agent.clone();
        candidate.state = state;
        candidate.shard_assignment = assignment;
        *agent = repo.update(&candidate).await?;

        debug!(
            "Agent {} persisted state {} with assignment {:?}",
            agent.reference(),
            state,
            assignment
        );
        Ok(true)
    }
}

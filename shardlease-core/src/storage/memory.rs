//! In-process lease store
//!
//! Keeps agent rows in an ordered map with the same optimistic-update and
//! idempotent-delete semantics a shared database table provides. Used by the
//! simulation binary and by tests; fault injection makes every call fail as
//! an unreachable store would.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::trace;

use crate::agent::{Agent, AgentDraft, AgentId, AgentRepository, AgentType};
use crate::error::{CoordinationError, Result};

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<AgentId, Agent>,
    last_id: u64,
}

/// Agent table held in memory
#[derive(Debug, Default)]
pub struct InMemoryAgentRepository {
    table: Mutex<Table>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryAgentRepository {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of mutating operations applied so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of every row, ascending by id
    pub fn snapshot(&self) -> Vec<Agent> {
        self.table.lock().rows.values().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinationError::StoreUnavailable {
                message: "in-memory store is switched off".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn create(&self, draft: AgentDraft) -> Result<AgentId> {
        self.check_available()?;
        let mut table = self.table.lock();
        table.last_id += 1;
        let id = AgentId(table.last_id);
        table.rows.insert(id, draft.into_agent(id));
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!("Inserted agent {}", id);
        Ok(id)
    }

    async fn find(&self, id: AgentId) -> Result<Option<Agent>> {
        self.check_available()?;
        Ok(self.table.lock().rows.get(&id).cloned())
    }

    async fn find_all_order_by_id(&self, agent_type: &AgentType) -> Result<Vec<Agent>> {
        self.check_available()?;
        Ok(self
            .table
            .lock()
            .rows
            .values()
            .filter(|a| &a.agent_type == agent_type)
            .cloned()
            .collect())
    }

    async fn update(&self, agent: &Agent) -> Result<Agent> {
        self.check_available()?;
        let mut table = self.table.lock();
        let stored = table
            .rows
            .get_mut(&agent.id)
            .filter(|stored| stored.version == agent.version)
            .ok_or(CoordinationError::OptimisticConflict { agent_id: agent.id })?;

        let mut updated = agent.clone();
        updated.version += 1;
        *stored = updated.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn delete(&self, ids: &[AgentId]) -> Result<()> {
        self.check_available()?;
        let mut table = self.table.lock();
        for id in ids {
            if table.rows.remove(id).is_some() {
                trace!("Deleted agent {}", id);
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//! Per-node coordination loop
//!
//! Each pulse renews the node's lease, prunes expired rows, recomputes the
//! cluster view and drives the agent through
//! `SUSPENDED -> REBALANCING -> RUNNING`. Nodes only ever talk to the store.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::epoch::{EpochTracker, ViewObservation};
use super::membership::{expired_agent_ids, ClusterDescriptor};
use super::shard_assigner::ShardAssignmentDescriptor;
use super::ShardCoordinator;
use crate::agent::{Agent, AgentId, AgentPersister, AgentReference, AgentRepository, AgentState};
use crate::clock::Clock;
use crate::config::CoordinationConfig;
use crate::error::{CoordinationError, Result};
use crate::metrics::standard;
use crate::runtime::ShutdownSignal;

/// What a pulse did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseOutcome {
    /// A new row was created for this node; it starts out suspended
    Registered,
    /// Only the lease was renewed
    Renewed,
    /// State or assignment changed and was persisted with the lease
    Transitioned { from: AgentState, to: AgentState },
    /// The row vanished under a concurrent prune; next pulse registers again
    Evicted,
}

/// Summary of one pulse
#[derive(Debug, Clone)]
pub struct PulseReport {
    pub outcome: PulseOutcome,
    /// Id of the node's row after the pulse
    pub agent_id: Option<AgentId>,
    /// State of the node's row after the pulse
    pub state: AgentState,
    /// Assignment stored in the node's row after the pulse
    pub assignment: Option<ShardAssignmentDescriptor>,
    /// View computed by the pulse
    pub view: ClusterDescriptor,
}

/// Coordination loop of one node
pub struct Pulser {
    config: CoordinationConfig,
    repo: Arc<dyn AgentRepository>,
    clock: Arc<dyn Clock>,
    persister: AgentPersister,
    current: Option<Agent>,
    epochs: EpochTracker,
    /// Set when the lease lapsed locally; the next write must be REBALANCING
    lease_lost: bool,
    paused: Arc<AtomicBool>,
    assignment_tx: watch::Sender<Option<ShardAssignmentDescriptor>>,
    reference_tx: watch::Sender<Option<AgentReference>>,
}

impl Pulser {
    /// Create a pulser. Nothing is written until the first pulse.
    pub fn new(
        config: CoordinationConfig,
        repo: Arc<dyn AgentRepository>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let persister = AgentPersister::new(
            config.agent_type.clone(),
            config.agent_name.clone(),
            config.static_assignment,
        );
        let (assignment_tx, _) = watch::channel(None);
        let (reference_tx, _) = watch::channel(None);

        Ok(Self {
            config,
            repo,
            clock,
            persister,
            current: None,
            epochs: EpochTracker::new(),
            lease_lost: false,
            paused: Arc::new(AtomicBool::new(false)),
            assignment_tx,
            reference_tx,
        })
    }

    /// Reference of the row this node owns
    pub fn self_reference(&self) -> Option<AgentReference> {
        self.persister.self_reference().cloned()
    }

    /// Last row this node persisted
    pub fn current_agent(&self) -> Option<&Agent> {
        self.current.as_ref()
    }

    /// Assignment the node currently owns; `None` unless RUNNING
    pub fn assignment(&self) -> Option<ShardAssignmentDescriptor> {
        *self.assignment_tx.borrow()
    }

    /// Ask the node to stop owning shards from the next pulse on
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Run the first pulse, then keep pulsing on a background task.
    ///
    /// A configuration conflict found by the first pulse is returned here
    /// and nothing is spawned.
    pub async fn start(mut self) -> Result<PulserHandle> {
        if let Err(e) = self.pulse().await {
            if e.is_fatal() {
                self.leave().await;
                return Err(e);
            }
        }

        let shutdown = ShutdownSignal::new();
        let handle = PulserHandle {
            shutdown: shutdown.clone(),
            paused: self.paused.clone(),
            assignment: self.assignment_tx.subscribe(),
            reference: self.reference_tx.subscribe(),
            task: Some(tokio::spawn(self.run(shutdown))),
        };
        Ok(handle)
    }

    async fn run(mut self, shutdown: ShutdownSignal) -> Result<()> {
        let mut ticker = interval(self.config.pulse_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and start() already pulsed
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                _ = shutdown.wait() => break Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.pulse().await {
                        if e.is_fatal() {
                            break Err(e);
                        }
                    }
                }
            }
        };

        self.leave().await;
        result
    }

    /// Run one pulse.
    ///
    /// Store failures are logged and returned; they never leave the pulser
    /// in a state the next pulse cannot recover from.
    pub async fn pulse(&mut self) -> Result<PulseReport> {
        let started = Instant::now();
        let result = self.run_pulse().await;
        standard::PULSE_DURATION.observe_since(started);
        *standard::LAST_PULSE.lock() = Some(Instant::now());

        match &result {
            Ok(_) => standard::PULSES.inc(),
            Err(e) if e.is_fatal() => {
                error!("Agent {} stops coordinating: {}", self.display_name(), e);
                self.withdraw();
            }
            Err(e) => {
                standard::PULSE_FAILURES.inc();
                warn!("Pulse of agent {} failed: {}", self.display_name(), e);
                self.check_lease_loss();
            }
        }
        result
    }

    async fn run_pulse(&mut self) -> Result<PulseReport> {
        let now = self.clock.now();
        let expiration = self.lease_deadline(now)?;

        let mut agents = self
            .repo
            .find_all_order_by_id(self.persister.agent_type())
            .await?;

        let (mut me, registered) = match self.persister.extract_self(&agents) {
            Some(agent) => (agent, false),
            None => (self.register(&mut agents, expiration).await?, true),
        };
        if let Some(row) = agents.iter_mut().find(|a| a.id == me.id) {
            row.expiration = expiration;
        }
        me.expiration = expiration;

        self.prune_expired(&agents, now, me.id).await;

        let view = ClusterDescriptor::from_agents(&agents, now);
        standard::LIVE_AGENTS.set(view.len() as i64);
        self.check_static_topology(&agents, now, me.id)?;
        let observation = self.epochs.observe(&view);

        if registered {
            self.set_current(Some(me.clone()));
            self.publish(&me);
            return Ok(self.report(PulseOutcome::Registered, &me, view));
        }

        let from = me.state;
        let wrote = match self.transition(&mut me, &agents, &view, observation, now).await {
            Ok(wrote) => wrote,
            Err(CoordinationError::OptimisticConflict { agent_id }) => {
                info!(
                    "Agent {} lost its row {} to a concurrent prune, it will register again",
                    self.display_name(),
                    agent_id
                );
                self.withdraw();
                self.set_current(None);
                return Ok(self.report(PulseOutcome::Evicted, &me, view));
            }
            Err(e) => return Err(e),
        };

        let outcome = if wrote {
            if me.state != from {
                info!(
                    "Agent {} {} -> {} with view {} (epoch {})",
                    me.reference(),
                    from,
                    me.state,
                    view,
                    observation.epoch
                );
            }
            if me.state == AgentState::Rebalancing {
                standard::REBALANCES.inc();
            }
            PulseOutcome::Transitioned { from, to: me.state }
        } else {
            debug!("Agent {} renewed its lease until {}", me.reference(), expiration);
            PulseOutcome::Renewed
        };

        self.lease_lost = false;
        self.set_current(Some(me.clone()));
        self.publish(&me);
        Ok(self.report(outcome, &me, view))
    }

    /// Apply the state machine, always persisting exactly one write
    async fn transition(
        &self,
        me: &mut Agent,
        agents: &[Agent],
        view: &ClusterDescriptor,
        observation: ViewObservation,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let repo = self.repo.as_ref();
        let target = match self.persister.static_assignment() {
            Some(fixed) => fixed,
            None => view.assignment_for(me.id).ok_or_else(|| CoordinationError::Internal {
                message: format!("agent {} missing from its own view {}", me.id, view),
            })?,
        };
        let is_static = self.persister.static_assignment().is_some();
        let plan_changed = me.shard_assignment != Some(target);

        let wrote = if self.paused.load(Ordering::SeqCst) {
            self.persister.set_suspended(repo, me).await?
        } else if self.lease_lost {
            self.persister.set_rebalancing(repo, me, target).await?
        } else {
            match me.state {
                AgentState::Running if !plan_changed && (is_static || !observation.changed) => false,
                AgentState::Running | AgentState::Suspended => {
                    self.persister.set_rebalancing(repo, me, target).await?
                }
                AgentState::Rebalancing if plan_changed => {
                    self.persister.set_rebalancing(repo, me, target).await?
                }
                AgentState::Rebalancing => {
                    if observation.is_stable()
                        && (is_static || others_settled(agents, view, me.id, now))
                    {
                        self.persister.set_running(repo, me, target).await?
                    } else {
                        false
                    }
                }
            }
        };

        if !wrote {
            self.persister.renew(repo, me).await?;
        }
        Ok(wrote)
    }

    async fn register(&mut self, agents: &mut Vec<Agent>, expiration: DateTime<Utc>) -> Result<Agent> {
        if let Some(previous) = self.persister.self_reference() {
            warn!("Agent {} was evicted from group {}", previous, self.persister.agent_type());
        }
        self.withdraw();
        self.epochs.reset();
        self.lease_lost = false;

        let agent = self
            .persister
            .create_self(self.repo.as_ref(), agents, expiration)
            .await?;
        standard::REGISTRATIONS.inc();
        self.reference_tx.send_replace(Some(agent.reference()));
        Ok(agent)
    }

    async fn prune_expired(&self, agents: &[Agent], now: DateTime<Utc>, me: AgentId) {
        let expired = expired_agent_ids(agents, now, me);
        if expired.is_empty() {
            return;
        }
        match self.repo.delete(&expired).await {
            Ok(()) => {
                standard::AGENTS_PRUNED.inc_by(expired.len() as u64);
                debug!("Agent {} pruned expired agents {:?}", self.display_name(), expired);
            }
            Err(e) => debug!("Pruning {:?} failed, leaving it to the next pulse: {}", expired, e),
        }
    }

    /// With a pinned shard, every other live agent carrying a pair must agree
    /// on the shard count and hold a different index.
    fn check_static_topology(&self, agents: &[Agent], now: DateTime<Utc>, me: AgentId) -> Result<()> {
        let Some(fixed) = self.persister.static_assignment() else {
            return Ok(());
        };

        for other in agents.iter().filter(|a| a.id != me && !a.is_expired(now)) {
            let Some(theirs) = other.shard_assignment else {
                continue;
            };
            if theirs.total_shard_count() != fixed.total_shard_count() {
                return Err(CoordinationError::ConfigurationConflict {
                    reason: format!(
                        "agent {} expects {} shards but this node is pinned to {}",
                        other.reference(),
                        theirs.total_shard_count(),
                        fixed
                    ),
                });
            }
            if theirs.assigned_shard_index() == fixed.assigned_shard_index() {
                return Err(CoordinationError::ConfigurationConflict {
                    reason: format!(
                        "agent {} already holds shard {}",
                        other.reference(),
                        fixed
                    ),
                });
            }
        }
        Ok(())
    }

    /// A lease that lapsed locally means others may already own our shard
    fn check_lease_loss(&mut self) {
        let now = self.clock.now();
        let Some(agent) = self.current.as_mut() else {
            return;
        };
        if agent.is_expired(now) && agent.state != AgentState::Suspended {
            warn!(
                "Agent {} could not renew its lease before {}, suspending locally and dropping view epoch {}",
                agent.reference(),
                agent.expiration,
                self.epochs.epoch()
            );
            standard::LOCAL_AGENTS.record_transition(Some(agent.state), Some(AgentState::Suspended));
            agent.state = AgentState::Suspended;
            self.withdraw();
            // Back through REBALANCING once the store answers again
            self.epochs.reset();
            self.lease_lost = true;
        }
    }

    /// Delete this node's row and stop owning shards.
    ///
    /// Best effort: if the store is unreachable the lease lapses instead.
    /// A later pulse registers the node again.
    pub async fn leave(&mut self) {
        self.withdraw();
        if let Err(e) = self.persister.leave_cluster(self.repo.as_ref()).await {
            // The lease will lapse and another node prunes the row
            debug!("Leave of {} left its row behind: {}", self.config.agent_name, e);
        }
        self.set_current(None);
        self.reference_tx.send_replace(None);
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        TimeDelta::from_std(self.config.lease_duration)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .ok_or_else(|| CoordinationError::InvalidConfig {
                reason: format!(
                    "lease of {:?} from {} is past the representable time range",
                    self.config.lease_duration, now
                ),
            })
    }

    fn set_current(&mut self, next: Option<Agent>) {
        standard::LOCAL_AGENTS.record_transition(
            self.current.as_ref().map(|a| a.state),
            next.as_ref().map(|a| a.state),
        );
        self.current = next;
    }

    fn publish(&self, me: &Agent) {
        let owned = match me.state {
            AgentState::Running => me.shard_assignment,
            _ => None,
        };
        self.assignment_tx.send_if_modified(|current| {
            let modified = *current != owned;
            *current = owned;
            modified
        });
    }

    fn withdraw(&self) {
        self.assignment_tx.send_replace(None);
    }

    fn report(&self, outcome: PulseOutcome, me: &Agent, view: ClusterDescriptor) -> PulseReport {
        PulseReport {
            outcome,
            agent_id: self.persister.self_reference().map(|r| r.id),
            state: me.state,
            assignment: me.shard_assignment,
            view,
        }
    }

    fn display_name(&self) -> String {
        match self.persister.self_reference() {
            Some(reference) => reference.to_string(),
            None => self.config.agent_name.clone(),
        }
    }
}

/// Nobody still works under an older plan: every other live agent is
/// suspended or already announces the assignment `view` gives it.
fn others_settled(agents: &[Agent], view: &ClusterDescriptor, me: AgentId, now: DateTime<Utc>) -> bool {
    agents
        .iter()
        .filter(|a| a.id != me && !a.is_expired(now))
        .all(|a| a.state == AgentState::Suspended || a.shard_assignment == view.assignment_for(a.id))
}

/// Owner-side handle of a running pulser
pub struct PulserHandle {
    shutdown: ShutdownSignal,
    paused: Arc<AtomicBool>,
    assignment: watch::Receiver<Option<ShardAssignmentDescriptor>>,
    reference: watch::Receiver<Option<AgentReference>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl PulserHandle {
    /// Reference of the row the node currently owns
    pub fn self_reference(&self) -> Option<AgentReference> {
        self.reference.borrow().clone()
    }

    /// Assignment the node currently owns; `None` unless RUNNING
    pub fn assignment(&self) -> Option<ShardAssignmentDescriptor> {
        *self.assignment.borrow()
    }

    /// Receiver notified whenever the owned assignment changes
    pub fn subscribe(&self) -> watch::Receiver<Option<ShardAssignmentDescriptor>> {
        self.assignment.clone()
    }

    /// Suspend the node on its next pulse
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Let a paused node rebalance back in
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// True once the loop ended, e.g. on a configuration conflict
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Leave the cluster and wait for the loop to end
    pub async fn stop(mut self) -> Result<()> {
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        self.shutdown.shutdown();
        let Some(task) = self.task.take() else {
            return Err(CoordinationError::ShutdownInProgress);
        };
        task.await.map_err(|e| CoordinationError::Internal {
            message: format!("pulser task failed: {}", e),
        })?
    }
}

impl Drop for PulserHandle {
    fn drop(&mut self) {
        // Dropping the handle stops the loop; the row is removed best-effort
        self.shutdown.shutdown();
    }
}

#[async_trait]
impl ShardCoordinator for PulserHandle {
    fn self_reference(&self) -> Option<AgentReference> {
        PulserHandle::self_reference(self)
    }

    fn assignment(&self) -> Option<ShardAssignmentDescriptor> {
        PulserHandle::assignment(self)
    }

    async fn stop(mut self: Box<Self>) -> Result<()> {
        self.join().await
    }
}

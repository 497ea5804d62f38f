//! Multi-node rebalancing tests
//!
//! Several pulsers share one in-memory table and a manual clock. Pulses are
//! driven by hand so every interleaving is deterministic.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

use shardlease_core::agent::{Agent, AgentDraft};
use shardlease_core::clock::ManualClock;
use shardlease_core::coordinator::{PulseOutcome, Pulser};
use shardlease_core::storage::InMemoryAgentRepository;
use shardlease_core::{
    AgentId, AgentRepository, AgentState, AgentType, ClusterDescriptor, CoordinationConfig,
    CoordinationError, ShardAssignmentDescriptor,
};

const PULSE: Duration = Duration::from_secs(2);
const LEASE: Duration = Duration::from_secs(30);

fn config(name: &str) -> CoordinationConfig {
    CoordinationConfig {
        pulse_interval: PULSE,
        lease_duration: LEASE,
        ..CoordinationConfig::named(name)
    }
}

fn assignment(total: u32, index: u32) -> ShardAssignmentDescriptor {
    ShardAssignmentDescriptor::new(total, index).unwrap()
}

struct Cluster {
    repo: Arc<InMemoryAgentRepository>,
    clock: Arc<ManualClock>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            repo: Arc::new(InMemoryAgentRepository::new()),
            clock: Arc::new(ManualClock::default()),
        }
    }

    fn node(&self, config: CoordinationConfig) -> Pulser {
        Pulser::new(config, self.repo.clone(), self.clock.clone()).unwrap()
    }

    /// Pulse every node once, then let one pulse interval pass
    async fn round(&self, nodes: &mut [Pulser]) -> Vec<AgentState> {
        let mut states = Vec::with_capacity(nodes.len());
        for node in nodes.iter_mut() {
            states.push(node.pulse().await.unwrap().state);
        }
        self.clock.advance(PULSE);
        states
    }

    /// Every live row runs the shard matching its rank among live rows
    fn assert_converged(&self) {
        let now = shardlease_core::clock::Clock::now(self.clock.as_ref());
        let live: Vec<Agent> = self
            .repo
            .snapshot()
            .into_iter()
            .filter(|a| !a.is_expired(now))
            .collect();

        for (rank, agent) in live.iter().enumerate() {
            assert_eq!(agent.state, AgentState::Running, "{} not running", agent.reference());
            assert_eq!(
                agent.shard_assignment,
                Some(assignment(live.len() as u32, rank as u32)),
                "{} has the wrong shard",
                agent.reference()
            );
        }
    }
}

#[tokio::test]
async fn test_three_nodes_then_one_lapses() {
    let cluster = Cluster::new();
    let mut nodes = vec![
        cluster.node(config("a")),
        cluster.node(config("b")),
        cluster.node(config("c")),
    ];

    for node in nodes.iter_mut() {
        let report = node.pulse().await.unwrap();
        assert_eq!(report.outcome, PulseOutcome::Registered);
        assert_eq!(report.state, AgentState::Suspended);
    }
    let ids: Vec<AgentId> = nodes.iter().map(|n| n.self_reference().unwrap().id).collect();
    assert_eq!(ids, vec![AgentId(1), AgentId(2), AgentId(3)]);

    assert_eq!(cluster.round(&mut nodes).await, vec![AgentState::Rebalancing; 3]);
    assert_eq!(cluster.round(&mut nodes).await, vec![AgentState::Running; 3]);

    for (i, node) in nodes.iter().enumerate() {
        assert_eq!(node.assignment(), Some(assignment(3, i as u32)));
    }
    cluster.assert_converged();

    // c stops pulsing; a and b keep going until its lease lapses
    let c = nodes.pop().unwrap();
    let mut seen_rebalancing = [false, false];
    for _ in 0..20 {
        let states = cluster.round(&mut nodes).await;
        for (seen, state) in seen_rebalancing.iter_mut().zip(&states) {
            *seen |= *state == AgentState::Rebalancing;
        }
    }

    assert_eq!(seen_rebalancing, [true, true], "both must pass through REBALANCING");
    assert_eq!(nodes[0].assignment(), Some(assignment(2, 0)));
    assert_eq!(nodes[1].assignment(), Some(assignment(2, 1)));
    assert_eq!(cluster.repo.find(ids[2]).await.unwrap(), None, "c should be pruned");
    assert_eq!(c.assignment(), Some(assignment(3, 2)), "c never learned about it");
    cluster.assert_converged();
}

#[tokio::test]
async fn test_no_promotion_while_others_hold_old_plan() {
    let cluster = Cluster::new();
    let mut a = cluster.node(config("a"));
    let mut b = cluster.node(config("b"));

    for _ in 0..3 {
        a.pulse().await.unwrap();
    }
    assert_eq!(a.assignment(), Some(assignment(1, 0)));

    b.pulse().await.unwrap();
    // a sees the new view and announces {0/2}
    assert_eq!(a.pulse().await.unwrap().state, AgentState::Rebalancing);
    // b is still SUSPENDED, so a only waits for its view to hold
    assert_eq!(a.pulse().await.unwrap().state, AgentState::Running);
    assert_eq!(a.assignment(), Some(assignment(2, 0)));

    assert_eq!(b.pulse().await.unwrap().state, AgentState::Rebalancing);
    assert_eq!(b.pulse().await.unwrap().state, AgentState::Running);
    cluster.assert_converged();
}

#[tokio::test]
async fn test_waits_for_running_peer_to_rebalance() {
    let cluster = Cluster::new();
    let mut nodes = vec![cluster.node(config("a")), cluster.node(config("b"))];
    for _ in 0..3 {
        cluster.round(&mut nodes).await;
    }
    cluster.assert_converged();

    let mut c = cluster.node(config("c"));
    c.pulse().await.unwrap();

    // a moves to {0/3} but b is still RUNNING under {1/2}
    assert_eq!(nodes[0].pulse().await.unwrap().state, AgentState::Rebalancing);
    assert_eq!(nodes[0].pulse().await.unwrap().state, AgentState::Rebalancing);
    assert_eq!(nodes[0].assignment(), None);

    assert_eq!(nodes[1].pulse().await.unwrap().state, AgentState::Rebalancing);
    assert_eq!(nodes[0].pulse().await.unwrap().state, AgentState::Running);
    assert_eq!(nodes[0].assignment(), Some(assignment(3, 0)));
}

#[tokio::test]
async fn test_join_and_leave_sequences_converge() {
    enum Step {
        Join(&'static str),
        Leave(usize),
        Crash(usize),
    }
    use Step::*;

    let scripts = vec![
        vec![Join("a"), Join("b"), Join("c"), Leave(1), Join("d")],
        vec![Join("a"), Join("b"), Crash(0), Join("c"), Join("d"), Leave(0)],
        vec![Join("a"), Leave(0), Join("b"), Join("c"), Crash(1), Crash(0), Join("d")],
        vec![Join("a"), Join("b"), Join("c"), Join("d"), Join("e"), Crash(2), Leave(3)],
    ];

    for script in scripts {
        let cluster = Cluster::new();
        let mut nodes: Vec<Pulser> = Vec::new();

        for step in script {
            match step {
                Join(name) => nodes.push(cluster.node(config(name))),
                Leave(i) => {
                    let mut node = nodes.remove(i);
                    node.leave().await;
                }
                Crash(i) => {
                    nodes.remove(i);
                }
            }
            cluster.round(&mut nodes).await;
        }

        // Long enough for crashed leases to lapse and views to settle
        for _ in 0..25 {
            cluster.round(&mut nodes).await;
        }

        cluster.assert_converged();
        let live = cluster.repo.snapshot();
        assert_eq!(live.len(), nodes.len());
        for node in &nodes {
            let id = node.self_reference().unwrap().id;
            let rank = live.iter().position(|a| a.id == id).unwrap();
            assert_eq!(node.assignment(), Some(assignment(nodes.len() as u32, rank as u32)));
        }
    }
}

#[tokio::test]
async fn test_evicted_node_registers_again() {
    let cluster = Cluster::new();
    let mut nodes = vec![cluster.node(config("a")), cluster.node(config("b"))];
    for _ in 0..3 {
        cluster.round(&mut nodes).await;
    }
    let old_id = nodes[0].self_reference().unwrap().id;
    assert_eq!(nodes[0].assignment(), Some(assignment(2, 0)));

    cluster.repo.delete(&[old_id]).await.unwrap();

    let report = nodes[0].pulse().await.unwrap();
    assert_eq!(report.outcome, PulseOutcome::Registered);
    assert_eq!(report.state, AgentState::Suspended);
    assert_eq!(report.assignment, None);
    let new_id = report.agent_id.unwrap();
    assert_ne!(new_id, old_id);
    assert_eq!(nodes[0].self_reference().unwrap().id, new_id);
    assert_eq!(nodes[0].assignment(), None, "prior ownership must be discarded");

    let row = cluster.repo.find(new_id).await.unwrap().unwrap();
    assert_eq!(row.state, AgentState::Suspended);

    for _ in 0..4 {
        cluster.round(&mut nodes).await;
    }
    // a rejoined with a higher id, so the order flipped
    assert_eq!(nodes[0].assignment(), Some(assignment(2, 1)));
    assert_eq!(nodes[1].assignment(), Some(assignment(2, 0)));
    cluster.assert_converged();
}

#[tokio::test]
async fn test_row_deleted_between_read_and_write() {
    let cluster = Cluster::new();
    let racing = Arc::new(DeleteOnFirstUpdate {
        inner: cluster.repo.clone(),
        victim: Mutex::new(None),
    });
    let mut a = Pulser::new(config("a"), racing.clone(), cluster.clock.clone()).unwrap();
    for _ in 0..3 {
        a.pulse().await.unwrap();
    }
    assert_eq!(a.assignment(), Some(assignment(1, 0)));

    // A prune lands after a loaded the table but before it wrote
    *racing.victim.lock() = a.self_reference().map(|r| r.id);
    let report = a.pulse().await.unwrap();
    assert_eq!(report.outcome, PulseOutcome::Evicted);
    assert_eq!(a.assignment(), None);
    assert!(a.current_agent().is_none());

    let report = a.pulse().await.unwrap();
    assert_eq!(report.outcome, PulseOutcome::Registered);
    assert_eq!(report.agent_id, Some(AgentId(2)));
}

#[tokio::test]
async fn test_concurrent_pruning_of_same_row() {
    let cluster = Cluster::new();
    let gated = Arc::new(GatedDeletes {
        inner: cluster.repo.clone(),
        gate: Mutex::new(Some(Arc::new(Barrier::new(2)))),
    });
    let node = |name: &str, lease: Duration| {
        let config = CoordinationConfig {
            lease_duration: lease,
            ..config(name)
        };
        Pulser::new(config, gated.clone(), cluster.clock.clone()).unwrap()
    };
    let mut a = node("a", LEASE);
    let mut b = node("b", LEASE);
    let mut c = node("c", Duration::from_secs(6));

    for _ in 0..3 {
        a.pulse().await.unwrap();
        b.pulse().await.unwrap();
        c.pulse().await.unwrap();
    }
    let c_id = c.self_reference().unwrap().id;

    cluster.clock.advance(Duration::from_secs(7));
    let (ra, rb) = tokio::join!(a.pulse(), b.pulse());
    assert!(ra.is_ok(), "a surfaced {:?}", ra.as_ref().err());
    assert!(rb.is_ok(), "b surfaced {:?}", rb.as_ref().err());
    assert_eq!(gated.inner.find(c_id).await.unwrap(), None);
    assert_eq!(ra.unwrap().view, ClusterDescriptor::new(vec![AgentId(1), AgentId(2)]));
}

#[tokio::test]
async fn test_static_assignment_survives_view_changes() {
    let cluster = Cluster::new();
    let pinned = assignment(4, 1);
    let mut a = cluster.node(CoordinationConfig {
        static_assignment: Some(pinned),
        ..config("a")
    });

    for _ in 0..4 {
        a.pulse().await.unwrap();
        let row = cluster.repo.snapshot().remove(0);
        assert_eq!(row.shard_assignment, Some(pinned));
        cluster.clock.advance(PULSE);
    }
    assert_eq!(a.assignment(), Some(pinned));

    let mut b = cluster.node(CoordinationConfig {
        static_assignment: Some(assignment(4, 3)),
        ..config("b")
    });
    for _ in 0..4 {
        b.pulse().await.unwrap();
        let report = a.pulse().await.unwrap();
        assert_eq!(report.state, AgentState::Running, "a static node keeps running");
        assert_eq!(report.assignment, Some(pinned));
    }
    assert_eq!(b.assignment(), Some(assignment(4, 3)));
}

#[tokio::test]
async fn test_static_duplicate_index_conflicts() {
    let cluster = Cluster::new();
    let mut a = cluster.node(CoordinationConfig {
        static_assignment: Some(assignment(2, 0)),
        ..config("a")
    });
    a.pulse().await.unwrap();

    let mut b = cluster.node(CoordinationConfig {
        static_assignment: Some(assignment(2, 0)),
        ..config("b")
    });
    let err = b.pulse().await.unwrap_err();
    assert!(matches!(err, CoordinationError::ConfigurationConflict { .. }));
    assert!(err.is_fatal());
    assert_eq!(b.assignment(), None);
}

#[tokio::test]
async fn test_static_shard_count_mismatch_conflicts() {
    let cluster = Cluster::new();
    let mut a = cluster.node(CoordinationConfig {
        static_assignment: Some(assignment(2, 0)),
        ..config("a")
    });
    a.pulse().await.unwrap();

    let mut b = cluster.node(CoordinationConfig {
        static_assignment: Some(assignment(3, 1)),
        ..config("b")
    });
    assert!(matches!(
        b.pulse().await,
        Err(CoordinationError::ConfigurationConflict { .. })
    ));
}

#[tokio::test]
async fn test_groups_are_isolated() {
    let cluster = Cluster::new();
    let mut a = cluster.node(config("a"));
    let mut other = cluster.node(CoordinationConfig {
        agent_type: AgentType::new("mass-indexing"),
        ..config("other")
    });

    for _ in 0..3 {
        a.pulse().await.unwrap();
        other.pulse().await.unwrap();
    }
    assert_eq!(a.assignment(), Some(assignment(1, 0)));
    assert_eq!(other.assignment(), Some(assignment(1, 0)));
}

/// Holds the first prune of every caller until two callers are pruning
struct GatedDeletes {
    inner: Arc<InMemoryAgentRepository>,
    gate: Mutex<Option<Arc<Barrier>>>,
}

#[async_trait]
impl AgentRepository for GatedDeletes {
    async fn create(&self, draft: AgentDraft) -> shardlease_core::Result<AgentId> {
        self.inner.create(draft).await
    }

    async fn find(&self, id: AgentId) -> shardlease_core::Result<Option<Agent>> {
        self.inner.find(id).await
    }

    async fn find_all_order_by_id(&self, agent_type: &AgentType) -> shardlease_core::Result<Vec<Agent>> {
        self.inner.find_all_order_by_id(agent_type).await
    }

    async fn update(&self, agent: &Agent) -> shardlease_core::Result<Agent> {
        self.inner.update(agent).await
    }

    async fn delete(&self, ids: &[AgentId]) -> shardlease_core::Result<()> {
        let gate = self.gate.lock().clone();
        if let Some(barrier) = gate {
            if barrier.wait().await.is_leader() {
                *self.gate.lock() = None;
            }
        }
        self.inner.delete(ids).await
    }
}

/// Deletes the victim's row right before its owner's next write
struct DeleteOnFirstUpdate {
    inner: Arc<InMemoryAgentRepository>,
    victim: Mutex<Option<AgentId>>,
}

#[async_trait]
impl AgentRepository for DeleteOnFirstUpdate {
    async fn create(&self, draft: AgentDraft) -> shardlease_core::Result<AgentId> {
        self.inner.create(draft).await
    }

    async fn find(&self, id: AgentId) -> shardlease_core::Result<Option<Agent>> {
        self.inner.find(id).await
    }

    async fn find_all_order_by_id(&self, agent_type: &AgentType) -> shardlease_core::Result<Vec<Agent>> {
        self.inner.find_all_order_by_id(agent_type).await
    }

    async fn update(&self, agent: &Agent) -> shardlease_core::Result<Agent> {
        let victim = self.victim.lock().take();
        if victim == Some(agent.id) {
            self.inner.delete(&[agent.id]).await?;
        }
        self.inner.update(agent).await
    }

    async fn delete(&self, ids: &[AgentId]) -> shardlease_core::Result<()> {
        self.inner.delete(ids).await
    }
}

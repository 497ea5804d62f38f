//! Prometheus metrics for monitoring
//!
//! Process-wide counters, gauges and histograms describing pulse activity,
//! rendered in the Prometheus text exposition format.

use parking_lot::Mutex;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::agent::AgentState;

/// Name and help text shared by every metric kind
struct Descriptor {
    name: &'static str,
    help: &'static str,
}

impl Descriptor {
    fn header(&self, kind: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} {}", self.name, kind);
    }
}

/// Monotonic counter
pub struct Counter {
    desc: Descriptor,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn render(&self, out: &mut String) {
        self.desc.header("counter", out);
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
    }
}

/// Point-in-time value
pub struct Gauge {
    desc: Descriptor,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn render(&self, out: &mut String) {
        self.desc.header("gauge", out);
        let _ = writeln!(out, "{} {}", self.desc.name, self.get());
    }
}

/// Number of local agents per [`AgentState`], one `state` label each
pub struct StateGauge {
    desc: Descriptor,
    suspended: AtomicI64,
    rebalancing: AtomicI64,
    running: AtomicI64,
}

impl StateGauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            desc: Descriptor { name, help },
            suspended: AtomicI64::new(0),
            rebalancing: AtomicI64::new(0),
            running: AtomicI64::new(0),
        }
    }

    fn slot(&self, state: AgentState) -> &AtomicI64 {
        match state {
            AgentState::Suspended => &self.suspended,
            AgentState::Rebalancing => &self.rebalancing,
            AgentState::Running => &self.running,
        }
    }

    /// Move one agent between states; `None` stands for "no row"
    pub fn record_transition(&self, from: Option<AgentState>, to: Option<AgentState>) {
        if from == to {
            return;
        }
        if let Some(from) = from {
            self.slot(from).fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(to) = to {
            self.slot(to).fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, state: AgentState) -> i64 {
        self.slot(state).load(Ordering::Relaxed)
    }

    pub fn render(&self, out: &mut String) {
        self.desc.header("gauge", out);
        for state in [AgentState::Suspended, AgentState::Rebalancing, AgentState::Running] {
            let _ = writeln!(out, "{}{{state=\"{}\"}} {}", self.desc.name, state, self.get(state));
        }
    }
}

/// Latency distribution with cumulative buckets, in seconds
pub struct Histogram {
    desc: Descriptor,
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

/// Store round trips range from in-process maps to remote databases
const PULSE_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.025, 0.1, 0.25, 1.0, 2.5];

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_bounds(name, help, PULSE_BUCKETS)
    }

    pub fn with_bounds(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            desc: Descriptor { name, help },
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record the time elapsed since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn render(&self, out: &mut String) {
        let name = self.desc.name;
        self.desc.header("histogram", out);
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, bound, bucket.load(Ordering::Relaxed));
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, self.count());
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{}_sum {}", name, sum);
        let _ = writeln!(out, "{}_count {}", name, self.count());
    }
}

/// Standard coordination metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static PULSES: Counter = Counter::new("shardlease_pulses_total", "Pulses completed");
    pub static PULSE_FAILURES: Counter =
        Counter::new("shardlease_pulse_failures_total", "Pulses abandoned on a store failure");
    pub static REGISTRATIONS: Counter =
        Counter::new("shardlease_registrations_total", "Agent rows created, including re-registrations");
    pub static REBALANCES: Counter = Counter::new("shardlease_rebalances_total", "Writes in REBALANCING");
    pub static AGENTS_PRUNED: Counter =
        Counter::new("shardlease_agents_pruned_total", "Expired agent rows deleted");

    pub static LIVE_AGENTS: Gauge =
        Gauge::new("shardlease_live_agents", "Live agents in the last computed view");
    pub static LOCAL_AGENTS: StateGauge =
        StateGauge::new("shardlease_local_agents", "Agents of this process by persisted state");

    pub static PULSE_DURATION: LazyLock<Histogram> =
        LazyLock::new(|| Histogram::new("shardlease_pulse_duration_seconds", "Pulse latency"));

    /// Last time any pulse finished; a stale value points at a stalled loop
    pub static LAST_PULSE: Mutex<Option<Instant>> = Mutex::new(None);
}

/// Render every standard metric
pub fn gather_system_metrics() -> String {
    let mut out = String::new();

    for counter in [
        &standard::PULSES,
        &standard::PULSE_FAILURES,
        &standard::REGISTRATIONS,
        &standard::REBALANCES,
        &standard::AGENTS_PRUNED,
    ] {
        counter.render(&mut out);
    }
    standard::LIVE_AGENTS.render(&mut out);
    standard::LOCAL_AGENTS.render(&mut out);

    if let Some(last) = *standard::LAST_PULSE.lock() {
        let since = Descriptor {
            name: "shardlease_seconds_since_last_pulse",
            help: "Time since the last finished pulse",
        };
        since.header("gauge", &mut out);
        let _ = writeln!(out, "{} {}", since.name, last.elapsed().as_secs_f64());
    }

    standard::PULSE_DURATION.render(&mut out);
    out
}

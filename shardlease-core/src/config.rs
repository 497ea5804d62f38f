//! Coordination configuration

use chrono::TimeDelta;
use std::time::Duration;

use crate::agent::AgentType;
use crate::coordinator::ShardAssignmentDescriptor;
use crate::error::{CoordinationError, Result};
use crate::{
    DEFAULT_AGENT_TYPE, DEFAULT_LEASE_DURATION_MS, DEFAULT_PULSE_INTERVAL_MS,
    MIN_LEASE_TO_PULSE_RATIO,
};

/// Configuration for one node's pulser
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Coordination group this node joins
    pub agent_type: AgentType,
    /// Name stored in the agent row
    pub agent_name: String,
    /// Delay between two pulses
    pub pulse_interval: Duration,
    /// Lease granted by each renewal
    pub lease_duration: Duration,
    /// Administrator-pinned shard, bypasses dynamic assignment
    pub static_assignment: Option<ShardAssignmentDescriptor>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            agent_type: AgentType::new(DEFAULT_AGENT_TYPE),
            agent_name: format!("node-{}", uuid::Uuid::new_v4()),
            pulse_interval: Duration::from_millis(DEFAULT_PULSE_INTERVAL_MS),
            lease_duration: Duration::from_millis(DEFAULT_LEASE_DURATION_MS),
            static_assignment: None,
        }
    }
}

impl CoordinationConfig {
    /// Default configuration for a named node
    pub fn named(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            ..Default::default()
        }
    }

    /// Check the values before any pulse runs
    pub fn validate(&self) -> Result<()> {
        if self.agent_type.as_str().is_empty() {
            return Err(CoordinationError::InvalidConfig {
                reason: "agent type must not be empty".into(),
            });
        }
        if self.pulse_interval.is_zero() {
            return Err(CoordinationError::InvalidConfig {
                reason: "pulse interval must be positive".into(),
            });
        }
        if TimeDelta::from_std(self.lease_duration).is_err() {
            return Err(CoordinationError::InvalidConfig {
                reason: format!("lease duration {:?} is out of range", self.lease_duration),
            });
        }
        // One missed pulse must never cost the lease
        let min_lease = self.pulse_interval.checked_mul(MIN_LEASE_TO_PULSE_RATIO);
        if min_lease.map_or(true, |min| self.lease_duration < min) {
            return Err(CoordinationError::InvalidConfig {
                reason: format!(
                    "lease duration {:?} must be at least {} times the pulse interval {:?}",
                    self.lease_duration, MIN_LEASE_TO_PULSE_RATIO, self.pulse_interval
                ),
            });
        }
        Ok(())
    }
}

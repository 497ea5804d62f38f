//! View epoch tracking
//!
//! Every distinct cluster view a node observes starts a new epoch. A node
//! only claims shards once its view has held for a few consecutive pulses.

use tracing::debug;

use super::membership::ClusterDescriptor;

/// Consecutive pulses a view must hold before a node may start running
pub const MIN_STABLE_PULSES: u32 = 2;

/// Result of observing one view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewObservation {
    /// The view differs from the previous pulse
    pub changed: bool,
    /// Epoch number of the observed view
    pub epoch: u64,
    /// Consecutive pulses, including this one, that saw this view
    pub stable_pulses: u32,
}

impl ViewObservation {
    pub fn is_stable(&self) -> bool {
        self.stable_pulses >= MIN_STABLE_PULSES
    }
}

/// Tracks the view of the previous pulse
#[derive(Debug, Default)]
pub struct EpochTracker {
    last_view: Option<ClusterDescriptor>,
    epoch: u64,
    stable_pulses: u32,
}

impl EpochTracker {
    /// Create a tracker that has seen nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the view computed by the current pulse
    pub fn observe(&mut self, view: &ClusterDescriptor) -> ViewObservation {
        let changed = self.last_view.as_ref() != Some(view);
        if changed {
            self.epoch += 1;
            self.stable_pulses = 1;
            self.last_view = Some(view.clone());
            debug!("View epoch {} started with members {}", self.epoch, view);
        } else {
            self.stable_pulses = self.stable_pulses.saturating_add(1);
        }

        ViewObservation {
            changed,
            epoch: self.epoch,
            stable_pulses: self.stable_pulses,
        }
    }

    /// Forget the previous view, e.g. after re-registering
    pub fn reset(&mut self) {
        self.last_view = None;
        self.stable_pulses = 0;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_view(&self) -> Option<&ClusterDescriptor> {
        self.last_view.as_ref()
    }
}

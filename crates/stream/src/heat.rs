//! Connection heat - backlog severity of a subscription

use contracts::ConnectionHeat;

/// Classifies pending-item counts into heat levels with hysteresis
///
/// Raising the level happens as soon as a threshold is reached; lowering it
/// requires the backlog to fall `hysteresis` items below the threshold.
#[derive(Debug, Clone)]
pub struct HeatTracker {
    thresholds: [usize; 3],
    hysteresis: usize,
    current: ConnectionHeat,
}

impl Default for HeatTracker {
    fn default() -> Self {
        Self::new([100, 200, 300], 20)
    }
}

impl HeatTracker {
    pub fn new(thresholds: [usize; 3], hysteresis: usize) -> Self {
        Self {
            thresholds,
            hysteresis,
            current: ConnectionHeat::None,
        }
    }

    pub fn current(&self) -> ConnectionHeat {
        self.current
    }

    /// Feed a pending count; returns the new level only when it changed.
    pub fn update(&mut self, pending: usize) -> Option<ConnectionHeat> {
        let raw = self.classify(pending);
        let next = if raw >= self.current {
            raw
        } else {
            self.classify(pending.saturating_add(self.hysteresis))
                .min(self.current)
        };

        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }

    fn classify(&self, pending: usize) -> ConnectionHeat {
        let [low, medium, high] = self.thresholds;
        if pending >= high {
            ConnectionHeat::High
        } else if pending >= medium {
            ConnectionHeat::Medium
        } else if pending >= low {
            ConnectionHeat::Low
        } else {
            ConnectionHeat::None
        }
    }
}

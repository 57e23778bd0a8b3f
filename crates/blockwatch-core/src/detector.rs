//! Staleness evaluation and the per-episode trigger set.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::unit::UnitId;

/// A unit whose heartbeat crossed the threshold on this evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breach {
    pub unit: UnitId,
    pub staleness: Duration,
}

/// Tracks which units are currently in a blocked episode.
///
/// A unit triggers once when its staleness first exceeds the threshold and
/// stays triggered until an evaluation sees it within the threshold again.
#[derive(Debug, Clone)]
pub struct Detector {
    threshold: Duration,
    armed_at: Duration,
    triggered: BTreeSet<UnitId>,
}

impl Detector {
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            armed_at: Duration::ZERO,
            triggered: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start a fresh observation window at `now`.
    ///
    /// Heartbeats older than `now` are measured from `now`, and every open
    /// episode is closed.
    pub fn arm(&mut self, now: Duration) {
        self.armed_at = now;
        self.triggered.clear();
    }

    /// Staleness of a heartbeat at `now`.
    #[must_use]
    pub fn staleness(&self, now: Duration, last_seen: Duration) -> Duration {
        now.saturating_sub(last_seen.max(self.armed_at))
    }

    /// Evaluate one snapshot of `(unit, last_seen)` pairs.
    ///
    /// Returns the units that entered a blocked episode, ascending by id.
    /// Units absent from the snapshot leave the triggered set.
    pub fn evaluate<I>(&mut self, now: Duration, last_seen: I) -> Vec<Breach>
    where
        I: IntoIterator<Item = (UnitId, Duration)>,
    {
        let mut snapshot: Vec<(UnitId, Duration)> = last_seen.into_iter().collect();
        snapshot.sort_by_key(|(id, _)| *id);

        let present: BTreeSet<UnitId> = snapshot.iter().map(|(id, _)| *id).collect();
        self.triggered.retain(|id| present.contains(id));

        let mut breaches = Vec::new();
        for (unit, seen) in snapshot {
            let staleness = self.staleness(now, seen);
            if staleness > self.threshold {
                if self.triggered.insert(unit) {
                    breaches.push(Breach { unit, staleness });
                }
            } else {
                self.triggered.remove(&unit);
            }
        }
        breaches
    }

    /// Units currently in a blocked episode.
    #[must_use]
    pub fn triggered(&self) -> &BTreeSet<UnitId> {
        &self.triggered
    }

    #[must_use]
    pub fn is_triggered(&self, unit: UnitId) -> bool {
        self.triggered.contains(&unit)
    }
}

//! Lag compensation: a short rolling history of past pawn poses, rewound
//! for hit validation so a shooter's view of the world at the moment they
//! fired is honoured despite network latency.
//!
//! Grounded on `original_source/game_system/replication_infos.py`'s pawn
//! history sampling and `bge_network`'s rewind-execute-restore pattern for
//! server-side hit registration.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use engine_shared::math::{Quat, Vec3};
use engine_shared::replicable::ReplicableId;

/// How deep the history buffer reaches into the past.
pub const REWIND_HISTORY_SECONDS: f32 = 1.0;

/// One pawn's pose at a point in time.
#[derive(Debug, Clone, Copy)]
pub struct PawnSnapshot {
    pub position: Vec3,
    pub orientation: Quat,
    pub animation_frame: u32,
}

#[derive(Debug, Clone, Copy)]
struct TimedSnapshot {
    at: Instant,
    snapshot: PawnSnapshot,
}

/// A per-pawn ring of recent poses, pruned to [`REWIND_HISTORY_SECONDS`].
#[derive(Debug, Clone)]
pub struct PawnHistory {
    samples: VecDeque<TimedSnapshot>,
}

impl PawnHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant, snapshot: PawnSnapshot) {
        self.samples.push_back(TimedSnapshot { at: now, snapshot });
        let cutoff = now
            .checked_sub(Duration::from_secs_f32(REWIND_HISTORY_SECONDS))
            .unwrap_or(now);
        while let Some(front) = self.samples.front() {
            if front.at < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Finds the snapshot closest to `at`, preferring the most recent sample
    /// at or before it. Returns `None` if history doesn't reach back far
    /// enough.
    pub fn sample_at(&self, at: Instant) -> Option<PawnSnapshot> {
        let mut best: Option<&TimedSnapshot> = None;
        for sample in &self.samples {
            if sample.at <= at {
                best = Some(sample);
            } else {
                break;
            }
        }
        best.map(|s| s.snapshot)
    }
}

impl Default for PawnHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks rewindable history for every relevant pawn, keyed by replicable
/// id.
#[derive(Debug, Default)]
pub struct RewindBuffer {
    histories: std::collections::HashMap<ReplicableId, PawnHistory>,
}

impl RewindBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: ReplicableId, now: Instant, snapshot: PawnSnapshot) {
        self.histories.entry(id).or_insert_with(PawnHistory::new).record(now, snapshot);
    }

    /// Rewinds every tracked pawn to its pose at `at`, invokes `f` with the
    /// rewound poses for hit validation, then restores nothing itself (the
    /// caller's live world state is never mutated by this buffer; `f`
    /// operates purely on the snapshot map it's handed).
    pub fn with_rewound<R>(
        &self,
        at: Instant,
        f: impl FnOnce(&std::collections::HashMap<ReplicableId, PawnSnapshot>) -> R,
    ) -> R {
        let rewound: std::collections::HashMap<ReplicableId, PawnSnapshot> = self
            .histories
            .iter()
            .filter_map(|(id, history)| history.sample_at(at).map(|snap| (*id, snap)))
            .collect();
        f(&rewound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(x: f32) -> PawnSnapshot {
        PawnSnapshot {
            position: Vec3::new(x, 0.0, 0.0),
            orientation: Quat::default(),
            animation_frame: 0,
        }
    }

    #[test]
    fn sample_at_returns_the_most_recent_sample_at_or_before() {
        let mut history = PawnHistory::new();
        let t0 = Instant::now();
        history.record(t0, snap(1.0));
        let t1 = t0 + Duration::from_millis(100);
        history.record(t1, snap(2.0));

        let midpoint = t0 + Duration::from_millis(50);
        let sampled = history.sample_at(midpoint).unwrap();
        assert_eq!(sampled.position.x, 1.0);
    }

    #[test]
    fn old_samples_are_pruned_past_history_window() {
        let mut history = PawnHistory::new();
        let t0 = Instant::now();
        history.record(t0, snap(1.0));
        let much_later = t0 + Duration::from_secs_f32(REWIND_HISTORY_SECONDS + 0.5);
        history.record(much_later, snap(2.0));

        assert!(history.sample_at(t0).is_none());
        assert_eq!(history.sample_at(much_later).unwrap().position.x, 2.0);
    }

    #[test]
    fn rewind_buffer_rewinds_multiple_pawns_together() {
        let mut buffer = RewindBuffer::new();
        let t0 = Instant::now();
        let shooter = ReplicableId(1);
        let target = ReplicableId(2);
        buffer.record(shooter, t0, snap(0.0));
        buffer.record(target, t0, snap(10.0));

        let later = t0 + Duration::from_millis(10);
        buffer.record(target, later, snap(11.0));

        let hit = buffer.with_rewound(t0, |poses| {
            poses.get(&target).map(|s| s.position.x)
        });
        assert_eq!(hit, Some(10.0));
    }
}

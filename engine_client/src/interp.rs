//! Interpolation.
//!
//! Remote pawns replicate their pose at the replication channel's update
//! period, far slower than render rate. This buffers timestamped pose
//! samples per replicable and renders a short delay behind the newest one so
//! there's always a next sample to lerp toward.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use engine_shared::math::Vec3;
use engine_shared::replicable::ReplicableId;

/// Render this far behind the most recently received sample.
pub const INTERP_DELAY_SECS: f32 = 0.1;

#[derive(Debug, Clone, Copy)]
struct PoseSample {
    at: Instant,
    position: Vec3,
    yaw: f32,
}

/// Per-replicable pose history used to interpolate remote pawns.
pub struct InterpBuffer {
    history: HashMap<ReplicableId, VecDeque<PoseSample>>,
    capacity: usize,
}

impl InterpBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: HashMap::new(),
            capacity,
        }
    }

    pub fn record(&mut self, id: ReplicableId, at: Instant, position: Vec3, yaw: f32) {
        let buf = self.history.entry(id).or_insert_with(VecDeque::new);
        buf.push_back(PoseSample { at, position, yaw });
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    pub fn forget(&mut self, id: ReplicableId) {
        self.history.remove(&id);
    }

    /// Interpolated pose for `id` as of `now`, or `None` if nothing has been
    /// recorded for it yet.
    pub fn sample(&self, id: ReplicableId, now: Instant) -> Option<(Vec3, f32)> {
        let buf = self.history.get(&id)?;
        let newest = buf.back()?;
        if buf.len() < 2 {
            return Some((newest.position, newest.yaw));
        }

        let render_at = now.checked_sub(Duration::from_secs_f32(INTERP_DELAY_SECS)).unwrap_or(now);

        let mut prev = buf.front().unwrap();
        for sample in buf.iter() {
            if sample.at >= render_at {
                let span = sample.at.saturating_duration_since(prev.at).as_secs_f32();
                let t = if span > 0.0 {
                    render_at.saturating_duration_since(prev.at).as_secs_f32() / span
                } else {
                    1.0
                };
                return Some((prev.position.lerp(sample.position, t), prev.yaw + (sample.yaw - prev.yaw) * t.clamp(0.0, 1.0)));
            }
            prev = sample;
        }
        Some((newest.position, newest.yaw))
    }

    pub fn len(&self, id: ReplicableId) -> usize {
        self.history.get(&id).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_is_returned_as_is() {
        let mut buf = InterpBuffer::new(8);
        let id = ReplicableId(3);
        let now = Instant::now();
        buf.record(id, now, Vec3::new(1.0, 0.0, 0.0), 0.0);
        assert_eq!(buf.sample(id, now), Some((Vec3::new(1.0, 0.0, 0.0), 0.0)));
    }

    #[test]
    fn interpolates_between_two_samples() {
        let mut buf = InterpBuffer::new(8);
        let id = ReplicableId(1);
        let t0 = Instant::now();
        buf.record(id, t0, Vec3::ZERO, 0.0);
        buf.record(id, t0 + Duration::from_millis(200), Vec3::new(2.0, 0.0, 0.0), 0.0);

        let (pos, _yaw) = buf.sample(id, t0 + Duration::from_millis(200)).unwrap();
        // render_at = now - 100ms = t0 + 100ms, halfway between the two samples.
        assert!((pos.x - 1.0).abs() < 1e-3);
    }

    #[test]
    fn capacity_bounds_history() {
        let mut buf = InterpBuffer::new(2);
        let id = ReplicableId(5);
        let t0 = Instant::now();
        for i in 0..5 {
            buf.record(id, t0 + Duration::from_millis(i * 10), Vec3::ZERO, 0.0);
        }
        assert_eq!(buf.len(id), 2);
    }

    #[test]
    fn forget_clears_history() {
        let mut buf = InterpBuffer::new(4);
        let id = ReplicableId(9);
        buf.record(id, Instant::now(), Vec3::ZERO, 0.0);
        buf.forget(id);
        assert_eq!(buf.len(id), 0);
        assert!(buf.sample(id, Instant::now()).is_none());
    }
}

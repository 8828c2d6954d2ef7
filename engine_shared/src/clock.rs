//! Clock synchronisation: the server broadcasts its elapsed simulated time,
//! the client nudges or snaps its own estimate toward it.
//!
//! Grounded on the prediction/reconciliation design notes (no direct
//! `Clock` replicable file was retrieved in the pack; thresholds are taken
//! from those notes verbatim).

use std::time::Duration;

/// Below this difference, no correction is applied.
pub const NUDGE_MINIMUM_SECS: f64 = 0.05;
/// Above this difference, the client snaps rather than nudges.
pub const NUDGE_MAXIMUM_SECS: f64 = 0.4;
/// Fraction of the difference consumed by one nudge.
pub const NUDGE_FACTOR: f64 = 0.8;

/// Server-side: periodically broadcasts `elapsed` on a replicated `Clock`
/// attribute. The period itself is a replication concern (handled by the
/// owning channel's update period); this type only tracks elapsed time.
#[derive(Debug, Default)]
pub struct ServerClock {
    pub elapsed: f64,
}

impl ServerClock {
    pub fn tick(&mut self, delta: Duration) {
        self.elapsed += delta.as_secs_f64();
    }
}

/// Client-side estimate of the server's elapsed time, corrected toward the
/// server's broadcast value by nudging (small drift) or snapping (large
/// drift, e.g. after a stall).
#[derive(Debug, Default)]
pub struct ClockSync {
    pub estimated_elapsed_server: f64,
    pub local_elapsed: f64,
}

impl ClockSync {
    pub fn tick(&mut self, delta: Duration) {
        self.local_elapsed += delta.as_secs_f64();
        self.estimated_elapsed_server += delta.as_secs_f64();
    }

    /// Applies one correction step given a freshly received server elapsed
    /// time and the connection's current estimated ping.
    pub fn on_server_update(&mut self, server_elapsed: f64, ping: Duration) {
        self.estimated_elapsed_server = server_elapsed;
        let diff = self.estimated_elapsed_server - (self.local_elapsed + ping.as_secs_f64());

        if diff.abs() < NUDGE_MINIMUM_SECS {
            return;
        }

        if diff.abs() > NUDGE_MAXIMUM_SECS {
            self.estimated_elapsed_server -= diff;
        } else {
            self.estimated_elapsed_server -= diff * NUDGE_FACTOR;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_diff_is_ignored() {
        let mut clock = ClockSync {
            estimated_elapsed_server: 10.0,
            local_elapsed: 9.98,
        };
        clock.on_server_update(10.0, Duration::from_millis(0));
        assert_eq!(clock.estimated_elapsed_server, 10.0);
    }

    #[test]
    fn large_diff_snaps_immediately() {
        let mut clock = ClockSync {
            estimated_elapsed_server: 11.0,
            local_elapsed: 10.0,
        };
        clock.on_server_update(11.0, Duration::from_millis(0));
        assert_eq!(clock.estimated_elapsed_server, 10.0);
    }

    #[test]
    fn moderate_diff_nudges_by_factor() {
        let mut clock = ClockSync {
            estimated_elapsed_server: 10.2,
            local_elapsed: 10.0,
        };
        clock.on_server_update(10.2, Duration::from_millis(0));
        // diff = 0.2, nudge = diff * 0.8 = 0.16, result = 10.2 - 0.16 = 10.04
        assert!((clock.estimated_elapsed_server - 10.04).abs() < 1e-9);
    }
}

//! Adaptive poll-interval backoff, shared between `hither-remote`'s feed tailing and
//! `hither-broker`'s per-connection workers. Ported from the Python source's
//! `_compute_next_delay`: polls tightly right after activity, then backs off smoothly toward a
//! ceiling as a subfeed goes quiet, so an idle connection doesn't spin but an active one stays
//! responsive.

use std::time::{Duration, Instant};

const MIN_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(6);
const RAMP: Duration = Duration::from_secs(60);

/// Tracks time since the last observed activity and hands back an increasingly relaxed poll
/// delay as quiescence continues.
pub struct AdaptivePoller {
    last_action: Instant,
}

impl AdaptivePoller {
    pub fn new() -> Self {
        Self {
            last_action: Instant::now(),
        }
    }

    /// Resets the backoff; call this whenever a poll actually observed new activity.
    pub fn note_activity(&mut self) {
        self.last_action = Instant::now();
    }

    /// The delay to sleep before the next poll, given `now`. Ramps linearly from [`MIN_DELAY`]
    /// to [`MAX_DELAY`] over [`RAMP`] of quiescence, then holds at the ceiling.
    pub fn next_delay_at(&self, now: Instant) -> Duration {
        let quiet_for = now.saturating_duration_since(self.last_action);
        if quiet_for >= RAMP {
            return MAX_DELAY;
        }
        let frac = quiet_for.as_secs_f64() / RAMP.as_secs_f64();
        let span = (MAX_DELAY - MIN_DELAY).as_secs_f64();
        MIN_DELAY + Duration::from_secs_f64(span * frac)
    }

    pub fn next_delay(&self) -> Duration {
        self.next_delay_at(Instant::now())
    }
}

impl Default for AdaptivePoller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_from_min_toward_max_as_time_passes() {
        let poller = AdaptivePoller::new();
        let start = poller.last_action;
        assert_eq!(poller.next_delay_at(start), MIN_DELAY);
        assert_eq!(poller.next_delay_at(start + RAMP), MAX_DELAY);
        assert_eq!(poller.next_delay_at(start + RAMP * 10), MAX_DELAY);

        let halfway = poller.next_delay_at(start + RAMP / 2);
        assert!(halfway > MIN_DELAY && halfway < MAX_DELAY);
    }

    #[test]
    fn noting_activity_resets_the_backoff() {
        let mut poller = AdaptivePoller::new();
        let later = poller.last_action + RAMP;
        assert_eq!(poller.next_delay_at(later), MAX_DELAY);
        poller.note_activity();
        assert_eq!(poller.next_delay_at(poller.last_action), MIN_DELAY);
    }
}

use crate::config::ThrottleConfig;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Unchanged,
    Increased { from: u64, to: u64 },
    Decreased { from: u64, to: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSnapshot {
    pub automatic_interval_secs: u64,
    pub consecutive_successes: u32,
}

struct ThrottleState {
    automatic_interval_secs: u64,
    consecutive_successes: u32,
}

/// Process-wide AIMD controller for the automatic polling interval. Every
/// execution outcome feeds it; `Automatic` sessions follow the published
/// value through [`subscribe`](Self::subscribe).
pub struct AdaptiveIntervalController {
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
    interval_tx: watch::Sender<u64>,
}

impl AdaptiveIntervalController {
    pub fn new(config: ThrottleConfig) -> Self {
        let initial = config
            .initial_interval_secs
            .clamp(config.min_interval_secs, config.max_interval_secs);
        let (interval_tx, _) = watch::channel(initial);
        Self {
            config,
            state: Mutex::new(ThrottleState {
                automatic_interval_secs: initial,
                consecutive_successes: 0,
            }),
            interval_tx,
        }
    }

    pub fn current_interval(&self) -> u64 {
        self.lock().automatic_interval_secs
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let state = self.lock();
        ThrottleSnapshot {
            automatic_interval_secs: state.automatic_interval_secs,
            consecutive_successes: state.consecutive_successes,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.interval_tx.subscribe()
    }

    pub fn report_outcome(&self, success: bool) -> Adjustment {
        let mut state = self.lock();
        let from = state.automatic_interval_secs;

        let adjustment = if success {
            state.consecutive_successes += 1;
            if state.consecutive_successes < self.config.success_window {
                debug!(
                    event = "throttle_success",
                    streak = state.consecutive_successes,
                    window = self.config.success_window
                );
                return Adjustment::Unchanged;
            }
            state.consecutive_successes = 0;
            let to = ((from as f64) * self.config.decrease_factor).floor() as u64;
            let to = to.max(self.config.min_interval_secs);
            if to == from {
                Adjustment::Unchanged
            } else {
                Adjustment::Decreased { from, to }
            }
        } else {
            state.consecutive_successes = 0;
            let to = ((from as f64) * self.config.increase_factor).ceil() as u64;
            let to = to.min(self.config.max_interval_secs);
            if to == from {
                Adjustment::Unchanged
            } else {
                Adjustment::Increased { from, to }
            }
        };

        if let Adjustment::Increased { to, .. } | Adjustment::Decreased { to, .. } = adjustment {
            state.automatic_interval_secs = to;
            // Publish under the lock to keep subscriber updates ordered.
            self.interval_tx.send_replace(to);
            info!(
                event = "interval_adjusted",
                from = from,
                to = to,
                success = success
            );
        }
        adjustment
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveIntervalController {
        AdaptiveIntervalController::new(ThrottleConfig::default())
    }

    #[test]
    fn failure_doubles_and_clamps_at_max() {
        let controller = controller();
        assert_eq!(controller.current_interval(), 3);
        assert_eq!(
            controller.report_outcome(false),
            Adjustment::Increased { from: 3, to: 6 }
        );
        for _ in 0..10 {
            controller.report_outcome(false);
        }
        assert_eq!(controller.current_interval(), 120);
        assert_eq!(controller.report_outcome(false), Adjustment::Unchanged);
    }

    #[test]
    fn only_a_full_success_window_decreases() {
        let controller = controller();
        controller.report_outcome(false);
        controller.report_outcome(false);
        assert_eq!(controller.current_interval(), 12);

        for _ in 0..4 {
            assert_eq!(controller.report_outcome(true), Adjustment::Unchanged);
        }
        assert_eq!(controller.current_interval(), 12);
        assert_eq!(
            controller.report_outcome(true),
            Adjustment::Decreased { from: 12, to: 6 }
        );
        assert_eq!(controller.snapshot().consecutive_successes, 0);
    }

    #[test]
    fn failure_resets_the_success_streak() {
        let controller = controller();
        controller.report_outcome(false);
        for _ in 0..4 {
            controller.report_outcome(true);
        }
        controller.report_outcome(false);
        assert_eq!(controller.snapshot().consecutive_successes, 0);
        for _ in 0..4 {
            controller.report_outcome(true);
        }
        assert_eq!(controller.current_interval(), 12);
    }

    #[test]
    fn decrease_is_clamped_at_min() {
        let controller = controller();
        for _ in 0..5 {
            controller.report_outcome(true);
        }
        assert_eq!(controller.current_interval(), 3);
    }

    #[test]
    fn interval_stays_within_bounds_for_mixed_outcomes() {
        let controller = controller();
        let pattern = [false, true, true, false, false, false, true, true, true, true, true];
        for step in 0..200 {
            controller.report_outcome(pattern[step % pattern.len()]);
            let interval = controller.current_interval();
            assert!((3..=120).contains(&interval), "interval {interval} out of range");
        }
    }

    #[test]
    fn increases_round_up_and_decreases_round_down() {
        let controller = AdaptiveIntervalController::new(ThrottleConfig {
            min_interval_secs: 1,
            max_interval_secs: 100,
            initial_interval_secs: 5,
            increase_factor: 1.5,
            decrease_factor: 0.5,
            success_window: 1,
        });
        assert_eq!(
            controller.report_outcome(false),
            Adjustment::Increased { from: 5, to: 8 }
        );
        assert_eq!(
            controller.report_outcome(true),
            Adjustment::Decreased { from: 8, to: 4 }
        );
        assert_eq!(
            controller.report_outcome(true),
            Adjustment::Decreased { from: 4, to: 2 }
        );
    }

    #[test]
    fn changes_are_published_to_subscribers() {
        let controller = controller();
        let mut rx = controller.subscribe();
        assert_eq!(*rx.borrow_and_update(), 3);

        controller.report_outcome(true);
        assert!(!rx.has_changed().expect("sender alive"));

        controller.report_outcome(false);
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(*rx.borrow_and_update(), 6);
    }
}

use pairlink_core::config::QualityConfig;
use pairlink_core::QualityDirection;
use tokio::time::Instant;
use tracing::{debug, info};

// MARK: - QualityController

/// Closed-loop quality policy driven by the decoder's frame counter.
///
/// Fed one cumulative decoded-frame count per tick. Works on the delta since
/// the previous tick:
///
/// | delta               | effect                                                    |
/// |---------------------|-----------------------------------------------------------|
/// | `< stall_threshold` | streak = 0; `decrease` if the decrease cooldown elapsed   |
/// | `>= good_threshold` | streak += 1; `increase` once streak hits `good_streak` and the increase cooldown elapsed |
/// | otherwise           | streak = 0                                                |
///
/// Both cooldowns count from the last change in either direction. Before the
/// first change there is nothing to cool down from.
#[derive(Debug)]
pub struct QualityController {
    config: QualityConfig,
    previous: Option<u64>,
    good_streak: u32,
    last_change: Option<Instant>,
}

impl QualityController {
    pub fn new(config: QualityConfig) -> Self {
        Self { config, previous: None, good_streak: 0, last_change: None }
    }

    /// Forget everything. A controller restarted after `reset` behaves like
    /// a new one.
    pub fn reset(&mut self) {
        self.previous = None;
        self.good_streak = 0;
        self.last_change = None;
    }

    pub fn good_streak(&self) -> u32 {
        self.good_streak
    }

    /// Feed one cumulative sample taken at `now`.
    pub fn on_sample(&mut self, decoded_total: u64, now: Instant) -> Option<QualityDirection> {
        let previous = self.previous.replace(decoded_total)?;

        // Counter went backwards: the engine restarted its session. Rebaseline.
        let Some(delta) = decoded_total.checked_sub(previous) else {
            debug!("[Quality] Frame counter reset ({} → {})", previous, decoded_total);
            self.good_streak = 0;
            return None;
        };

        if delta < self.config.stall_threshold {
            self.good_streak = 0;
            if self.cooled_down(now, self.config.decrease_cooldown()) {
                info!("[Quality] Stall ({} frames/tick) → decrease", delta);
                self.last_change = Some(now);
                return Some(QualityDirection::Decrease);
            }
            debug!("[Quality] Stall ({} frames/tick), decrease cooling down", delta);
        } else if delta >= self.config.good_threshold {
            self.good_streak += 1;
            if self.good_streak >= self.config.good_streak
                && self.cooled_down(now, self.config.increase_cooldown())
            {
                info!("[Quality] {} good ticks → increase", self.good_streak);
                self.last_change = Some(now);
                self.good_streak = 0;
                return Some(QualityDirection::Increase);
            }
        } else {
            self.good_streak = 0;
        }
        None
    }

    fn cooled_down(&self, now: Instant, cooldown: std::time::Duration) -> bool {
        self.last_change
            .map_or(true, |changed| now.saturating_duration_since(changed) >= cooldown)
    }
}

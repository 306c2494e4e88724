// src/api/window.rs
//! Trailing-interval event counter used for quota admission.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Timestamps of admitted events inside a fixed trailing window.
///
/// Pruning is lazy: every read or write first drops events that have aged
/// out, so after any call no stored timestamp is older than `now - duration`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    events: VecDeque<Instant>,
    duration: Duration,
}

impl SlidingWindow {
    pub fn new(duration: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Changing the duration keeps recorded events; the next call prunes
    /// against the new length.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Records an event at the current instant.
    pub fn add_event(&mut self) {
        let now = Instant::now();
        self.prune(now);
        self.events.push_back(now);
    }

    /// Number of events with timestamp `> now - duration`.
    pub fn count(&mut self) -> usize {
        self.prune(Instant::now());
        self.events.len()
    }

    /// Time until the oldest event leaves the window, zero when empty.
    pub fn time_to_next_slot(&mut self) -> Duration {
        let now = Instant::now();
        self.prune(now);
        match self.events.front() {
            Some(oldest) => self
                .duration
                .saturating_sub(now.saturating_duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.saturating_duration_since(*front) >= self.duration {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_count_prunes_expired_events() {
        let mut window = SlidingWindow::new(Duration::from_millis(1000));
        window.add_event();
        advance(Duration::from_millis(400)).await;
        window.add_event();
        assert_eq!(window.count(), 2);

        advance(Duration::from_millis(600)).await;
        // First event is exactly one window old
        assert_eq!(window.count(), 1);

        advance(Duration::from_millis(400)).await;
        assert_eq!(window.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_to_next_slot() {
        let mut window = SlidingWindow::new(Duration::from_millis(1000));
        assert_eq!(window.time_to_next_slot(), Duration::ZERO);

        window.add_event();
        advance(Duration::from_millis(250)).await;
        window.add_event();
        assert_eq!(window.time_to_next_slot(), Duration::from_millis(750));

        advance(Duration::from_millis(750)).await;
        // Oldest expired, second event has 250ms left
        assert_eq!(window.time_to_next_slot(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_duration_prunes_on_next_read() {
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        window.add_event();
        advance(Duration::from_secs(5)).await;
        assert_eq!(window.count(), 1);

        window.set_duration(Duration::from_secs(2));
        assert_eq!(window.count(), 0);
    }
}

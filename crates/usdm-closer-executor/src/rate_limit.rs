/*
[INPUT]:  Acquire attempts with monotonic timestamps
[OUTPUT]: Per-second sliding-window admission decisions
[POS]:    Risk layer - account-level soft rate limiting
[UPDATE]: When window semantics or capacity handling change
*/

use std::collections::VecDeque;

/// Sliding-window counter: at most `max_events` acquisitions in the
/// trailing `window_ms`. Acquiring consumes quota; rejected attempts do not.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    max_events: usize,
    window_ms: i64,
    events: VecDeque<i64>,
}

impl SlidingWindowRateLimiter {
    pub fn new(max_events: usize, window_ms: i64) -> Self {
        Self {
            max_events,
            window_ms,
            events: VecDeque::new(),
        }
    }

    /// Try to take one slot at `now_ms` (monotonic).
    pub fn try_acquire(&mut self, now_ms: i64) -> bool {
        let cutoff = now_ms - self.window_ms;
        while let Some(front) = self.events.front() {
            if *front <= cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }

        if self.events.len() >= self.max_events {
            return false;
        }
        self.events.push_back(now_ms);
        true
    }

    pub fn in_window(&self) -> usize {
        self.events.len()
    }
}

use crate::config::RateLimitRule;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Widest window any rule may configure; older entries are pruned.
const RETENTION: Duration = Duration::from_secs(60);
/// Hard cap on tracked entries to bound memory per connection.
const MAX_TRACKED: usize = 1000;

/// Per-connection sliding-window frame tracker.
///
/// Unlike a fixed window that resets at interval boundaries, this records
/// individual frame timestamps and counts only those inside each rule's
/// sliding window, so a burst straddling a window edge cannot double the
/// admitted rate.
///
/// A rule's `messageTypes` list gates whether the rule applies to the
/// current frame; the count itself spans every recorded frame, matching
/// the enforcer this replaces.
#[derive(Debug)]
pub struct RateLimiter {
    window: VecDeque<Instant>,
}

impl RateLimiter {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(64),
        }
    }

    /// Drop entries older than the retention horizon.
    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.window.front() {
            if now.duration_since(front) >= RETENTION {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames recorded within the trailing `window`.
    fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.window
            .iter()
            .rev()
            .take_while(|&&at| now.duration_since(at) <= window)
            .count()
    }

    /// Evaluate every enabled rule against `msg_type` and record the frame
    /// when admitted. Returns `false` when any rule rejects it.
    pub fn check_and_record(&mut self, rules: &[RateLimitRule], msg_type: &str) -> bool {
        let now = Instant::now();
        self.prune(now);

        for rule in rules.iter().filter(|r| r.enabled) {
            if let Some(types) = &rule.message_types {
                if !types.iter().any(|t| t == msg_type) {
                    continue;
                }
            }
            let window = Duration::from_millis(rule.window_ms);
            if self.count_within(now, window) >= rule.max_messages as usize {
                return false;
            }
        }

        self.window.push_back(now);
        if self.window.len() > MAX_TRACKED {
            self.window.pop_front();
        }
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The open may proceed; it has been counted.
    Allow,
    /// The window is full. Retry after `wait`.
    Deny { wait: Duration },
}

/// Fixed one-second window limiter for subscription opens.
///
/// Process-wide, no persistence across restarts. Callers are not
/// queued: a denied caller sleeps for the returned wait and retries
/// on its own.
#[derive(Debug)]
pub struct RateLimiter {
    cap: u32,
    window: Duration,
    state: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn per_second(cap: u32) -> Self {
        Self {
            cap,
            window: Duration::from_secs(1),
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Counts one open against the current window if there is room.
    pub fn try_open(&self) -> RateDecision {
        let now = Instant::now();
        let mut window = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if now.duration_since(window.started) >= self.window {
            window.started = now;
            window.count = 0;
        }

        if window.count < self.cap {
            window.count += 1;
            RateDecision::Allow
        } else {
            RateDecision::Deny {
                wait: (window.started + self.window).saturating_duration_since(now),
            }
        }
    }

    /// Opens counted in the current window.
    #[cfg(test)]
    pub fn in_window(&self) -> u32 {
        let window = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if window.started.elapsed() >= self.window { 0 } else { window.count }
    }
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Failed attempts allowed inside one window.
pub const MAX_FAILURES: u32 = 5;
/// Failures older than this no longer count.
pub const WINDOW: Duration = Duration::from_secs(60);
/// How long a key stays locked once it hits `MAX_FAILURES`.
pub const LOCKOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct Attempts {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl Attempts {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// Unlock attempt limiter, keyed by lock method.
///
/// A rejected secret or face counts as a failure. Errors that never reached a
/// verdict (camera timeout, no face in frame) are not counted.
#[derive(Debug, Default)]
pub struct RateLimiter {
    keys: HashMap<String, Attempts>,
}

impl RateLimiter {
    /// `Err(remaining)` while `key` is locked out.
    pub fn check(&mut self, key: &str, now: Instant) -> Result<(), Duration> {
        let Some(attempts) = self.keys.get_mut(key) else {
            return Ok(());
        };
        if let Some(until) = attempts.locked_until {
            if now < until {
                return Err(until.duration_since(now));
            }
            *attempts = Attempts::fresh(now);
        } else if now.duration_since(attempts.window_start) >= WINDOW {
            *attempts = Attempts::fresh(now);
        }
        Ok(())
    }

    pub fn record_failure(&mut self, key: &str, now: Instant) {
        let attempts = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Attempts::fresh(now));
        if now.duration_since(attempts.window_start) >= WINDOW {
            *attempts = Attempts::fresh(now);
        }
        attempts.failures += 1;
        if attempts.failures >= MAX_FAILURES {
            attempts.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                key,
                failures = attempts.failures,
                lockout_secs = LOCKOUT.as_secs(),
                "too many failed unlocks; locking out"
            );
        } else {
            tracing::debug!(key, failures = attempts.failures, max = MAX_FAILURES, "unlock rejected");
        }
    }

    pub fn record_success(&mut self, key: &str) {
        self.keys.remove(key);
    }
}

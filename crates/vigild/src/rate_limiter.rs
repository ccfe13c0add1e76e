use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Failures tolerated inside one window before lockout.
const MAX_FAILURES: u32 = 5;
const WINDOW: Duration = Duration::from_secs(60);
const LOCKOUT: Duration = Duration::from_secs(300);

struct UserRecord {
    failures: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl UserRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            failures: 0,
            window_start: now,
            locked_until: None,
        }
    }
}

/// The user is locked out for at least `retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locked {
    pub retry_after: Duration,
}

/// Per-user limiter for face verification attempts.
///
/// Only refusals the user is responsible for (face mismatch, insufficient
/// liveness) count as failures. Token and storage errors never do.
pub struct RateLimiter {
    max_failures: u32,
    window: Duration,
    lockout: Duration,
    records: HashMap<String, UserRecord>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::with_limits(MAX_FAILURES, WINDOW, LOCKOUT)
    }
}

impl RateLimiter {
    pub fn with_limits(max_failures: u32, window: Duration, lockout: Duration) -> Self {
        Self {
            max_failures,
            window,
            lockout,
            records: HashMap::new(),
        }
    }

    /// `Err` while the user is locked out.
    pub fn check(&mut self, user: &str) -> Result<(), Locked> {
        let now = Instant::now();
        let Some(record) = self.records.get_mut(user) else {
            return Ok(());
        };

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                return Err(Locked {
                    retry_after: locked_until.duration_since(now),
                });
            }
            *record = UserRecord::fresh(now);
        } else if now.duration_since(record.window_start) >= self.window {
            *record = UserRecord::fresh(now);
        }

        Ok(())
    }

    /// Record a failed attempt. May trigger a lockout.
    pub fn record_failure(&mut self, user: &str) {
        let now = Instant::now();
        let record = self
            .records
            .entry(user.to_string())
            .or_insert_with(|| UserRecord::fresh(now));

        if now.duration_since(record.window_start) >= self.window {
            *record = UserRecord::fresh(now);
        }

        record.failures += 1;
        if record.failures >= self.max_failures {
            record.locked_until = Some(now + self.lockout);
            tracing::warn!(
                user,
                failures = record.failures,
                lockout_secs = self.lockout.as_secs(),
                "rate limit triggered, locking user"
            );
        } else {
            tracing::debug!(
                user,
                failures = record.failures,
                max = self.max_failures,
                "verify failed, incrementing failure counter"
            );
        }
    }

    /// A successful verification clears the user's record.
    pub fn record_success(&mut self, user: &str) {
        self.records.remove(user);
    }
}

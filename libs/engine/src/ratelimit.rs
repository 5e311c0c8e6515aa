use std::cell::Cell;
use std::time::{Duration, Instant};

/// A token bucket gating repeated warnings.
///
/// Malformed input is re-observed on every reconciliation pass; every warn
/// site in the engine goes through one of these so broken configuration
/// cannot flood the log. Interior mutability keeps the limiter usable from
/// shared pass context.
#[derive(Debug)]
pub(crate) struct RateLimit {
    min_interval: Duration,
    last: Cell<Option<Instant>>,
    suppressed: Cell<u64>,
}

impl RateLimit {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Cell::new(None),
            suppressed: Cell::new(0),
        }
    }

    /// Whether a message may be emitted at `now`.
    ///
    /// On `true`, the number of messages suppressed since the last emission
    /// is returned alongside (and reset).
    pub(crate) fn allow(&self, now: Instant) -> Option<u64> {
        match self.last.get() {
            Some(last) if now.duration_since(last) < self.min_interval => {
                self.suppressed.set(self.suppressed.get() + 1);

                None
            }
            _ => {
                self.last.set(Some(now));

                Some(self.suppressed.replace(0))
            }
        }
    }
}

/// Emits a rate-limited `tracing::warn!`.
///
/// The limiter is evaluated first; suppressed counts are appended so bursts
/// remain visible.
macro_rules! warn_rl {
    ($limit:expr, $now:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $limit.allow($now) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

pub(crate) use warn_rl;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_passes() {
        let rl = RateLimit::new(Duration::from_secs(1));

        assert_eq!(rl.allow(Instant::now()), Some(0));
    }

    #[test]
    fn second_message_within_interval_is_suppressed() {
        let rl = RateLimit::new(Duration::from_secs(1));
        let now = Instant::now();

        assert_eq!(rl.allow(now), Some(0));
        assert_eq!(rl.allow(now), None);
        assert_eq!(rl.allow(now + Duration::from_millis(999)), None);
    }

    #[test]
    fn suppressed_count_is_reported_after_interval() {
        let rl = RateLimit::new(Duration::from_secs(1));
        let now = Instant::now();

        assert_eq!(rl.allow(now), Some(0));
        assert_eq!(rl.allow(now), None);
        assert_eq!(rl.allow(now), None);
        assert_eq!(rl.allow(now + Duration::from_secs(1)), Some(2));
    }
}

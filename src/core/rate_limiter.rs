use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::core::config::Settings;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// One fixed counting window.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self { count: 0, started: now }
    }

    fn roll(&mut self, now: Instant, length: Duration) {
        if now.duration_since(self.started) > length {
            self.count = 0;
            self.started = now;
        }
    }

    fn reset_in(&self, now: Instant, length: Duration) -> Duration {
        (self.started + length).saturating_duration_since(now)
    }
}

#[derive(Debug, Clone, Copy)]
struct UserWindows {
    minute: Window,
    hour: Window,
    day: Window,
}

/// Per-user request rate limiter.
///
/// Each user has three fixed windows (minute, hour, day). A request is
/// counted in all three only when none of them is exhausted; a limited
/// request reports how long until the exhausted window resets.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<i64, UserWindows>>>,
    per_minute: u32,
    per_hour: u32,
    per_day: u32,
}

impl RateLimiter {
    /// Creates a rate limiter with the default limits (10/min, 50/hour, 200/day).
    pub fn new() -> Self {
        Self::with_limits(10, 50, 200)
    }

    pub fn with_limits(per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            per_minute,
            per_hour,
            per_day,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_limits(
            settings.rate_limit_per_minute,
            settings.rate_limit_per_hour,
            settings.rate_limit_per_day,
        )
    }

    /// Checks and records a request for `user_id`.
    ///
    /// Returns `Err(reset_in)` when the user is limited; nothing is counted in that case.
    pub async fn check(&self, user_id: i64) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(user_id).or_insert_with(|| UserWindows {
            minute: Window::new(now),
            hour: Window::new(now),
            day: Window::new(now),
        });

        entry.minute.roll(now, MINUTE);
        entry.hour.roll(now, HOUR);
        entry.day.roll(now, DAY);

        if entry.minute.count >= self.per_minute {
            return Err(entry.minute.reset_in(now, MINUTE));
        }
        if entry.hour.count >= self.per_hour {
            return Err(entry.hour.reset_in(now, HOUR));
        }
        if entry.day.count >= self.per_day {
            return Err(entry.day.reset_in(now, DAY));
        }

        entry.minute.count += 1;
        entry.hour.count += 1;
        entry.day.count += 1;
        Ok(())
    }

    /// Time until the user may make another request, if currently limited.
    pub async fn remaining_time(&self, user_id: i64) -> Option<Duration> {
        let now = Instant::now();
        let windows = self.windows.lock().await;
        let entry = windows.get(&user_id)?;

        [
            (entry.minute, MINUTE, self.per_minute),
            (entry.hour, HOUR, self.per_hour),
            (entry.day, DAY, self.per_day),
        ]
        .into_iter()
        .filter(|(w, length, limit)| now.duration_since(w.started) <= *length && w.count >= *limit)
        .map(|(w, length, _)| w.reset_in(now, length))
        .next()
    }

    /// Clears every window for a user (administrative reset).
    pub async fn reset(&self, user_id: i64) {
        self.windows.lock().await.remove(&user_id);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a reset delay the way users see it ("2 hours", "5 minutes", "30 seconds").
pub fn format_reset_delay(delay: Duration) -> String {
    let secs = delay.as_secs();
    if secs > 3600 {
        format!("{} hours", secs / 3600)
    } else if secs > 60 {
        format!("{} minutes", secs / 60)
    } else {
        format!("{} seconds", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_minute_window_limits_and_resets() {
        let limiter = RateLimiter::with_limits(2, 50, 200);

        assert!(limiter.check(1).await.is_ok());
        assert!(limiter.check(1).await.is_ok());
        let reset = limiter.check(1).await.unwrap_err();
        assert_eq!(reset, Duration::from_secs(60));
        assert_eq!(limiter.remaining_time(1).await, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check(1).await.is_ok());
        assert_eq!(limiter.remaining_time(1).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_requests_are_not_counted() {
        let limiter = RateLimiter::with_limits(1, 2, 200);

        assert!(limiter.check(7).await.is_ok());
        // Denied by the minute window; the hour window must stay at 1.
        assert!(limiter.check(7).await.is_err());
        assert!(limiter.check(7).await.is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check(7).await.is_ok());
        // Hour window now exhausted with exactly two counted requests.
        tokio::time::advance(Duration::from_secs(61)).await;
        let reset = limiter.check(7).await.unwrap_err();
        assert!(reset > MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_are_independent() {
        let limiter = RateLimiter::with_limits(1, 50, 200);
        assert!(limiter.check(1).await.is_ok());
        assert!(limiter.check(1).await.is_err());
        assert!(limiter.check(2).await.is_ok());

        limiter.reset(1).await;
        assert!(limiter.check(1).await.is_ok());
    }

    #[test]
    fn test_format_reset_delay() {
        assert_eq!(format_reset_delay(Duration::from_secs(7300)), "2 hours");
        assert_eq!(format_reset_delay(Duration::from_secs(300)), "5 minutes");
        assert_eq!(format_reset_delay(Duration::from_secs(30)), "30 seconds");
    }
}

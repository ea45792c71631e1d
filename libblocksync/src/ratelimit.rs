use crate::types::RateLimitConfig;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota,
};
use reqwest::header::HeaderMap;
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, warn};

type Pacer = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";
const RETRY_AFTER_HEADER: &str = "retry-after";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: Option<Instant>,
}

/// Rate-limit information reported by a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// From `Retry-After` when present, otherwise `X-RateLimit-Reset`.
    pub reset_after: Option<Duration>,
}

/// `None` when the response says nothing about the remaining budget or when
/// it resets.
pub fn parse_rate_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<RateHeaders> {
    let text = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    let remaining = text(REMAINING_HEADER).and_then(|v| v.parse().ok());
    let limit = text(LIMIT_HEADER).and_then(|v| v.parse().ok());
    let reset_after = text(RETRY_AFTER_HEADER)
        .and_then(|v| parse_retry_after(v, now))
        .or_else(|| text(RESET_HEADER).and_then(parse_reset).map(|reset| until(reset, now)));

    if remaining.is_none() && reset_after.is_none() {
        return None;
    }
    Some(RateHeaders {
        limit,
        remaining,
        reset_after,
    })
}

/// `Retry-After` is either delta-seconds or an HTTP-date.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| until(date.with_timezone(&Utc), now))
}

fn until(reset: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (reset - now).to_std().unwrap_or(Duration::ZERO)
}

fn parse_reset(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Tracks the admin API's request budget and pauses before a request would
/// overrun it.
pub struct RateLimiter {
    budget: Mutex<RateBudget>,
    config: RateLimitConfig,
    pacer: Option<Pacer>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let pacer = config
            .requests_per_second
            .map(|rate| Pacer::direct(Quota::per_second(rate)));
        Self {
            budget: Mutex::new(RateBudget {
                remaining: config.default_limit,
                limit: config.default_limit,
                reset_at: None,
            }),
            config,
            pacer,
        }
    }

    pub fn budget(&self) -> RateBudget {
        *self.lock()
    }

    pub async fn before_request(&self) {
        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }

        let deadline = {
            let mut budget = self.lock();
            if budget.remaining > 0 {
                return;
            }
            match budget.reset_at {
                Some(reset_at) if Instant::now() < reset_at => reset_at,
                _ => {
                    refill(&mut budget);
                    return;
                }
            }
        };

        warn!(
            wait_secs = deadline.saturating_duration_since(Instant::now()).as_secs(),
            "Rate limit budget exhausted, waiting for reset"
        );
        tokio::time::sleep_until(deadline).await;
        refill(&mut self.lock());
    }

    /// Updates the budget from a response. Returns what the headers reported,
    /// if anything.
    pub fn after_response(&self, headers: &HeaderMap) -> Option<RateHeaders> {
        let reported = parse_rate_headers(headers, Utc::now());
        self.apply(reported);
        reported
    }

    /// Treats the budget as spent, e.g. after a 429. A reset time already
    /// reported by the response is kept.
    pub fn mark_exhausted(&self) {
        let mut budget = self.lock();
        budget.remaining = 0;
        if budget.reset_at.is_none() {
            budget.reset_at = Some(Instant::now() + self.config.fallback_window);
        }
    }

    pub fn apply(&self, reported: Option<RateHeaders>) {
        let now = Instant::now();
        let mut budget = self.lock();

        match reported {
            Some(headers) => {
                if let Some(limit) = headers.limit {
                    budget.limit = limit;
                }
                budget.remaining = match headers.remaining {
                    Some(remaining) => remaining,
                    None => budget.remaining.saturating_sub(1),
                };
                budget.reset_at = headers.reset_after.map(|after| now + after);
            }
            None => {
                budget.remaining = budget.remaining.saturating_sub(1);
            }
        }

        if budget.remaining == 0 && budget.reset_at.is_none() {
            budget.reset_at = Some(now + self.config.fallback_window);
        }
        debug!(remaining = budget.remaining, limit = budget.limit, "Rate budget updated");
    }

    fn lock(&self) -> MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn refill(budget: &mut RateBudget) {
    budget.remaining = budget.limit;
    budget.reset_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn limiter(limit: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            default_limit: limit,
            fallback_window: Duration::from_secs(60),
            requests_per_second: None,
        })
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn parses_mastodon_headers() {
        let now = DateTime::parse_from_rfc3339("2026-10-17T12:00:00Z").unwrap().with_timezone(&Utc);
        let parsed = parse_rate_headers(
            &headers(&[
                ("X-RateLimit-Limit", "300"),
                ("X-RateLimit-Remaining", "12"),
                ("X-RateLimit-Reset", "2026-10-17T12:00:30.000Z"),
            ]),
            now,
        )
        .unwrap();
        assert_eq!(parsed.limit, Some(300));
        assert_eq!(parsed.remaining, Some(12));
        assert_eq!(parsed.reset_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn parses_epoch_reset_and_clamps_past_resets() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let parsed = parse_rate_headers(
            &headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1010")]),
            now,
        )
        .unwrap();
        assert_eq!(parsed.reset_after, Some(Duration::from_secs(10)));

        let parsed = parse_rate_headers(
            &headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "900")]),
            now,
        )
        .unwrap();
        assert_eq!(parsed.reset_after, Some(Duration::ZERO));
    }

    #[test]
    fn limit_alone_means_no_information() {
        let now = Utc::now();
        assert!(parse_rate_headers(&headers(&[("x-ratelimit-limit", "300")]), now).is_none());
        assert!(parse_rate_headers(&headers(&[("x-ratelimit-remaining", "lots")]), now).is_none());
    }

    #[test]
    fn reset_is_read_without_remaining() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let parsed = parse_rate_headers(&headers(&[("X-RateLimit-Reset", "1005")]), now).unwrap();
        assert_eq!(parsed.remaining, None);
        assert_eq!(parsed.reset_after, Some(Duration::from_secs(5)));
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = DateTime::parse_from_rfc3339("2015-10-21T07:27:00Z").unwrap().with_timezone(&Utc);

        let parsed = parse_rate_headers(&headers(&[("Retry-After", "120")]), now).unwrap();
        assert_eq!(parsed.reset_after, Some(Duration::from_secs(120)));

        let parsed =
            parse_rate_headers(&headers(&[("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT")]), now)
                .unwrap();
        assert_eq!(parsed.reset_after, Some(Duration::from_secs(60)));

        assert!(parse_rate_headers(&headers(&[("Retry-After", "soon")]), now).is_none());
    }

    #[test]
    fn retry_after_wins_over_ratelimit_reset() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        let parsed = parse_rate_headers(
            &headers(&[("Retry-After", "3"), ("X-RateLimit-Reset", "1300")]),
            now,
        )
        .unwrap();
        assert_eq!(parsed.reset_after, Some(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_keeps_the_reported_reset() {
        let limiter = limiter(5);
        limiter.apply(Some(RateHeaders {
            limit: None,
            remaining: None,
            reset_after: Some(Duration::from_secs(7)),
        }));
        assert_eq!(limiter.budget().remaining, 4);

        limiter.mark_exhausted();
        let start = Instant::now();
        limiter.before_request().await;
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(limiter.budget().remaining, 5);
    }

    #[test]
    fn absent_headers_decrement_optimistically() {
        let limiter = limiter(3);
        limiter.after_response(&HeaderMap::new());
        limiter.after_response(&HeaderMap::new());
        assert_eq!(limiter.budget().remaining, 1);
        assert!(limiter.budget().reset_at.is_none());

        limiter.after_response(&HeaderMap::new());
        assert_eq!(limiter.budget().remaining, 0);
        assert!(limiter.budget().reset_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_sleep_with_budget_left() {
        let limiter = limiter(5);
        limiter.apply(Some(RateHeaders {
            limit: None,
            remaining: Some(1),
            reset_after: Some(Duration::from_secs(120)),
        }));
        let start = Instant::now();
        limiter.before_request().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_until_reset_when_exhausted() {
        let limiter = limiter(5);
        limiter.apply(Some(RateHeaders {
            limit: Some(300),
            remaining: Some(0),
            reset_after: Some(Duration::from_secs(42)),
        }));
        let start = Instant::now();
        limiter.before_request().await;
        assert!(start.elapsed() >= Duration::from_secs(42));
        assert_eq!(limiter.budget().remaining, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_window_refills_without_headers() {
        let limiter = limiter(1);
        limiter.after_response(&HeaderMap::new());
        let start = Instant::now();
        limiter.before_request().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(limiter.budget().remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_reset_refills_immediately() {
        let limiter = limiter(10);
        limiter.apply(Some(RateHeaders {
            limit: None,
            remaining: Some(0),
            reset_after: Some(Duration::from_secs(5)),
        }));
        tokio::time::advance(Duration::from_secs(6)).await;
        let start = Instant::now();
        limiter.before_request().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.budget().remaining, 10);
    }
}

//! Fixed-window request limiter keyed by client IP.
//!
//! State is process-local: every replica counts on its own, so the effective limit across a
//! deployment is `max_requests` times the number of replicas.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use rand::Rng;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::api::RateLimitedResponse;
use crate::ip::extract_client_ip;
use crate::time::{format_rfc3339, TimeSource};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

const RATE_LIMITED_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
}

pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    window: Duration,
    max_requests: u32,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl RateLimiter {
    pub fn new(
        window: Duration,
        max_requests: u32,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        RateLimiter {
            entries: DashMap::new(),
            window,
            max_requests,
            timesource,
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn check(&self, client_ip: &str) -> RateLimitDecision {
        let now = self.timesource.now();

        // the entry guard holds the shard lock for the whole read-modify-write
        match self.entries.entry(client_ip.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().reset_at >= now => {
                let entry = occupied.get_mut();
                if entry.count >= self.max_requests {
                    return RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_at: entry.reset_at,
                    };
                }
                entry.count += 1;
                RateLimitDecision {
                    allowed: true,
                    remaining: self.max_requests - entry.count,
                    reset_at: entry.reset_at,
                }
            }
            entry => {
                let fresh = RateLimitEntry {
                    count: 1,
                    reset_at: now + self.window,
                };
                entry.insert(fresh);
                RateLimitDecision {
                    allowed: true,
                    remaining: self.max_requests.saturating_sub(1),
                    reset_at: fresh.reset_at,
                }
            }
        }
    }

    /// Drop entries whose window has elapsed.
    pub fn clean_state(&self) -> usize {
        let now = self.timesource.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_at >= now);
        self.entries.shrink_to_fit();

        let tracked = self.entries.len();
        gauge!("capture_rate_limit_key_count").set(tracked as f64);
        before.saturating_sub(tracked)
    }

    /// Runs `clean_state` every five minutes, needs to be spawned in a separate task.
    pub async fn run_cleanup(self: Arc<Self>) {
        // jitter so replicas do not all sweep at the same time
        let interval_secs = rand::thread_rng().gen_range(300..320);

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let removed = self.clean_state();
            debug!(removed, "cleaned rate limiter state");
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let client_ip = extract_client_ip(req.headers(), remote.as_deref());

    let decision = limiter.check(&client_ip);

    let mut response = if decision.allowed {
        next.run(req).await
    } else {
        counter!("capture_rate_limited_total").increment(1);
        debug!(client_ip = %client_ip, "rate limit exceeded");

        let wait = decision.reset_at - limiter.timesource.now();
        let retry_after = (wait.as_seconds_f64().ceil() as i64).max(0);

        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitedResponse {
                error: "Too Many Requests".to_string(),
                message: RATE_LIMITED_MESSAGE.to_string(),
                retry_after,
            }),
        )
            .into_response()
    };

    let headers = response.headers_mut();
    insert_header(headers, LIMIT_HEADER, limiter.max_requests().to_string());
    insert_header(headers, REMAINING_HEADER, decision.remaining.to_string());
    insert_header(headers, RESET_HEADER, format_rfc3339(decision.reset_at));

    response
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use time::macros::datetime;

    use super::*;

    struct Clock(Mutex<OffsetDateTime>);

    impl Clock {
        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl TimeSource for Clock {
        fn now(&self) -> OffsetDateTime {
            *self.0.lock().unwrap()
        }
    }

    fn limiter(max: u32) -> (RateLimiter, Arc<Clock>) {
        let clock = Arc::new(Clock(Mutex::new(datetime!(2024-05-01 12:00 UTC))));
        (
            RateLimiter::new(Duration::seconds(60), max, clock.clone()),
            clock,
        )
    }

    #[test]
    fn counts_down_then_rejects() {
        let (limiter, _) = limiter(5);

        let remaining: Vec<u32> = (0..5).map(|_| limiter.check("1.2.3.4").remaining).collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let rejected = limiter.check("1.2.3.4");
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.reset_at, datetime!(2024-05-01 12:01 UTC));
    }

    #[test]
    fn keys_are_independent() {
        let (limiter, _) = limiter(1);

        assert!(limiter.check("1.1.1.1").allowed);
        assert!(!limiter.check("1.1.1.1").allowed);
        assert!(limiter.check("2.2.2.2").allowed);
    }

    #[test]
    fn window_resets_after_expiry() {
        let (limiter, clock) = limiter(2);

        assert!(limiter.check("1.2.3.4").allowed);
        assert!(limiter.check("1.2.3.4").allowed);
        assert!(!limiter.check("1.2.3.4").allowed);

        clock.advance(Duration::seconds(61));

        let decision = limiter.check("1.2.3.4");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at, datetime!(2024-05-01 12:02:01 UTC));
    }

    #[test]
    fn cleanup_removes_expired_entries() {
        let (limiter, clock) = limiter(2);

        limiter.check("1.1.1.1");
        clock.advance(Duration::seconds(30));
        limiter.check("2.2.2.2");
        clock.advance(Duration::seconds(31));

        assert_eq!(limiter.clean_state(), 1);
        assert_eq!(limiter.entries.len(), 1);
        assert!(limiter.entries.contains_key("2.2.2.2"));
    }

    #[test]
    fn concurrent_checks_never_exceed_max() {
        let (limiter, _) = limiter(50);
        let threads = 8;
        let per_thread = 50;

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        (0..per_thread)
                            .filter(|_| limiter.check("1.2.3.4").allowed)
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(allowed, 50);
        assert_eq!(limiter.entries.get("1.2.3.4").unwrap().count, 50);
    }
}

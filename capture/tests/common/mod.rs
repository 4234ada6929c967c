#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::header::SET_COOKIE;
use axum::http::{Request, Response};
use axum::Router;
use serde_json::Value;
use time::macros::datetime;
use time::OffsetDateTime;
use tower::ServiceExt;

use measure_capture::consent::CookieSettings;
use measure_capture::enrichment::{Enricher, Geolocation};
use measure_capture::event::ProcessedEvent;
use measure_capture::identity::{DailySaltHasher, IdentityHasher};
use measure_capture::limiters::RateLimiter;
use measure_capture::pipeline::Pipeline;
use measure_capture::processor::EventProcessor;
use measure_capture::router::router;
use measure_capture::sinks::{EventSink, SinkError};
use measure_capture::stores::memory::MemoryStore;
use measure_capture::time::TimeSource;

pub const CLIENT_IP: &str = "203.0.113.7";
pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0";

#[derive(Clone)]
pub struct FixedTime {
    pub time: OffsetDateTime,
}

impl Default for FixedTime {
    fn default() -> Self {
        FixedTime {
            time: datetime!(2024-05-01 12:00 UTC),
        }
    }
}

impl TimeSource for FixedTime {
    fn now(&self) -> OffsetDateTime {
        self.time
    }
}

#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ProcessedEvent>>>,
}

impl MemorySink {
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<ProcessedEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Storage runs after the response, poll until `count` events arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<ProcessedEvent> {
        for _ in 0..100 {
            if self.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.events()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn store(&self, event: ProcessedEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub fn cookie_settings() -> CookieSettings {
    CookieSettings {
        client_id_name: "_ms_cid".to_string(),
        hash_name: "_ms_h".to_string(),
        consent_name: "measure_consent".to_string(),
        domain: "x.test".to_string(),
    }
}

pub struct TestApp {
    pub app: Router,
    pub sink: MemorySink,
    pub salts: Arc<MemoryStore>,
}

pub struct TestAppBuilder {
    max_requests: u32,
    hasher: Option<Arc<dyn IdentityHasher + Send + Sync>>,
}

impl TestAppBuilder {
    pub fn new() -> Self {
        TestAppBuilder {
            max_requests: 100,
            hasher: None,
        }
    }

    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn IdentityHasher + Send + Sync>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Needs a tokio runtime, the pipeline dispatcher is spawned here.
    pub fn build(self) -> TestApp {
        let timesource = Arc::new(FixedTime::default());
        let sink = MemorySink::default();
        let salts = Arc::new(MemoryStore::new());

        let hasher: Arc<dyn IdentityHasher + Send + Sync> = match self.hasher {
            Some(hasher) => hasher,
            None => Arc::new(DailySaltHasher::new(salts.clone(), timesource.clone())),
        };

        let (pipeline, _failures, _handle) = Pipeline::start(
            Enricher::new(Geolocation::Disabled),
            Arc::new(sink.clone()),
            64,
            4,
        );
        let processor =
            EventProcessor::new(hasher, cookie_settings(), pipeline, timesource.clone());
        let limiter = Arc::new(RateLimiter::new(
            time::Duration::seconds(60),
            self.max_requests,
            timesource,
        ));

        let app = router(
            FixedTime::default(),
            processor,
            limiter,
            "measure-js",
            &["https://x.test".to_string()],
            None,
        );

        TestApp { app, sink, salts }
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }
}

pub fn json_request(body: &Value, cookies: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .header("x-forwarded-for", CLIENT_IP)
        .header("user-agent", USER_AGENT);
    if let Some(cookies) = cookies {
        builder = builder.header("cookie", cookies);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

/// Turn Set-Cookie headers into the Cookie header a browser would send back.
pub fn cookie_header(set_cookies: &[String]) -> String {
    set_cookies
        .iter()
        .filter_map(|c| c.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

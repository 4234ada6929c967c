use std::future::ready;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::endpoint;
use crate::limiters::{rate_limit, RateLimiter};
use crate::processor::EventProcessor;
use crate::prometheus::track_metrics;
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub processor: Arc<EventProcessor>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub service_name: Arc<str>,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    processor: EventProcessor,
    limiter: Arc<RateLimiter>,
    service_name: &str,
    cors_origins: &[String],
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = State {
        processor: Arc::new(processor),
        timesource: Arc::new(timesource),
        service_name: Arc::from(service_name),
    };

    // Only the event routes are rate limited
    let events = Router::new()
        .route("/events", get(endpoint::event).post(endpoint::event))
        .route("/events/", get(endpoint::event).post(endpoint::event))
        .route_layer(from_fn_with_state(limiter, rate_limit));

    let router = Router::new()
        .route("/", get(endpoint::index))
        .route("/health", get(endpoint::health))
        .merge(events)
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(track_metrics))
        .with_state(state);

    // Installing a global recorder when capture is used as a library (during tests etc)
    // does not work well, so the handle is created by the caller.
    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}

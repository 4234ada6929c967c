use std::net::SocketAddr;

use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::header::{CONTENT_TYPE, SET_COOKIE, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::{instrument, warn, Span};

use crate::api::{CaptureError, HealthResponse, OK_MESSAGE};
use crate::consent::ClientCookies;
use crate::event::RawEvent;
use crate::ip::extract_client_ip;
use crate::processor::RequestContext;
use crate::router;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

pub async fn index() -> &'static str {
    "{Nothing to see here}"
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .and_then(|q| serde_urlencoded::from_str(q).ok())
        .unwrap_or_default()
}

fn parse_form(headers: &HeaderMap, body: &[u8]) -> Vec<(String, String)> {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(FORM_CONTENT_TYPE));
    if !is_form {
        return vec![];
    }
    serde_urlencoded::from_bytes(body).unwrap_or_default()
}

// Anything that is not a JSON object counts as an empty body.
fn parse_json(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

#[instrument(skip_all, fields(user_agent, content_type, client_ip))]
pub async fn event(
    state: State<router::State>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Response, CaptureError> {
    let user_agent = headers.get(USER_AGENT).and_then(|v| v.to_str().ok());
    let content_type = headers
        .get(CONTENT_TYPE)
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));

    let remote = connect_info.map(|ConnectInfo(addr)| addr.ip().to_string());
    let client_ip = extract_client_ip(&headers, remote.as_deref());

    Span::current().record("user_agent", user_agent.unwrap_or("unknown"));
    Span::current().record("content_type", content_type);
    Span::current().record("client_ip", client_ip.as_str());

    let raw = RawEvent::merge(
        parse_query(query.as_deref()),
        parse_form(&headers, &body),
        parse_json(&body),
    );

    let settings = state.processor.cookie_settings();
    let cookies = ClientCookies::from_headers(&headers, settings);

    let outcome = state
        .processor
        .process(
            raw,
            RequestContext {
                cookies: &cookies,
                client_ip,
                user_agent,
            },
        )
        .await
        .inspect_err(|err| warn!("rejected event: {}", err))?;

    let mut response = Json(outcome.response).into_response();
    for mutation in &outcome.cookies {
        match HeaderValue::from_str(&settings.set_cookie_header(mutation)) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(err) => warn!(cookie = mutation.name(), "skipping invalid cookie: {}", err),
        }
    }

    Ok(response)
}

pub async fn health(state: State<router::State>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: OK_MESSAGE.to_string(),
        timestamp: state.timesource.current_time(),
        service: state.service_name.to_string(),
    })
}

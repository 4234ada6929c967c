//! Streaming inserts into a BigQuery table through the `tabledata.insertAll` REST call.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::header::HeaderValue;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::config::WarehouseConfig;
use crate::event::ProcessedEvent;
use crate::sinks::{EventSink, SinkError};

const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
// refresh metadata tokens this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct InsertRow<'a> {
    json: &'a ProcessedEvent,
}

#[derive(Serialize)]
struct InsertAllRequest<'a> {
    rows: Vec<InsertRow<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<Value>,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

enum TokenSource {
    Static(String),
    Metadata {
        url: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

pub struct BigQuerySink {
    client: Client,
    insert_url: String,
    tokens: TokenSource,
}

impl BigQuerySink {
    pub fn new(config: &WarehouseConfig) -> Result<BigQuerySink, SinkError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.bigquery_timeout_ms))
            .build()
            .map_err(|e| SinkError::ClientBuild(e.to_string()))?;

        let insert_url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            config.bigquery_endpoint.trim_end_matches('/'),
            config.gcp_project_id,
            config.gcp_dataset_id,
            config.gcp_table_id,
        );

        let tokens = match &config.bigquery_access_token {
            Some(token) if !token.is_empty() => TokenSource::Static(token.clone()),
            _ => TokenSource::Metadata {
                url: format!(
                    "{}{}",
                    config.gce_metadata_host.trim_end_matches('/'),
                    METADATA_TOKEN_PATH
                ),
                cached: Mutex::new(None),
            },
        };

        Ok(BigQuerySink {
            client,
            insert_url,
            tokens,
        })
    }

    async fn access_token(&self) -> Result<String, SinkError> {
        let (url, cached) = match &self.tokens {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata { url, cached } => (url, cached),
        };

        let mut cached = cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        debug!("fetching access token from metadata server");
        let response = self
            .client
            .get(url)
            .header("Metadata-Flavor", HeaderValue::from_static("Google"))
            .send()
            .await
            .map_err(|e| SinkError::Auth(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SinkError::Auth(format!(
                "metadata server answered with status {}",
                response.status()
            )));
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| SinkError::Auth(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }
}

#[async_trait]
impl EventSink for BigQuerySink {
    #[instrument(skip_all)]
    async fn store(&self, event: ProcessedEvent) -> Result<(), SinkError> {
        let token = self.access_token().await?;
        let start = Instant::now();

        let body = InsertAllRequest {
            rows: vec![InsertRow { json: &event }],
        };

        let response = self
            .client
            .post(&self.insert_url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::Request(e.to_string()))?;

        histogram!("capture_warehouse_insert_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SinkError::Request(format!("status {status}: {detail}")));
        }

        let result: InsertAllResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Request(e.to_string()))?;

        if !result.insert_errors.is_empty() {
            return Err(SinkError::RowErrors(
                Value::Array(result.insert_errors).to_string(),
            ));
        }

        counter!("capture_events_ingested_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::event::{Device, Location};

    const INSERT_PATH: &str = "/bigquery/v2/projects/proj/datasets/analytics/tables/events/insertAll";

    fn config(endpoint: &str, token: Option<&str>) -> WarehouseConfig {
        WarehouseConfig {
            gcp_project_id: "proj".to_string(),
            gcp_dataset_id: "analytics".to_string(),
            gcp_table_id: "events".to_string(),
            bigquery_endpoint: endpoint.to_string(),
            bigquery_access_token: token.map(str::to_string),
            bigquery_timeout_ms: 1000,
            gce_metadata_host: endpoint.to_string(),
        }
    }

    fn event() -> ProcessedEvent {
        ProcessedEvent {
            timestamp: "2024-05-01T12:00:00Z".to_string(),
            event_type: "event".to_string(),
            event_name: "pageview".to_string(),
            parameters: "{}".to_string(),
            user_agent: "curl/8.0".to_string(),
            url: "https://x.test/a".to_string(),
            referrer: String::new(),
            client_id: None,
            hash: None,
            user_id: None,
            consent_given: false,
            device: Device::default(),
            location: Location::new("141.20.2.0".to_string(), None),
        }
    }

    #[tokio::test]
    async fn inserts_one_row() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path(INSERT_PATH)
                .header("authorization", "Bearer static-token")
                .json_body_partial(
                    r#"{"rows":[{"json":{"event_name":"pageview","consent_given":false,"location":{"ip_trunc":"141.20.2.0"}}}]}"#,
                );
            then.status(200)
                .json_body(json!({"kind": "bigquery#tableDataInsertAllResponse"}));
        });

        let sink = BigQuerySink::new(&config(&server.base_url(), Some("static-token"))).unwrap();
        sink.store(event()).await.unwrap();

        mock.assert();
    }

    #[tokio::test]
    async fn reports_row_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(INSERT_PATH);
            then.status(200).json_body(json!({
                "insertErrors": [{"index": 0, "errors": [{"reason": "invalid"}]}]
            }));
        });

        let sink = BigQuerySink::new(&config(&server.base_url(), Some("t"))).unwrap();
        let result = sink.store(event()).await;

        assert!(matches!(result, Err(SinkError::RowErrors(ref e)) if e.contains("invalid")));
    }

    #[tokio::test]
    async fn reports_failed_requests() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(INSERT_PATH);
            then.status(403).body("denied");
        });

        let sink = BigQuerySink::new(&config(&server.base_url(), Some("t"))).unwrap();

        assert!(matches!(
            sink.store(event()).await,
            Err(SinkError::Request(_))
        ));
    }

    #[tokio::test]
    async fn caches_metadata_token() {
        let server = MockServer::start();
        let token_mock = server.mock(|when, then| {
            when.method(GET)
                .path(METADATA_TOKEN_PATH)
                .header("metadata-flavor", "Google");
            then.status(200).json_body(json!({
                "access_token": "from-metadata",
                "expires_in": 3599,
                "token_type": "Bearer",
            }));
        });
        let insert_mock = server.mock(|when, then| {
            when.method(POST)
                .path(INSERT_PATH)
                .header("authorization", "Bearer from-metadata");
            then.status(200).json_body(json!({}));
        });

        let sink = BigQuerySink::new(&config(&server.base_url(), None)).unwrap();
        sink.store(event()).await.unwrap();
        sink.store(event()).await.unwrap();

        token_mock.assert_hits(1);
        insert_mock.assert_hits(2);
    }

    #[tokio::test]
    async fn metadata_failure_is_an_auth_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(METADATA_TOKEN_PATH);
            then.status(404);
        });

        let sink = BigQuerySink::new(&config(&server.base_url(), None)).unwrap();

        assert!(matches!(sink.store(event()).await, Err(SinkError::Auth(_))));
    }
}

//! Client for the GeoIP2 precision web service (city endpoint).

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::event::GeoLocation;

#[derive(Error, Debug)]
pub enum GeoIpError {
    #[error("failed to build geoip client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("geoip request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("geoip service answered with status {0}")]
    Status(StatusCode),
}

const CONTINENT_PATH: &[&str] = &["continent", "names", "en"];
const COUNTRY_PATH: &[&str] = &["country", "names", "en"];
const COUNTRY_CODE_PATH: &[&str] = &["country", "iso_code"];
const CITY_PATH: &[&str] = &["city", "names", "en"];

#[derive(Clone)]
pub struct GeoIpClient {
    client: Client,
    host: String,
    account: String,
    key: String,
}

impl GeoIpClient {
    pub fn new(
        host: &str,
        account: String,
        key: String,
        timeout: Duration,
    ) -> Result<Self, GeoIpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(GeoIpError::ClientBuild)?;

        Ok(GeoIpClient {
            client,
            host: host.trim_end_matches('/').to_string(),
            account,
            key,
        })
    }

    #[instrument(skip(self))]
    pub async fn city(&self, ip: &str) -> Result<GeoLocation, GeoIpError> {
        let url = format!("{}/geoip/v2.1/city/{}", self.host, ip);

        let response = self
            .client
            .get(url)
            .basic_auth(&self.account, Some(&self.key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            debug!(%status, "geoip lookup rejected");
            return Err(GeoIpError::Status(status));
        }

        let body: Value = response.json().await?;
        Ok(extract_location(&body))
    }
}

fn get_nested_value<'a>(data: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = data;
    for &key in path {
        current = current.get(key)?;
    }
    current.as_str()
}

pub fn extract_location(city: &Value) -> GeoLocation {
    let field = |path: &[&str]| {
        get_nested_value(city, path)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    GeoLocation {
        continent: field(CONTINENT_PATH),
        country: field(COUNTRY_PATH),
        country_code: field(COUNTRY_CODE_PATH),
        city: field(CITY_PATH),
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn extracts_english_names() {
        let body = json!({
            "continent": {"code": "EU", "names": {"en": "Europe", "de": "Europa"}},
            "country": {"iso_code": "DE", "names": {"en": "Germany"}},
            "city": {"names": {"en": "Berlin"}},
        });

        assert_eq!(
            extract_location(&body),
            GeoLocation {
                continent: Some("Europe".to_string()),
                country: Some("Germany".to_string()),
                country_code: Some("DE".to_string()),
                city: Some("Berlin".to_string()),
            }
        );
    }

    #[test]
    fn missing_fields_are_null() {
        let body = json!({"country": {"iso_code": "DE"}, "city": {"names": {}}});

        assert_eq!(
            extract_location(&body),
            GeoLocation {
                country_code: Some("DE".to_string()),
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn queries_city_endpoint_with_basic_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/geoip/v2.1/city/141.20.2.0")
                // base64("42:secret")
                .header("authorization", "Basic NDI6c2VjcmV0");
            then.status(200).json_body(json!({
                "continent": {"names": {"en": "Europe"}},
                "country": {"iso_code": "DE", "names": {"en": "Germany"}},
                "city": {"names": {"en": "Berlin"}},
            }));
        });

        let client = GeoIpClient::new(
            &server.base_url(),
            "42".to_string(),
            "secret".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();

        let location = client.city("141.20.2.0").await.unwrap();
        mock.assert();
        assert_eq!(location.city.as_deref(), Some("Berlin"));
        assert_eq!(location.country_code.as_deref(), Some("DE"));
    }

    #[tokio::test]
    async fn reports_error_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/geoip/v2.1/city/10.0.0.0");
            then.status(404)
                .json_body(json!({"code": "IP_ADDRESS_RESERVED"}));
        });

        let client = GeoIpClient::new(
            &server.base_url(),
            "42".to_string(),
            "secret".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(matches!(
            client.city("10.0.0.0").await,
            Err(GeoIpError::Status(StatusCode::NOT_FOUND))
        ));
    }
}

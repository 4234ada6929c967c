use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// Salt rotates every UTC day, shared through the salt store
    Rotating,
    /// Fixed salt from `DAILY_SALT`
    Static,
}

impl std::str::FromStr for HashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "rotating" => Ok(HashMode::Rotating),
            "static" => Ok(HashMode::Static),
            _ => Err(format!("Unknown hash mode: {s}")),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    #[envconfig(default = "measure-js")]
    pub service_name: String,

    pub redis_url: Option<String>,
    #[envconfig(default = "1000")]
    pub redis_response_timeout_ms: u64,

    #[envconfig(default = "rotating")]
    pub hash_mode: HashMode,
    #[envconfig(default = "123456789")]
    pub daily_salt: String,

    #[envconfig(default = "_ms_cid")]
    pub client_id_cookie_name: String,
    #[envconfig(default = "_ms_h")]
    pub hash_cookie_name: String,
    #[envconfig(default = "measure_consent")]
    pub consent_cookie_name: String,
    #[envconfig(default = "")]
    pub cookie_domain: String,

    // Comma-delimited origins
    #[envconfig(default = "")]
    pub cors_origin: String,

    #[envconfig(nested = true)]
    pub warehouse: WarehouseConfig,

    #[envconfig(nested = true)]
    pub geoip: GeoIpConfig,

    #[envconfig(nested = true)]
    pub rate_limit: RateLimitConfig,

    #[envconfig(default = "1024")]
    pub pipeline_queue_capacity: usize,
    #[envconfig(default = "16")]
    pub pipeline_concurrency: usize,
    #[envconfig(default = "10000")]
    pub pipeline_drain_timeout_ms: u64,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "measure-capture")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

impl Config {
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origin
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Envconfig, Clone)]
pub struct WarehouseConfig {
    #[envconfig(default = "")]
    pub gcp_project_id: String,
    #[envconfig(default = "")]
    pub gcp_dataset_id: String,
    #[envconfig(default = "")]
    pub gcp_table_id: String,

    #[envconfig(default = "https://bigquery.googleapis.com")]
    pub bigquery_endpoint: String,
    // Without a token, one is requested from the GCE metadata server
    pub bigquery_access_token: Option<String>,
    #[envconfig(default = "10000")]
    pub bigquery_timeout_ms: u64,

    #[envconfig(default = "http://metadata.google.internal")]
    pub gce_metadata_host: String,
}

impl WarehouseConfig {
    pub fn is_complete(&self) -> bool {
        !self.gcp_project_id.is_empty()
            && !self.gcp_dataset_id.is_empty()
            && !self.gcp_table_id.is_empty()
    }
}

#[derive(Envconfig, Clone)]
pub struct GeoIpConfig {
    pub geo_account: Option<String>,
    pub geo_key: Option<String>,

    #[envconfig(default = "https://geolite.info")]
    pub geo_host: String,
    #[envconfig(default = "2000")]
    pub geo_timeout_ms: u64,
}

impl GeoIpConfig {
    /// Account and key, when both are set.
    pub fn credentials(&self) -> Option<(String, String)> {
        let account = self.geo_account.as_deref().filter(|a| !a.is_empty())?;
        let key = self.geo_key.as_deref().filter(|k| !k.is_empty())?;
        Some((account.to_string(), key.to_string()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.geo_timeout_ms)
    }
}

#[derive(Envconfig, Clone)]
pub struct RateLimitConfig {
    #[envconfig(default = "60000")]
    pub rate_limit_window_ms: u64,
    #[envconfig(default = "100")]
    pub rate_limit_max_requests: u32,
}

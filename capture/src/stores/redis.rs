use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::event::GeoLocation;
use crate::stores::{LocationCache, SaltRecord, SaltStore, StoreError};

const SALT_KEY_PREFIX: &str = "measure/salt/";
const SALT_INDEX_KEY: &str = "measure/salt_days";
const GEOIP_KEY_PREFIX: &str = "measure/geoip/";

// Salts outlive their day by one day so yesterday's hashes stay reproducible until cleanup.
const SALT_TTL_SECONDS: u64 = 60 * 60 * 24 * 2;
const LOCATION_TTL_SECONDS: u64 = 60 * 60 * 24 * 30;

const REDIS_ERRORS_TOTAL: &str = "capture_redis_errors_total";

/// Cached lookup as persisted, with the time it was resolved.
#[derive(Serialize, Deserialize)]
struct CachedLocation {
    ip_mask: String,
    #[serde(flatten)]
    location: GeoLocation,
    updated_at: String,
}

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn new(
        addr: String,
        response_timeout: Option<Duration>,
    ) -> Result<RedisStore, StoreError> {
        let client = redis::Client::open(addr)?;

        let mut config = redis::AsyncConnectionConfig::new();
        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisStore { connection })
    }

    fn report_error(operation: &'static str) {
        counter!(REDIS_ERRORS_TOTAL, "operation" => operation).increment(1);
    }
}

#[async_trait]
impl SaltStore for RedisStore {
    #[instrument(skip_all, fields(day = day))]
    async fn get_or_create_salt(
        &self,
        day: &str,
        candidate: String,
    ) -> Result<SaltRecord, StoreError> {
        let mut conn = self.connection.clone();
        let key = format!("{SALT_KEY_PREFIX}{day}");

        // SET NX is the get-or-create primitive: only the first writer of the day wins
        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&candidate)
            .arg("EX")
            .arg(SALT_TTL_SECONDS)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .inspect_err(|_| Self::report_error("set_salt"))?;

        if created.is_some() {
            let _: i64 = conn
                .sadd(SALT_INDEX_KEY, day)
                .await
                .inspect_err(|_| Self::report_error("index_salt"))?;

            return Ok(SaltRecord {
                salt: candidate,
                created: true,
            });
        }

        let existing: Option<String> = conn
            .get(&key)
            .await
            .inspect_err(|_| Self::report_error("get_salt"))?;

        match existing {
            Some(salt) => Ok(SaltRecord {
                salt,
                created: false,
            }),
            // expired between the two calls
            None => Err(StoreError::Unavailable(format!(
                "salt for {day} vanished during lookup"
            ))),
        }
    }

    #[instrument(skip_all, fields(day = day))]
    async fn delete_salts_before(&self, day: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();

        let days: Vec<String> = conn
            .smembers(SALT_INDEX_KEY)
            .await
            .inspect_err(|_| Self::report_error("list_salts"))?;

        // YYYY-MM-DD keys order lexicographically
        let stale: Vec<String> = days.into_iter().filter(|d| d.as_str() < day).collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = stale
            .iter()
            .map(|d| format!("{SALT_KEY_PREFIX}{d}"))
            .collect();

        let deleted: u64 = conn
            .del(&keys)
            .await
            .inspect_err(|_| Self::report_error("delete_salts"))?;
        let _: i64 = conn
            .srem(SALT_INDEX_KEY, &stale)
            .await
            .inspect_err(|_| Self::report_error("unindex_salts"))?;

        Ok(deleted)
    }
}

#[async_trait]
impl LocationCache for RedisStore {
    async fn get_location(&self, ip_trunc: &str) -> Result<Option<GeoLocation>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .get(format!("{GEOIP_KEY_PREFIX}{ip_trunc}"))
            .await
            .inspect_err(|_| Self::report_error("get_location"))?;

        match raw {
            None => Ok(None),
            Some(raw) => {
                let cached: CachedLocation = serde_json::from_str(&raw)?;
                Ok(Some(cached.location))
            }
        }
    }

    async fn put_location(
        &self,
        ip_trunc: &str,
        location: &GeoLocation,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let cached = CachedLocation {
            ip_mask: ip_trunc.to_string(),
            location: location.clone(),
            updated_at: crate::time::format_rfc3339(time::OffsetDateTime::now_utc()),
        };
        let payload = serde_json::to_string(&cached)?;

        let _: () = conn
            .set_ex(
                format!("{GEOIP_KEY_PREFIX}{ip_trunc}"),
                payload,
                LOCATION_TTL_SECONDS,
            )
            .await
            .inspect_err(|_| Self::report_error("put_location"))?;

        Ok(())
    }
}

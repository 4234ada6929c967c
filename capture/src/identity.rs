//! Privacy-preserving client identity hashes.
//!
//! The hash is `sha256(ip ++ user_agent ++ salt)` rendered as lowercase hex. With the
//! rotating hasher the salt changes every UTC day, so a hash only links activity within
//! a single day.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use moka::sync::Cache;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::Duration as TimeDuration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::stores::{SaltStore, StoreError};
use crate::time::{format_day, TimeSource};

const SALT_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 24);

const SALT_CACHE_HIT_COUNTER: &str = "capture_salt_cache_hit_total";
const SALT_CACHE_MISS_COUNTER: &str = "capture_salt_cache_miss_total";
const SALT_CREATED_COUNTER: &str = "capture_salt_created_total";

#[derive(Error, Debug, Clone)]
pub enum IdentityError {
    #[error("failed to resolve daily salt: {0}")]
    SaltUnavailable(#[from] StoreError),
}

#[async_trait]
pub trait IdentityHasher {
    async fn hash(&self, ip: &str, user_agent: &str) -> Result<String, IdentityError>;
}

pub fn digest(ip: &str, user_agent: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(user_agent.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hashes with a fixed secret. Never waits on the network, never rotates.
pub struct StaticSaltHasher {
    secret: String,
}

impl StaticSaltHasher {
    pub fn new(secret: String) -> Self {
        StaticSaltHasher { secret }
    }
}

#[async_trait]
impl IdentityHasher for StaticSaltHasher {
    async fn hash(&self, ip: &str, user_agent: &str) -> Result<String, IdentityError> {
        Ok(digest(ip, user_agent, &self.secret))
    }
}

/// Hashes with a salt that rotates every UTC day. The salt is created once per day in the
/// shared store and then served from memory.
pub struct DailySaltHasher {
    /// Salts keyed by YYYY-MM-DD
    cache: Cache<String, String>,
    store: Arc<dyn SaltStore + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl DailySaltHasher {
    pub fn new(
        store: Arc<dyn SaltStore + Send + Sync>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        let cache = Cache::builder()
            // today and, around midnight, yesterday
            .max_capacity(4)
            .time_to_live(SALT_CACHE_TTL)
            .build();

        DailySaltHasher {
            cache,
            store,
            timesource,
        }
    }

    #[instrument(skip_all)]
    pub async fn daily_salt(&self) -> Result<String, IdentityError> {
        let now = self.timesource.now();
        let today = format_day(now);

        if let Some(salt) = self.cache.get(&today) {
            counter!(SALT_CACHE_HIT_COUNTER).increment(1);
            return Ok(salt);
        }
        counter!(SALT_CACHE_MISS_COUNTER).increment(1);

        let candidate = Uuid::new_v4().to_string();
        let record = self.store.get_or_create_salt(&today, candidate).await?;

        if record.created {
            counter!(SALT_CREATED_COUNTER).increment(1);
            let yesterday = format_day(now - TimeDuration::days(1));
            let store = self.store.clone();
            tokio::spawn(async move {
                match store.delete_salts_before(&yesterday).await {
                    Ok(deleted) => debug!(deleted, cutoff = yesterday, "removed old salts"),
                    Err(err) => debug!(error = %err, "old salt cleanup failed"),
                }
            });
        }

        self.cache.insert(today, record.salt.clone());
        Ok(record.salt)
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl IdentityHasher for DailySaltHasher {
    async fn hash(&self, ip: &str, user_agent: &str) -> Result<String, IdentityError> {
        let salt = self.daily_salt().await?;
        Ok(digest(ip, user_agent, &salt))
    }
}

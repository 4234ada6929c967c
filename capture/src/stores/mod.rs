use async_trait::async_trait;
use thiserror::Error;

use crate::event::GeoLocation;

pub mod memory;
pub mod redis;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("failed to decode stored value: {0}")]
    Decode(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaltRecord {
    pub salt: String,
    /// true when the candidate salt was the one persisted
    pub created: bool,
}

/// Transactional storage for the per-day identity salts.
#[async_trait]
pub trait SaltStore {
    /// Return the salt stored for `day`, or atomically store `candidate` if there is none.
    async fn get_or_create_salt(&self, day: &str, candidate: String)
        -> Result<SaltRecord, StoreError>;

    /// Delete salts of days strictly before `day`. Returns how many were removed.
    async fn delete_salts_before(&self, day: &str) -> Result<u64, StoreError>;
}

/// Cache of geolocation lookups keyed by truncated IP.
#[async_trait]
pub trait LocationCache {
    async fn get_location(&self, ip_trunc: &str) -> Result<Option<GeoLocation>, StoreError>;

    async fn put_location(&self, ip_trunc: &str, location: &GeoLocation)
        -> Result<(), StoreError>;
}

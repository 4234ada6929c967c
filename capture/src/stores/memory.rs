use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;

use crate::event::GeoLocation;
use crate::stores::{LocationCache, SaltRecord, SaltStore, StoreError};

const LOCATION_CACHE_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);
const LOCATION_CACHE_CAPACITY: u64 = 100_000;

/// Process-local store, used when no Redis is configured and in tests.
/// Salts are only shared within this process.
pub struct MemoryStore {
    salts: Mutex<BTreeMap<String, String>>,
    locations: Cache<String, GeoLocation>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_location_capacity(LOCATION_CACHE_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locations expire like the Redis entries and are evicted past `capacity`.
    pub fn with_location_capacity(capacity: u64) -> Self {
        MemoryStore {
            salts: Mutex::new(BTreeMap::new()),
            locations: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(LOCATION_CACHE_TTL)
                .build(),
        }
    }

    pub fn salt_days(&self) -> Vec<String> {
        self.salts
            .lock()
            .map(|salts| salts.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn insert_salt(&self, day: &str, salt: &str) -> Result<(), StoreError> {
        self.salts
            .lock()
            .map_err(|_| poisoned())?
            .insert(day.to_string(), salt.to_string());
        Ok(())
    }

    pub fn cached_locations(&self) -> u64 {
        self.locations.run_pending_tasks();
        self.locations.entry_count()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

#[async_trait]
impl SaltStore for MemoryStore {
    async fn get_or_create_salt(
        &self,
        day: &str,
        candidate: String,
    ) -> Result<SaltRecord, StoreError> {
        let mut salts = self.salts.lock().map_err(|_| poisoned())?;

        if let Some(salt) = salts.get(day) {
            return Ok(SaltRecord {
                salt: salt.clone(),
                created: false,
            });
        }

        salts.insert(day.to_string(), candidate.clone());
        Ok(SaltRecord {
            salt: candidate,
            created: true,
        })
    }

    async fn delete_salts_before(&self, day: &str) -> Result<u64, StoreError> {
        let mut salts = self.salts.lock().map_err(|_| poisoned())?;
        let before = salts.len();
        salts.retain(|d, _| d.as_str() >= day);
        Ok((before - salts.len()) as u64)
    }
}

#[async_trait]
impl LocationCache for MemoryStore {
    async fn get_location(&self, ip_trunc: &str) -> Result<Option<GeoLocation>, StoreError> {
        Ok(self.locations.get(ip_trunc))
    }

    async fn put_location(
        &self,
        ip_trunc: &str,
        location: &GeoLocation,
    ) -> Result<(), StoreError> {
        self.locations
            .insert(ip_trunc.to_string(), location.clone());
        Ok(())
    }
}

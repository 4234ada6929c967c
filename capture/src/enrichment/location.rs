use std::sync::Arc;

use metrics::counter;
use tracing::{instrument, warn};

use crate::enrichment::geoip::GeoIpClient;
use crate::event::GeoLocation;
use crate::stores::LocationCache;

const GEOIP_LOOKUPS_TOTAL: &str = "capture_geoip_lookups_total";

/// Coarse geolocation, resolved once at startup.
#[derive(Clone)]
pub enum Geolocation {
    /// No GeoIP credentials configured, locations only carry the truncated IP.
    Disabled,
    Enabled {
        cache: Arc<dyn LocationCache + Send + Sync>,
        client: GeoIpClient,
    },
}

impl Geolocation {
    /// Cache-aside lookup keyed by the truncated IP. Failures are logged and yield `None`.
    #[instrument(skip(self))]
    pub async fn locate(&self, ip_trunc: &str) -> Option<GeoLocation> {
        let Geolocation::Enabled { cache, client } = self else {
            return None;
        };
        if ip_trunc.is_empty() {
            return None;
        }

        match cache.get_location(ip_trunc).await {
            Ok(Some(location)) => {
                counter!(GEOIP_LOOKUPS_TOTAL, "result" => "cache_hit").increment(1);
                return Some(location);
            }
            Ok(None) => {}
            Err(err) => {
                counter!(GEOIP_LOOKUPS_TOTAL, "result" => "error").increment(1);
                warn!(error = %err, "geoip cache read failed");
                return None;
            }
        }

        let location = match client.city(ip_trunc).await {
            Ok(location) => location,
            Err(err) => {
                counter!(GEOIP_LOOKUPS_TOTAL, "result" => "error").increment(1);
                warn!(error = %err, "geoip lookup failed");
                return None;
            }
        };

        if let Err(err) = cache.put_location(ip_trunc, &location).await {
            counter!(GEOIP_LOOKUPS_TOTAL, "result" => "error").increment(1);
            warn!(error = %err, "geoip cache write failed");
            return None;
        }

        counter!(GEOIP_LOOKUPS_TOTAL, "result" => "service").increment(1);
        Some(location)
    }
}

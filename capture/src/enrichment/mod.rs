//! Turns a pending event into a warehouse row: device attributes and coarse location.

use tracing::instrument;

use crate::event::{Location, PendingEvent, ProcessedEvent};
use crate::ip::{sanitize_ip, truncate_ip};

pub mod device;
pub mod geoip;
pub mod location;

pub use location::Geolocation;

#[derive(Clone)]
pub struct Enricher {
    geolocation: Geolocation,
}

impl Enricher {
    pub fn new(geolocation: Geolocation) -> Self {
        Enricher { geolocation }
    }

    #[instrument(skip_all, fields(event_name = %pending.event_name))]
    pub async fn enrich(&self, pending: PendingEvent) -> ProcessedEvent {
        let device = device::parse_device(&pending.user_agent);

        let ip_trunc = truncate_ip(&sanitize_ip(&pending.client_ip));
        let geo = self.geolocation.locate(&ip_trunc).await;
        let location = Location::new(ip_trunc, geo);

        ProcessedEvent::new(pending, device, location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(client_ip: &str) -> PendingEvent {
        PendingEvent {
            timestamp: "2024-05-01T12:00:00Z".to_string(),
            event_type: "event".to_string(),
            event_name: "pageview".to_string(),
            parameters: "{}".to_string(),
            user_agent: "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
                .to_string(),
            url: "https://x.test/a".to_string(),
            referrer: String::new(),
            client_id: None,
            hash: None,
            user_id: None,
            consent_given: false,
            client_ip: client_ip.to_string(),
        }
    }

    #[tokio::test]
    async fn enriches_without_geolocation() {
        let enricher = Enricher::new(Geolocation::Disabled);

        let event = enricher.enrich(pending("203.0.113.77")).await;

        assert_eq!(event.location.ip_trunc.as_deref(), Some("203.0.113.0"));
        assert_eq!(event.location.country, None);
        assert!(event.device.is_bot);
        assert_eq!(event.event_name, "pageview");
        assert_eq!(event.hash, None);
    }

    #[tokio::test]
    async fn loopback_uses_stand_in_address() {
        let enricher = Enricher::new(Geolocation::Disabled);

        let event = enricher.enrich(pending("127.0.0.1")).await;

        assert_eq!(event.location.ip_trunc.as_deref(), Some("141.20.2.0"));
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CONSENT_EVENT_NAME: &str = "consent";
pub const DEFAULT_EVENT_TYPE: &str = "event";

/// Tracking parameters as sent by the browser snippet. Field names follow the wire keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    /// event name
    pub en: Option<String>,
    /// event type
    pub et: Option<String>,
    pub url: Option<String>,
    /// referrer
    pub r: Option<String>,
    /// free-form parameters, also the consent payload for consent events
    pub p: Option<Value>,
    /// client timestamp
    pub ts: Option<String>,
    /// user agent
    pub ua: Option<String>,
    /// client id
    pub c: Option<String>,
    /// identity hash
    pub h: Option<String>,
    /// identity hash previously stored client side
    pub h1: Option<String>,
    /// client ip, always set by the server
    pub ch: Option<String>,
    /// user id
    pub u: Option<String>,
}

impl RawEvent {
    /// Merge the three request sources. For keys present in several sources the JSON body
    /// wins over the form body, which wins over the query string.
    pub fn merge(
        query: Vec<(String, String)>,
        form: Vec<(String, String)>,
        json: Map<String, Value>,
    ) -> Self {
        let mut merged: Map<String, Value> = Map::new();
        for (key, value) in query.into_iter().chain(form) {
            merged.insert(key, Value::String(value));
        }
        merged.extend(json);

        Self::from_map(&merged)
    }

    pub fn from_map(map: &Map<String, Value>) -> Self {
        let text = |key: &str| map.get(key).and_then(as_text);

        RawEvent {
            en: text("en"),
            et: text("et"),
            url: text("url"),
            r: text("r"),
            p: map.get("p").filter(|v| !v.is_null()).cloned(),
            ts: text("ts"),
            ua: text("ua"),
            c: text("c"),
            h: text("h"),
            h1: text("h1"),
            ch: text("ch"),
            u: text("u"),
        }
    }

    pub fn is_consent(&self) -> bool {
        self.en.as_deref() == Some(CONSENT_EVENT_NAME)
    }
}

// Scalars are accepted for string fields; objects, arrays and nulls are not.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A normalized event whose identity decision has been made, waiting for enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub timestamp: String,
    pub event_type: String,
    pub event_name: String,
    pub parameters: String,
    pub user_agent: String,
    pub url: String,
    pub referrer: String,
    pub client_id: Option<String>,
    pub hash: Option<String>,
    pub user_id: Option<String>,
    pub consent_given: bool,
    pub client_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub continent: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub ip_trunc: Option<String>,
    pub continent: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
}

impl Location {
    pub fn new(ip_trunc: String, geo: Option<GeoLocation>) -> Self {
        let geo = geo.unwrap_or_default();
        Location {
            ip_trunc: Some(ip_trunc).filter(|ip| !ip.is_empty()),
            continent: geo.continent,
            country: geo.country,
            country_code: geo.country_code,
            city: geo.city,
        }
    }
}

/// One warehouse row. Built once by the enricher, never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub timestamp: String,
    pub event_type: String,
    pub event_name: String,
    pub parameters: String,
    pub user_agent: String,
    pub url: String,
    pub referrer: String,
    pub client_id: Option<String>,
    pub hash: Option<String>,
    pub user_id: Option<String>,
    pub consent_given: bool,
    pub device: Device,
    pub location: Location,
}

impl ProcessedEvent {
    pub fn new(pending: PendingEvent, device: Device, location: Location) -> Self {
        ProcessedEvent {
            timestamp: pending.timestamp,
            event_type: pending.event_type,
            event_name: pending.event_name,
            parameters: pending.parameters,
            user_agent: pending.user_agent,
            url: pending.url,
            referrer: pending.referrer,
            client_id: pending.client_id,
            hash: pending.hash,
            user_id: pending.user_id,
            consent_given: pending.consent_given,
            device,
            location,
        }
    }
}

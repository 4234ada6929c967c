//! Consent state machine and the cookies that persist it client side.
//!
//! Everything here is pure: the transition computes cookie mutations, the endpoint renders
//! them as `Set-Cookie` headers.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use cookie::time::Duration as CookieDuration;
use cookie::{Cookie, SameSite};
use serde_json::Value;
use tracing::warn;

const COOKIE_MAX_AGE_SECONDS: i64 = 31_536_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentState {
    Unknown,
    Granted,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub client_id_name: String,
    pub hash_name: String,
    pub consent_name: String,
    /// Omitted from cookies when empty
    pub domain: String,
}

impl CookieSettings {
    pub fn render(&self, mutation: &CookieMutation) -> Cookie<'static> {
        let (name, value) = match mutation {
            CookieMutation::Set { name, value } => (name.clone(), value.clone()),
            CookieMutation::Remove { name } => (name.clone(), String::new()),
        };

        let mut builder = Cookie::build((name, value)).path("/");
        if !self.domain.is_empty() {
            builder = builder.domain(self.domain.clone());
        }

        match mutation {
            CookieMutation::Set { .. } => builder
                .max_age(CookieDuration::seconds(COOKIE_MAX_AGE_SECONDS))
                .same_site(SameSite::None)
                .secure(true)
                .build(),
            CookieMutation::Remove { .. } => builder.removal().build(),
        }
    }

    /// Header value for a mutation, percent-encoded.
    pub fn set_cookie_header(&self, mutation: &CookieMutation) -> String {
        self.render(mutation).encoded().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieMutation {
    Set { name: String, value: String },
    Remove { name: String },
}

impl CookieMutation {
    pub fn name(&self) -> &str {
        match self {
            CookieMutation::Set { name, .. } | CookieMutation::Remove { name } => name,
        }
    }
}

/// The cookies of a request that matter to consent and identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCookies {
    pub consent: Option<String>,
    pub client_id: Option<String>,
    pub hash: Option<String>,
}

impl ClientCookies {
    pub fn from_headers(headers: &HeaderMap, settings: &CookieSettings) -> Self {
        let mut cookies = ClientCookies::default();

        let values = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok());

        for value in values {
            for cookie in Cookie::split_parse_encoded(value).flatten() {
                let name = cookie.name();
                let slot = if name == settings.consent_name {
                    &mut cookies.consent
                } else if name == settings.client_id_name {
                    &mut cookies.client_id
                } else if name == settings.hash_name {
                    &mut cookies.hash
                } else {
                    continue;
                };
                // first occurrence wins, as browsers send the most specific path first
                if slot.is_none() {
                    *slot = Some(cookie.value().to_string()).filter(|v| !v.is_empty());
                }
            }
        }

        cookies
    }
}

/// Consent implied by the request cookies. An explicit consent record decides; without
/// one, the presence of a client id cookie counts as granted.
pub fn current_state(cookies: &ClientCookies) -> ConsentState {
    if let Some(raw) = &cookies.consent {
        match serde_json::from_str::<Value>(raw) {
            Ok(record) => {
                let flag = |key: &str| record.get(key).and_then(Value::as_bool);
                if flag("id") == Some(false) || flag("analytics") == Some(false) {
                    return ConsentState::Revoked;
                }
                if flag("id") == Some(true) {
                    return ConsentState::Granted;
                }
            }
            Err(err) => {
                warn!(error = %err, "malformed consent cookie, falling back to client id");
            }
        }
    }

    if cookies.client_id.is_some() {
        ConsentState::Granted
    } else {
        ConsentState::Unknown
    }
}

/// Identity values known when a consent update is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub client_id: Option<String>,
    pub hash: Option<String>,
    pub previous_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConsentState,
    pub changed: bool,
    /// Client id to report; generated when consent was just granted without one
    pub client_id: Option<String>,
    pub mutations: Vec<CookieMutation>,
}

/// Apply a consent update to the stored consent cookie.
pub fn transition(
    settings: &CookieSettings,
    cookies: &ClientCookies,
    update: Option<&Value>,
    identity: Identity,
    new_client_id: impl FnOnce() -> String,
) -> Transition {
    let serialized = update.map(Value::to_string);

    if serialized == cookies.consent {
        return Transition {
            next: current_state(cookies),
            changed: false,
            client_id: identity.client_id,
            mutations: vec![],
        };
    }

    match update.and_then(|p| p.get("id")).and_then(Value::as_bool) {
        Some(true) => {
            let client_id = identity.client_id.unwrap_or_else(new_client_id);
            let hash = identity
                .previous_hash
                .or(identity.hash)
                .unwrap_or_default();

            let mutations = vec![
                CookieMutation::Set {
                    name: settings.client_id_name.clone(),
                    value: client_id.clone(),
                },
                CookieMutation::Set {
                    name: settings.hash_name.clone(),
                    value: hash,
                },
                CookieMutation::Set {
                    name: settings.consent_name.clone(),
                    value: serialized.unwrap_or_default(),
                },
            ];

            Transition {
                next: ConsentState::Granted,
                changed: true,
                client_id: Some(client_id),
                mutations,
            }
        }
        Some(false) => Transition {
            next: ConsentState::Revoked,
            changed: true,
            client_id: identity.client_id,
            mutations: [
                &settings.client_id_name,
                &settings.hash_name,
                &settings.consent_name,
            ]
            .into_iter()
            .map(|name| CookieMutation::Remove { name: name.clone() })
            .collect(),
        },
        None => Transition {
            next: ConsentState::Unknown,
            changed: true,
            client_id: identity.client_id,
            mutations: vec![],
        },
    }
}

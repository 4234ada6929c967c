use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, field, instrument, Span};
use uuid::Uuid;

use crate::api::{CaptureError, EventResponse};
use crate::consent::{self, ClientCookies, ConsentState, CookieMutation, CookieSettings, Identity};
use crate::event::{PendingEvent, RawEvent, DEFAULT_EVENT_TYPE};
use crate::identity::IdentityHasher;
use crate::pipeline::Pipeline;
use crate::time::TimeSource;

/// What the endpoint sends back: the JSON body and the cookies to set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub response: EventResponse,
    pub cookies: Vec<CookieMutation>,
}

/// Request-scoped values the processor cannot read from the tracking parameters.
pub struct RequestContext<'a> {
    pub cookies: &'a ClientCookies,
    pub client_ip: String,
    pub user_agent: Option<&'a str>,
}

// Empty strings count as absent, like unset parameters.
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn valid_timestamp(ts: &str) -> bool {
    OffsetDateTime::parse(ts, &Rfc3339).is_ok()
}

enum Tracking {
    Identified { client_id: Option<String> },
    Anonymous,
}

pub struct EventProcessor {
    hasher: Arc<dyn IdentityHasher + Send + Sync>,
    cookie_settings: CookieSettings,
    pipeline: Pipeline,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl EventProcessor {
    pub fn new(
        hasher: Arc<dyn IdentityHasher + Send + Sync>,
        cookie_settings: CookieSettings,
        pipeline: Pipeline,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        EventProcessor {
            hasher,
            cookie_settings,
            pipeline,
            timesource,
        }
    }

    pub fn cookie_settings(&self) -> &CookieSettings {
        &self.cookie_settings
    }

    #[instrument(skip_all, fields(event_name, consent_state))]
    pub async fn process(
        &self,
        raw: RawEvent,
        ctx: RequestContext<'_>,
    ) -> Result<ProcessOutcome, CaptureError> {
        let timestamp = present(raw.ts.clone())
            .filter(|ts| valid_timestamp(ts))
            .unwrap_or_else(|| self.timesource.current_time());
        let user_agent = present(raw.ua.clone())
            .or(ctx.user_agent.map(str::to_string))
            .unwrap_or_default();
        let client_ip = ctx.client_ip;

        let hash = match present(raw.h.clone()) {
            Some(hash) => hash,
            None => self.hasher.hash(&client_ip, &user_agent).await?,
        };

        let event_name = raw.en.clone().unwrap_or_default();
        Span::current().record("event_name", event_name.as_str());

        let supplied_client_id = present(raw.c.clone());
        let mut response_hash = Some(hash.clone());
        let mut response_client_id = supplied_client_id.clone();
        let mut cookies = vec![];

        let tracking = if raw.is_consent() {
            let transition = consent::transition(
                &self.cookie_settings,
                ctx.cookies,
                raw.p.as_ref(),
                Identity {
                    client_id: supplied_client_id,
                    hash: Some(hash.clone()),
                    previous_hash: present(raw.h1.clone()),
                },
                || Uuid::new_v4().to_string(),
            );
            Span::current().record("consent_state", field::debug(transition.next));

            if !transition.changed {
                debug!("consent unchanged, skipping consent event");
                return Ok(ProcessOutcome {
                    response: EventResponse::ok(response_client_id, response_hash),
                    cookies,
                });
            }

            cookies = transition.mutations;
            response_client_id = transition.client_id;

            if transition.next == ConsentState::Granted {
                Tracking::Identified {
                    client_id: response_client_id.clone(),
                }
            } else {
                // a declined consent must not leave the hash behind
                response_hash = None;
                Tracking::Anonymous
            }
        } else {
            let state = consent::current_state(ctx.cookies);
            Span::current().record("consent_state", field::debug(state));

            if state == ConsentState::Granted {
                let client_id = response_client_id.or_else(|| ctx.cookies.client_id.clone());
                response_client_id = client_id.clone();
                Tracking::Identified { client_id }
            } else {
                Tracking::Anonymous
            }
        };

        let pending = PendingEvent {
            timestamp,
            event_type: present(raw.et).unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            event_name,
            parameters: raw
                .p
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "{}".to_string()),
            user_agent,
            url: raw.url.unwrap_or_default(),
            referrer: raw.r.unwrap_or_default(),
            client_id: None,
            hash: None,
            user_id: None,
            consent_given: false,
            client_ip,
        };

        let pending = match tracking {
            Tracking::Identified { client_id } => PendingEvent {
                client_id,
                hash: response_hash.clone(),
                user_id: raw.u,
                consent_given: true,
                ..pending
            },
            Tracking::Anonymous => pending,
        };

        if let Err(err) = self.pipeline.schedule(pending) {
            debug!(error = %err, "event not scheduled");
        }

        Ok(ProcessOutcome {
            response: EventResponse::ok(response_client_id, response_hash),
            cookies,
        })
    }
}

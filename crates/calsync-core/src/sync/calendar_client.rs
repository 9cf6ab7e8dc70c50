//! Microsoft Graph calendar API client for sync operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, CoreError};
use crate::sync::event_codec::{parse_graph_event, to_graph_event, EventPayload, RemoteEvent};
use crate::sync::types::SyncError;

const EVENT_SELECT: &str =
    "id,subject,body,bodyPreview,start,end,location,isAllDay,isCancelled,createdDateTime,lastModifiedDateTime";
const PAGE_SIZE: &str = "100";

/// Supplies bearer tokens. Acquisition itself happens elsewhere.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, SyncError>;

    /// Called once after the remote rejects the current token.
    async fn refresh(&self) -> Result<String, SyncError>;
}

/// A fixed bearer token.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn access_token(&self) -> Result<String, SyncError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String, SyncError> {
        Ok(self.token.clone())
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Only events modified at or after this instant; `None` lists everything.
    pub modified_since: Option<DateTime<Utc>>,
    /// Only events overlapping this range.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl ListQuery {
    pub fn is_full(&self) -> bool {
        self.modified_since.is_none()
    }
}

/// Remote calendar operations used by the sync engine.
#[async_trait]
pub trait RemoteCalendar: Send + Sync {
    async fn list_events(
        &self,
        calendar_id: &str,
        query: &ListQuery,
    ) -> Result<Vec<RemoteEvent>, SyncError>;

    /// Returns the new remote id.
    async fn create_event(
        &self,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<String, SyncError>;

    async fn update_event(
        &self,
        calendar_id: &str,
        external_id: &str,
        payload: &EventPayload,
    ) -> Result<(), SyncError>;

    /// Deleting an event that no longer exists succeeds.
    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> Result<(), SyncError>;
}

/// Graph calendar API client.
pub struct CalendarClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl CalendarClient {
    /// Create a client for `base_url` (e.g. `https://graph.microsoft.com/v1.0`).
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, CoreError> {
        url::Url::parse(base_url).map_err(|e| ConfigError::InvalidValue {
            key: "graph.base_url".into(),
            message: e.to_string(),
        })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SyncError::from)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn events_url(&self, calendar_id: &str) -> String {
        format!(
            "{}/me/calendars/{}/events",
            self.base_url,
            urlencoding::encode(calendar_id)
        )
    }

    fn event_url(&self, calendar_id: &str, external_id: &str) -> String {
        format!(
            "{}/{}",
            self.events_url(calendar_id),
            urlencoding::encode(external_id)
        )
    }

    fn list_url(&self, calendar_id: &str, query: &ListQuery) -> String {
        let mut params = vec![
            ("$select".to_string(), EVENT_SELECT.to_string()),
            ("$top".to_string(), PAGE_SIZE.to_string()),
        ];

        let mut url = match query.window {
            Some((start, end)) => {
                params.push(("startDateTime".to_string(), start.to_rfc3339()));
                params.push(("endDateTime".to_string(), end.to_rfc3339()));
                format!(
                    "{}/me/calendars/{}/calendarView",
                    self.base_url,
                    urlencoding::encode(calendar_id)
                )
            }
            None => self.events_url(calendar_id),
        };

        if let Some(since) = query.modified_since {
            params.push((
                "$filter".to_string(),
                format!("lastModifiedDateTime ge {}", since.to_rfc3339()),
            ));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        url.push('?');
        url.push_str(&query);
        url
    }

    /// Send a request, refreshing the token once on 401.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, SyncError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let token = self.credentials.access_token().await?;
        let response = build(&token).send().await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!("access token rejected, refreshing");
            let token = self.credentials.refresh().await?;
            let retried = build(&token).send().await?;
            if retried.status() == StatusCode::UNAUTHORIZED {
                return Err(SyncError::Unauthorized);
            }
            retried
        } else {
            response
        };

        check_status(response).await
    }
}

fn retry_after_secs(value: Option<&HeaderValue>) -> Option<u64> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Pull `error.message` out of a Graph error body, or return it raw.
fn graph_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(SyncError::RateLimited {
            retry_after_secs: retry_after_secs(response.headers().get(RETRY_AFTER)),
        }),
        StatusCode::NOT_FOUND => Err(SyncError::NotFound),
        StatusCode::UNAUTHORIZED => Err(SyncError::Unauthorized),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(SyncError::Http {
                status: status.as_u16(),
                message: graph_error_message(&body),
            })
        }
    }
}

#[async_trait]
impl RemoteCalendar for CalendarClient {
    async fn list_events(
        &self,
        calendar_id: &str,
        query: &ListQuery,
    ) -> Result<Vec<RemoteEvent>, SyncError> {
        let mut events = Vec::new();
        let mut next = Some(self.list_url(calendar_id, query));

        while let Some(url) = next.take() {
            let response = self
                .send(|token| {
                    self.http
                        .get(&url)
                        .bearer_auth(token)
                        .header("Prefer", "outlook.timezone=\"UTC\"")
                })
                .await?;
            let page: serde_json::Value = response.json().await?;

            for item in page["value"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
                match parse_graph_event(item, calendar_id) {
                    Ok(event) => events.push(event),
                    Err(e) => tracing::warn!(calendar_id, error = %e, "skipping unparsable remote event"),
                }
            }
            next = page["@odata.nextLink"].as_str().map(str::to_string);
        }

        tracing::debug!(calendar_id, count = events.len(), full = query.is_full(), "listed remote events");
        Ok(events)
    }

    async fn create_event(
        &self,
        calendar_id: &str,
        payload: &EventPayload,
    ) -> Result<String, SyncError> {
        let url = self.events_url(calendar_id);
        let body = to_graph_event(payload);
        let response = self
            .send(|token| self.http.post(&url).bearer_auth(token).json(&body))
            .await?;
        let created: serde_json::Value = response.json().await?;
        created["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| SyncError::Payload("create response has no id".into()))
    }

    async fn update_event(
        &self,
        calendar_id: &str,
        external_id: &str,
        payload: &EventPayload,
    ) -> Result<(), SyncError> {
        let url = self.event_url(calendar_id, external_id);
        let body = to_graph_event(payload);
        self.send(|token| self.http.patch(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_event(&self, calendar_id: &str, external_id: &str) -> Result<(), SyncError> {
        let url = self.event_url(calendar_id, external_id);
        match self
            .send(|token| self.http.delete(&url).bearer_auth(token))
            .await
        {
            Ok(_) | Err(SyncError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

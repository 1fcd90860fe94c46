//! Home-automation REST backend (Home Assistant style API).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::error::{PilotError, PilotResult};
use crate::types::BoxFuture;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    Retryable,
    NotFound,
    Fatal,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, BackendErrorKind::Retryable)
    }

    pub fn reason_label(&self) -> &'static str {
        match self.kind {
            BackendErrorKind::Retryable => "retryable",
            BackendErrorKind::NotFound => "not_found",
            BackendErrorKind::Fatal => "fatal",
        }
    }
}

impl From<BackendError> for PilotError {
    fn from(err: BackendError) -> Self {
        PilotError::Backend(format!("{}: {}", err.reason_label(), err.message))
    }
}

/// `GET /api/states/{entity_id}` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    #[serde(default)]
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: JsonValue,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: JsonValue::Null,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(
            self.state.trim().to_ascii_lowercase().as_str(),
            "unknown" | "unavailable" | ""
        )
    }

    pub fn is_on(&self) -> bool {
        self.state.trim().eq_ignore_ascii_case("on")
    }

    /// Numeric value of the state; binary entities map on/off to 1/0.
    pub fn numeric(&self) -> Option<f64> {
        let s = self.state.trim();
        if s.eq_ignore_ascii_case("on") {
            return Some(1.0);
        }
        if s.eq_ignore_ascii_case("off") {
            return Some(0.0);
        }
        s.parse::<f64>().ok().filter(|v| v.is_finite())
    }
}

/// `POST /api/services/{domain}/{service}` with a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: JsonValue,
}

pub fn entity_domain(entity_id: &str) -> &str {
    entity_id.split('.').next().unwrap_or("")
}

impl ServiceCall {
    /// Service selected by entity domain:
    /// `input_number`/`number` -> `set_value {value}`,
    /// `climate` -> `set_temperature {temperature}`,
    /// `switch`/`light`/`input_boolean` -> `turn_on`/`turn_off` (threshold 0.5),
    /// anything else -> `set_value {value}` in its own domain.
    ///
    /// `service` overrides the service name while keeping the domain.
    pub fn for_entity(entity_id: &str, value: f64, service: Option<&str>) -> Self {
        let domain = entity_domain(entity_id).to_string();
        let (default_service, data) = match domain.as_str() {
            "climate" => (
                "set_temperature",
                json!({ "entity_id": entity_id, "temperature": value }),
            ),
            "switch" | "light" | "input_boolean" => (
                if value > 0.5 { "turn_on" } else { "turn_off" },
                json!({ "entity_id": entity_id }),
            ),
            _ => ("set_value", json!({ "entity_id": entity_id, "value": value })),
        };
        Self {
            domain,
            service: service.unwrap_or(default_service).to_string(),
            data,
        }
    }

    pub fn turn_off(entity_id: &str) -> Self {
        Self {
            domain: entity_domain(entity_id).to_string(),
            service: "turn_off".to_string(),
            data: json!({ "entity_id": entity_id }),
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.data.get("entity_id").and_then(JsonValue::as_str)
    }
}

pub trait HomeBackend: Send + Sync {
    fn get_state<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, BackendResult<EntityState>>;

    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, BackendResult<()>>;
}

impl<T: HomeBackend + ?Sized> HomeBackend for Arc<T> {
    fn get_state<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, BackendResult<EntityState>> {
        (**self).get_state(entity_id)
    }

    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, BackendResult<()>> {
        (**self).call_service(call)
    }
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: &str, request_timeout: Duration) -> PilotResult<Self> {
        if base_url.trim().is_empty() {
            return Err(PilotError::config("backend url is empty"));
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| PilotError::config(format!("backend http client: {err}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /api/` connectivity check.
    pub async fn ping(&self) -> BackendResult<()> {
        let resp = self
            .http
            .get(format!("{}/api/", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &body));
        }
        Ok(())
    }

    async fn fetch_state(&self, entity_id: &str) -> BackendResult<EntityState> {
        let resp = self
            .http
            .get(format!("{}/api/states/{}", self.base_url, entity_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(map_status(status.as_u16(), &body));
        }
        let mut state: EntityState = serde_json::from_str(&body)
            .map_err(|err| BackendError::fatal(format!("state parse error for {entity_id}: {err}")))?;
        if state.entity_id.is_empty() {
            state.entity_id = entity_id.to_string();
        }
        Ok(state)
    }

    async fn post_service(&self, call: ServiceCall) -> BackendResult<()> {
        let resp = self
            .http
            .post(format!(
                "{}/api/services/{}/{}",
                self.base_url, call.domain, call.service
            ))
            .bearer_auth(&self.token)
            .json(&call.data)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), &body));
        }
        Ok(())
    }
}

impl HomeBackend for HttpBackend {
    fn get_state<'a>(&'a self, entity_id: &'a str) -> BoxFuture<'a, BackendResult<EntityState>> {
        Box::pin(self.fetch_state(entity_id))
    }

    fn call_service(&self, call: ServiceCall) -> BoxFuture<'_, BackendResult<()>> {
        Box::pin(self.post_service(call))
    }
}

fn map_transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BackendError::retryable(format!("transport: {err}"))
    } else {
        BackendError::fatal(format!("transport: {err}"))
    }
}

fn map_status(status: u16, body: &str) -> BackendError {
    let message = format!("status {status}: {body}");
    match status {
        404 => BackendError::not_found(message),
        408 | 429 => BackendError::retryable(message),
        s if s >= 500 => BackendError::retryable(message),
        _ => BackendError::fatal(message),
    }
}

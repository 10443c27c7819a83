//! API request records
//!
//! Per-endpoint request types with explicit optional fields, validated at
//! the edge. The "session_id or credentials" disjunction every engine
//! endpoint accepts is parsed into `SessionRef` before any work starts.

use crate::appointment::{ContainerType, PhaseData};
use crate::error::GatewayError;
use crate::listing::ScrollMode;
use crate::session::Credentials;
use serde::Deserialize;

/// Flattened into engine requests: either an existing session id or a full
/// credential set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSelector {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub captcha_api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SessionRef {
    ById(String),
    ByCredentials(Credentials),
}

impl SessionSelector {
    pub fn resolve(
        &self,
        default_captcha_key: Option<&str>,
    ) -> Result<SessionRef, GatewayError> {
        if let Some(id) = self.session_id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(SessionRef::ById(id.to_string()));
        }
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) if !username.is_empty() => {
                let captcha_key = self
                    .captcha_api_key
                    .clone()
                    .filter(|k| !k.is_empty())
                    .or_else(|| default_captcha_key.map(str::to_owned))
                    .ok_or_else(|| GatewayError::missing_field("captcha_api_key"))?;
                Ok(SessionRef::ByCredentials(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                    captcha_key,
                }))
            }
            (Some(_), None) => Err(GatewayError::missing_field("password")),
            _ => Err(GatewayError::missing_field("session_id or username/password")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GetSessionRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub captcha_api_key: Option<String>,
}

/// Scroll-mode knobs shared by the two listing endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrollOptions {
    #[serde(default)]
    pub infinite_scrolling: Option<bool>,
    #[serde(default)]
    pub target_count: Option<usize>,
    #[serde(default)]
    pub target_container_id: Option<String>,
}

impl ScrollOptions {
    /// A target id wins over a count, a count over plain exhaustion.
    pub fn mode(&self) -> Result<ScrollMode, GatewayError> {
        if let Some(target) = self
            .target_container_id
            .as_deref()
            .filter(|t| !t.is_empty())
        {
            return Ok(ScrollMode::Target(target.to_string()));
        }
        if let Some(count) = self.target_count {
            return Ok(ScrollMode::Count(count));
        }
        if self.infinite_scrolling == Some(true) {
            return Ok(ScrollMode::Exhaust);
        }
        Err(GatewayError::missing_field(
            "infinite_scrolling, target_count, or target_container_id",
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct GetContainersRequest {
    #[serde(flatten)]
    pub session: SessionSelector,
    #[serde(flatten)]
    pub scroll: ScrollOptions,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
pub struct ContainerDetailRequest {
    #[serde(flatten)]
    pub session: SessionSelector,
    pub container_id: String,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
pub struct GetAppointmentsRequest {
    #[serde(flatten)]
    pub session: SessionSelector,
    #[serde(flatten)]
    pub scroll: ScrollOptions,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkInfoRequest {
    #[serde(flatten)]
    pub session: SessionSelector,
    #[serde(default)]
    pub import_containers: Vec<String>,
    #[serde(default)]
    pub export_containers: Vec<String>,
    #[serde(default)]
    pub debug: bool,
}

/// Shared by `check_appointments` and `make_appointment`; the latter also
/// reads `appointment_time` out of the flattened phase fields.
#[derive(Debug, Deserialize)]
pub struct AppointmentRequest {
    pub container_type: ContainerType,
    #[serde(flatten)]
    pub session: SessionSelector,
    #[serde(default)]
    pub appointment_session_id: Option<String>,
    #[serde(flatten)]
    pub fields: PhaseData,
    #[serde(default)]
    pub debug: bool,
}

//! Crate-wide error taxonomy
//!
//! Every failure that can reach a client carries a stable `ErrorKind` whose
//! wire code (`as_str`) is part of the API contract. Driver-level transients
//! are retried at their call sites and only surface here after exhaustion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

/// Stable, client-visible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // Input
    MissingField,
    InvalidType,
    UnknownEndpoint,
    // Session
    SessionNotFound,
    SessionDead,
    SessionExpired,
    CapacityExceeded,
    // Auth
    InvalidCredentials,
    CaptchaFailed,
    LoginTimeout,
    DriverStartup,
    // Navigation / driver
    NavTimeout,
    ElementNotFound,
    ClickIntercepted,
    DownloadTimeout,
    // Workflow
    DropdownNotFound,
    OptionNotFound,
    StepperStuck,
    Validation,
    CheckboxStuck,
    SubmitFailed,
    // Data
    ContainerNotFound,
    PregateUnknown,
    FileNotFound,
    // Catch-all
    Internal,
}

impl ErrorKind {
    /// Wire code emitted in the `error` field of JSON error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MissingField => "MISSING_FIELD",
            ErrorKind::InvalidType => "INVALID_TYPE",
            ErrorKind::UnknownEndpoint => "UNKNOWN_ENDPOINT",
            ErrorKind::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorKind::SessionDead => "SESSION_DEAD",
            ErrorKind::SessionExpired => "SESSION_EXPIRED",
            ErrorKind::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorKind::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorKind::CaptchaFailed => "CAPTCHA_FAILED",
            ErrorKind::LoginTimeout => "LOGIN_TIMEOUT",
            ErrorKind::DriverStartup => "DRIVER_STARTUP",
            ErrorKind::NavTimeout => "NAV_TIMEOUT",
            ErrorKind::ElementNotFound => "ELEMENT_NOT_FOUND",
            ErrorKind::ClickIntercepted => "CLICK_INTERCEPTED",
            ErrorKind::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            ErrorKind::DropdownNotFound => "DROPDOWN_NOT_FOUND",
            ErrorKind::OptionNotFound => "OPTION_NOT_FOUND",
            ErrorKind::StepperStuck => "STEPPER_STUCK",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::CheckboxStuck => "CHECKBOX_STUCK",
            ErrorKind::SubmitFailed => "SUBMIT_FAILED",
            ErrorKind::ContainerNotFound => "CONTAINER_NOT_FOUND",
            ErrorKind::PregateUnknown => "PREGATE_UNKNOWN",
            ErrorKind::FileNotFound => "FILE_NOT_FOUND",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// HTTP status: 4xx for client-attributable failures, 5xx for internal
    /// or upstream-portal failures.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::MissingField | ErrorKind::InvalidType => StatusCode::BAD_REQUEST,
            ErrorKind::UnknownEndpoint
            | ErrorKind::SessionNotFound
            | ErrorKind::ContainerNotFound
            | ErrorKind::FileNotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ErrorKind::SessionDead | ErrorKind::SessionExpired => StatusCode::GONE,
            // Portal rejected the supplied field values
            ErrorKind::Validation | ErrorKind::OptionNotFound => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorKind::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::LoginTimeout | ErrorKind::NavTimeout | ErrorKind::DownloadTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ErrorKind::CaptchaFailed
            | ErrorKind::ElementNotFound
            | ErrorKind::ClickIntercepted
            | ErrorKind::DropdownNotFound
            | ErrorKind::StepperStuck
            | ErrorKind::CheckboxStuck
            | ErrorKind::SubmitFailed
            | ErrorKind::PregateUnknown => StatusCode::BAD_GATEWAY,
            ErrorKind::DriverStartup | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error on its way out to a client, with whatever resumption context is
/// meaningful for the failed request.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    pub session_id: Option<String>,
    pub appointment_session_id: Option<String>,
    pub current_phase: Option<u8>,
    pub screenshot_url: Option<String>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session_id: None,
            appointment_session_id: None,
            current_phase: None,
            screenshot_url: None,
        }
    }

    pub fn missing_field(name: &str) -> Self {
        Self::new(ErrorKind::MissingField, format!("missing required field: {name}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_appointment(mut self, appt_id: impl Into<String>, phase: u8) -> Self {
        self.appointment_session_id = Some(appt_id.into());
        self.current_phase = Some(phase);
        self
    }

    pub fn with_screenshot(mut self, url: impl Into<String>) -> Self {
        self.screenshot_url = Some(url.into());
        self
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.kind.as_str(),
            "error_message": self.message,
        });
        let obj = body.as_object_mut().unwrap();
        if let Some(id) = &self.session_id {
            obj.insert("session_id".into(), json!(id));
        }
        if let Some(id) = &self.appointment_session_id {
            obj.insert("appointment_session_id".into(), json!(id));
        }
        if let Some(phase) = self.current_phase {
            obj.insert("current_phase".into(), json!(phase));
        }
        if let Some(url) = &self.screenshot_url {
            obj.insert("screenshot_url".into(), json!(url));
        }
        (self.kind.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        for kind in [
            ErrorKind::MissingField,
            ErrorKind::InvalidType,
            ErrorKind::SessionNotFound,
            ErrorKind::InvalidCredentials,
            ErrorKind::Validation,
            ErrorKind::SessionExpired,
        ] {
            assert!(kind.status().is_client_error(), "{kind} should be 4xx");
        }
    }

    #[test]
    fn upstream_errors_map_to_5xx() {
        for kind in [
            ErrorKind::CaptchaFailed,
            ErrorKind::StepperStuck,
            ErrorKind::NavTimeout,
            ErrorKind::DownloadTimeout,
            ErrorKind::SubmitFailed,
            ErrorKind::Internal,
        ] {
            assert!(kind.status().is_server_error(), "{kind} should be 5xx");
        }
    }

    #[test]
    fn wire_codes_are_screaming_snake() {
        assert_eq!(ErrorKind::SessionDead.as_str(), "SESSION_DEAD");
        assert_eq!(ErrorKind::OptionNotFound.as_str(), "OPTION_NOT_FOUND");
        assert_eq!(ErrorKind::CapacityExceeded.as_str(), "CAPACITY_EXCEEDED");
    }

    #[test]
    fn builder_attaches_resumption_context() {
        let err = GatewayError::missing_field("truck_plate")
            .with_appointment("appt-1", 2)
            .with_session("sess-1");
        assert_eq!(err.kind, ErrorKind::MissingField);
        assert_eq!(err.current_phase, Some(2));
        assert_eq!(err.appointment_session_id.as_deref(), Some("appt-1"));
        assert_eq!(err.session_id.as_deref(), Some("sess-1"));
    }
}

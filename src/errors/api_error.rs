//! Error único de la capa HTTP.
//!
//! Cada crate tiene su propio enum; aquí se traducen a un status y un código
//! estable. El cuerpo siempre es `{error, code, trace_id}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gate_adapters::AdapterError;
use gate_core::{classify_error, ErrorClass, FlowEngineError};
use gate_guard::GuardError;
use gate_ledger::LedgerError;
use gate_org::OrgError;
use gate_worker::WorkerError;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub trace_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status,
               code,
               message: message.into(),
               trace_id: None }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "permission_denied", message)
    }

    pub fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let trace_id = self.trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.status.is_server_error() {
            log::error!("http:error status={} code={} trace={trace_id} err={}",
                        self.status.as_u16(),
                        self.code,
                        self.message);
        } else {
            log::debug!("http:reject status={} code={} trace={trace_id}", self.status.as_u16(), self.code);
        }
        let body = json!({ "error": self.message, "code": self.code, "trace_id": trace_id });
        (self.status, Json(body)).into_response()
    }
}

impl From<FlowEngineError> for ApiError {
    fn from(e: FlowEngineError) -> Self {
        match classify_error(&e) {
            ErrorClass::Validation => Self::validation(e.to_string()),
            ErrorClass::NotFound => Self::not_found(e.to_string()),
            ErrorClass::Transient => Self::unavailable("store_unavailable", e.to_string()),
            ErrorClass::Permanent => match e {
                FlowEngineError::RunTerminal(_) => Self::new(StatusCode::BAD_REQUEST, "run_terminal", e.to_string()),
                other => Self::internal(other.to_string()),
            },
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::QuotaExceeded { .. } => Self::new(StatusCode::PAYMENT_REQUIRED, "quota_exceeded", e.to_string()),
            LedgerError::DuplicateIdempotencyKey { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "duplicate_idempotency_key", e.to_string())
            }
            LedgerError::InvalidSignature => Self::new(StatusCode::FORBIDDEN, "invalid_signature", e.to_string()),
            LedgerError::InvalidAmount(_)
            | LedgerError::EmptyRef
            | LedgerError::InvalidPayload(_)
            | LedgerError::Overflow { .. } => {
                Self::validation(e.to_string())
            }
            LedgerError::Store(_) => Self::unavailable("store_unavailable", e.to_string()),
        }
    }
}

impl From<OrgError> for ApiError {
    fn from(e: OrgError) -> Self {
        match e {
            OrgError::PermissionDenied { .. } => Self::forbidden(e.to_string()),
            OrgError::OrgNotFound(_) | OrgError::NotMember { .. } | OrgError::InviteNotFound | OrgError::JobNotFound(_) => {
                Self::not_found(e.to_string())
            }
            OrgError::LastAdmin(_) => Self::new(StatusCode::BAD_REQUEST, "last_admin", e.to_string()),
            OrgError::InviteExpired | OrgError::InviteUsed => {
                Self::new(StatusCode::BAD_REQUEST, "invite_invalid", e.to_string())
            }
            OrgError::Validation(_)
            | OrgError::AlreadyMember { .. }
            | OrgError::InvalidInviteRole(_)
            | OrgError::JobCompleted(_) => Self::validation(e.to_string()),
        }
    }
}

impl From<AdapterError> for ApiError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::UnknownAgent(_) | AdapterError::InvalidInput(_) => Self::validation(e.to_string()),
            AdapterError::Upstream(_) | AdapterError::Embedding(_) => Self::unavailable("upstream_unavailable",
                                                                                        e.to_string()),
            AdapterError::Sink(_) => Self::internal(e.to_string()),
            AdapterError::Store(_) => Self::unavailable("store_unavailable", e.to_string()),
        }
    }
}

impl From<GuardError> for ApiError {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::CircuitOpen { .. } => Self::unavailable(e.code(), e.to_string()),
            _ => Self::new(StatusCode::BAD_REQUEST, e.code(), e.to_string()),
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        if e.is_transient() {
            Self::unavailable("queue_unavailable", e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_maps_to_payment_required() {
        let err: ApiError = LedgerError::QuotaExceeded { reference: "acme".into(),
                                                         usage: 10,
                                                         amount: 5,
                                                         hard_limit: 12 }.into();
        assert_eq!(err.status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(err.code, "quota_exceeded");
    }

    #[test]
    fn circuit_open_is_unavailable() {
        let err: ApiError = GuardError::CircuitOpen { tool: "sentiment".into() }.into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code, "circuit_open");
    }

    #[test]
    fn engine_errors_follow_their_class() {
        let missing: ApiError = FlowEngineError::FlowNotFound(Uuid::nil()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        let invalid: ApiError = FlowEngineError::CycleDetected("a".into()).into();
        assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
        let store: ApiError = FlowEngineError::Store("reset".into()).into();
        assert_eq!(store.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn org_permission_is_forbidden() {
        let err: ApiError = OrgError::PermissionDenied { user: "bob".into(),
                                                         permission: gate_org::Permission::ManageMembers }.into();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }
}

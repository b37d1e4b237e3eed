//! HTTP error mapping. Domain errors convert into `ApiError`, which renders the
//! `{"success": false, "error": ...}` envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::ai::full_analysis::AnalysisError;
use crate::ai::optimizer::OptimizerError;
use crate::ai::viral::ViralError;
use crate::auth::AuthError;
use crate::enterprise::EscrowError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// 400; `fallback` is attached to the body when present.
    #[error("{message}")]
    BadRequest {
        message: String,
        fallback: Option<Value>,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            message: message.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(message: impl Into<String>, fallback: Value) -> Self {
        ApiError::BadRequest {
            message: message.into(),
            fallback: Some(fallback),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Auth(AuthError::MissingToken | AuthError::InvalidToken) => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Auth(AuthError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            ApiError::Escrow(e) => match e {
                EscrowError::Validation(_)
                | EscrowError::InsufficientSignatures { .. }
                | EscrowError::UnknownSignatory(_) => StatusCode::BAD_REQUEST,
                EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
                EscrowError::InvalidTransition { .. } => StatusCode::CONFLICT,
                EscrowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ViralError> for ApiError {
    fn from(e: ViralError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl From<OptimizerError> for ApiError {
    fn from(e: OptimizerError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

// The aggregate endpoint reports every branch failure as a server error.
impl From<AnalysisError> for ApiError {
    fn from(e: AnalysisError) -> Self {
        ApiError::Internal(format!("full analysis failed: {e}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(target: "api", error = %self, "request failed");
        } else {
            warn!(target: "api", status = status.as_u16(), error = %self, "request rejected");
        }

        let mut body = json!({ "success": false, "error": self.to_string() });
        match self {
            ApiError::BadRequest {
                fallback: Some(fb), ..
            } => body["fallback"] = fb,
            ApiError::Escrow(EscrowError::Validation(fields)) => {
                body["details"] = json!(fields);
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Capability;
    use uuid::Uuid;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::bad_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::from(AuthError::MissingToken).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::from(AuthError::Forbidden {
                subject: "s".into(),
                required: Capability::Admin
            })
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from(EscrowError::NotFound(Uuid::nil())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(EscrowError::InvalidTransition {
                from: crate::enterprise::EscrowStatus::Released,
                action: "lock"
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ApiError::Internal("boom".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use berth_core::CoreError;
use serde_json::json;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ApiError {
    /// An error propagated from the port layer core.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The request body is malformed or contains invalid values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Stable machine-readable name for a [`CoreError`] kind.
#[must_use]
pub fn error_code(err: &CoreError) -> &'static str {
    match err {
        CoreError::NotFound { .. } => "NotFound",
        CoreError::Duplicate { .. } => "Duplicate",
        CoreError::InvalidArgument(_) => "InvalidArgument",
        CoreError::InvalidState { .. } => "InvalidState",
        CoreError::ConcurrentAccess { .. } => "ConcurrentAccess",
        CoreError::Timeout { .. } => "Timeout",
        CoreError::InfrastructureFault(_) => "InfrastructureFault",
        CoreError::MigrationFailed { .. } => "MigrationFailed",
        CoreError::DataDecode(_) => "DataDecode",
        CoreError::DeviceInUse { .. } => "DeviceInUse",
        _ => "Internal",
    }
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Duplicate { .. }
        | CoreError::InvalidState { .. }
        | CoreError::ConcurrentAccess { .. }
        | CoreError::DeviceInUse { .. } => StatusCode::CONFLICT,
        CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Core(e) => (status_for(e), error_code(e)),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidArgument"),
        };
        (
            status,
            Json(json!({"code": code, "message": self.to_string()})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::State;

    #[test]
    fn core_error_status_codes_map_correctly() {
        let cases = [
            (
                CoreError::NotFound {
                    kind: "container",
                    id: "c1".into(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                CoreError::Duplicate {
                    kind: "scope",
                    id: "s1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                CoreError::ConcurrentAccess {
                    change_version: "9".into(),
                },
                StatusCode::CONFLICT,
            ),
            (
                CoreError::InvalidState {
                    op: "remove",
                    state: State::Running,
                },
                StatusCode::CONFLICT,
            ),
            (
                CoreError::InvalidArgument("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                CoreError::Timeout {
                    what: "power state",
                    timeout: std::time::Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                CoreError::InfrastructureFault("down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let resp = ApiError::Core(err).into_response();
            assert_eq!(resp.status(), expected);
        }
    }

    #[test]
    fn error_body_carries_code_and_message() {
        let err = ApiError::Core(CoreError::NotFound {
            kind: "container",
            id: "deadbeef".into(),
        });
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_codes_name_the_kind() {
        assert_eq!(
            error_code(&CoreError::ConcurrentAccess {
                change_version: "3".into()
            }),
            "ConcurrentAccess"
        );
        assert_eq!(
            error_code(&CoreError::DataDecode("junk".into())),
            "DataDecode"
        );
    }
}

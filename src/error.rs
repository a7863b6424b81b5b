use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::types::{ErrorBody, ErrorKind};

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("artifact not found at {path}")]
    Missing { path: String },
    #[error("failed to read artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse artifact {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{what} length mismatch: got {got}, expected {expected}")]
    Dimension {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("artifact feature order {got:?} does not match the service schema")]
    FeatureNames { got: Vec<String> },
    #[error("invalid artifact: {0}")]
    Invalid(String),
    #[error("classifier failed: {0}")]
    Classifier(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("rpm {rpm} would make the rolling statistics of {vehicle_id} non-finite")]
    NonFinite { vehicle_id: String, rpm: f64 },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Failure of one request, single-shot or streamed.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid reading: {0}")]
    Validation(String),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error("scoring did not finish within {0} ms")]
    Timeout(u64),
    #[error("connection error: {0}")]
    Connection(String),
}

impl From<StateError> for ServiceError {
    fn from(e: StateError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Scoring(_) => ErrorKind::Scoring,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Connection(_) => ErrorKind::Connection,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Scoring(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Connection(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_status() {
        let e = ServiceError::Validation("bad".into());
        assert_eq!(e.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(e.body().kind, ErrorKind::Validation);

        let e: ServiceError = ScoringError::Dimension {
            what: "feature vector",
            got: 3,
            expected: 9,
        }
        .into();
        assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            e.body().error,
            "feature vector length mismatch: got 3, expected 9"
        );

        assert_eq!(ServiceError::Timeout(250).status(), StatusCode::GATEWAY_TIMEOUT);
    }
}

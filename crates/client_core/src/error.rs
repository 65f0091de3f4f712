use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Failures surfaced to the originating view as dismissible messages. None is
/// fatal to the session; every operation may be retried by the user.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server rejected the request: {message}")]
    Api { code: ErrorCode, message: String },
    #[error("another request is already in flight")]
    RequestInFlight,
    #[error("invalid server url '{0}'")]
    InvalidServerUrl(String),
    #[error("unexpected server response: {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Validation,
    NotFound,
    Other,
}

impl ClientError {
    pub fn from_api(error: ApiError) -> Self {
        Self::Api {
            code: error.code,
            message: error.message,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Transport(_) => ErrorCategory::Transport,
            ClientError::Api {
                code: ErrorCode::Validation,
                ..
            } => ErrorCategory::Validation,
            ClientError::Api {
                code: ErrorCode::NotFound,
                ..
            } => ErrorCategory::NotFound,
            _ => ErrorCategory::Other,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ClientError::UnexpectedResponse(error.to_string())
        } else {
            ClientError::Transport(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_classify_by_code() {
        let validation = ClientError::from_api(ApiError::validation("bad field"));
        assert_eq!(validation.category(), ErrorCategory::Validation);

        let missing = ClientError::from_api(ApiError::not_found("no such token"));
        assert_eq!(missing.category(), ErrorCategory::NotFound);

        let internal = ClientError::from_api(ApiError::new(ErrorCode::Internal, "boom"));
        assert_eq!(internal.category(), ErrorCategory::Other);
    }

    #[test]
    fn transport_classifies_as_transport() {
        let err = ClientError::Transport("connection refused".into());
        assert_eq!(err.category(), ErrorCategory::Transport);
    }
}

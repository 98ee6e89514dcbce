use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    ProtocolSequence,
    AlreadyEnded,
    Internal,
}

/// JSON body of every non-2xx reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct ApiException {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiException {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ApiException> for ApiError {
    fn from(value: ApiException) -> Self {
        Self {
            code: value.code,
            message: value.message,
        }
    }
}

// Lets the client turn a decoded error body straight into its error type.
impl From<ApiError> for ApiException {
    fn from(value: ApiError) -> Self {
        Self {
            code: value.code,
            message: value.message,
        }
    }
}

/// Rejection reasons for a client-supplied sensor pose.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoseError {
    #[error("pose field `{field}` is not a finite number")]
    NotFinite { field: &'static str },
    #[error("quaternion component `{field}` = {value} is outside [-1, 1]")]
    ComponentOutOfRange { field: &'static str, value: f64 },
    #[error("orientation quaternion has norm {norm:.6}, expected 1")]
    NotUnitQuaternion { norm: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_use_snake_case_on_the_wire() {
        let body = serde_json::to_value(ApiError::new(ErrorCode::ProtocolSequence, "too early"))
            .expect("json");
        assert_eq!(body["code"], "protocol_sequence");

        let unknown = serde_json::from_str::<ErrorCode>("\"engine\"");
        assert!(unknown.is_err());
    }

    #[test]
    fn decoded_error_body_keeps_code_and_message() {
        let body: ApiError =
            serde_json::from_str(r#"{"code":"already_ended","message":"run is over"}"#)
                .expect("json");
        let err = ApiException::from(body);
        assert_eq!(err.code, ErrorCode::AlreadyEnded);
        assert_eq!(err.to_string(), "AlreadyEnded: run is over");
    }
}

use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
    pub examples: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
            examples: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_examples(mut self, examples: Value) -> Self {
        self.examples = Some(examples);
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.envelope()).unwrap_or(Value::Null)
    }

    fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.message.clone(),
                error_type: self.error_type.clone(),
                param: self.param.clone(),
                code: self.code.clone(),
                examples: self.examples.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    examples: Option<Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = self.envelope();
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failure classes of the request path. Every variant maps onto one HTTP
/// status and one `type` string in the error envelope.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{message}")]
    Validation {
        message: String,
        param: Option<String>,
        examples: Option<Value>,
    },
    #[error("downstream call failed: {0}")]
    Downstream(UpstreamCallError),
    #[error("stream interrupted: {0}")]
    Stream(UpstreamCallError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
            param: None,
            examples: None,
        }
    }

    pub fn invalid_param(param: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
            param: Some(param.into()),
            examples: None,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "invalid_request_error",
            GatewayError::Downstream(_) => "downstream_error",
            GatewayError::Stream(_) => "stream_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl From<UpstreamCallError> for GatewayError {
    fn from(err: UpstreamCallError) -> Self {
        GatewayError::Downstream(err)
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let error_type = err.error_type();
        match err {
            GatewayError::Validation {
                message,
                param,
                examples,
            } => {
                let mut app = AppError::new(StatusCode::BAD_REQUEST, "invalid_request", message)
                    .with_type(error_type);
                app.param = param;
                app.examples = examples;
                app
            }
            GatewayError::Downstream(inner) | GatewayError::Stream(inner) => {
                let code = match inner.kind {
                    UpstreamErrorKind::Timeout => "downstream_timeout".to_string(),
                    _ => inner
                        .code
                        .clone()
                        .unwrap_or_else(|| "downstream_error".to_string()),
                };
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, inner.message)
                    .with_type(error_type)
            }
            GatewayError::Internal(detail) => {
                tracing::error!("internal error: {detail}");
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error",
                )
                .with_type(error_type)
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        GatewayError::validation(rejection.body_text()).into()
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        GatewayError::validation(rejection.body_text()).into()
    }
}

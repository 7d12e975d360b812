use marcus_core::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Uniform response wrapper: every call answers with this shape, success or
/// not. `error_kind` is drawn from the core's closed kind set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl Envelope {
    pub fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                ok: true,
                data: Some(value),
                error_kind: None,
                message: None,
                retryable: None,
            },
            Err(err) => Self::error(&CoreError::PersistenceFailure(format!(
                "response encoding failed: {err}"
            ))),
        }
    }

    pub fn error(err: &CoreError) -> Self {
        Self {
            ok: false,
            data: None,
            error_kind: Some(err.kind_code().to_string()),
            message: Some(err.to_string()),
            retryable: Some(err.retryable()),
        }
    }
}

impl From<Result<Value, CoreError>> for Envelope {
    fn from(result: Result<Value, CoreError>) -> Self {
        match result {
            Ok(value) => Envelope::ok(value),
            Err(err) => Envelope::error(&err),
        }
    }
}

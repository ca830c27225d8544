use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("{method} failed: {message}")]
    MethodFailed { method: String, message: String },
    #[error("{method} dropped its reply without answering")]
    ReplyDropped { method: String },
    #[error("native bridge requested but no host is attached")]
    HostUnavailable,
}

impl BridgeError {
    pub fn failed(method: &str, message: impl Into<String>) -> Self {
        Self::MethodFailed {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event payload: {0}")]
    Wire(#[from] prost::DecodeError),
    #[error("event for task {0} carries no payload")]
    MissingPayload(u32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

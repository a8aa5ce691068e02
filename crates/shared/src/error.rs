use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the REST backend. Most routes answer
/// `{"error": "..."}`; a few older ones use `{"message": "..."}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    pub fn into_message(self, status: u16) -> String {
        self.error
            .or(self.message)
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("Server error: {status}"))
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message} (status {status})")]
pub struct ApiException {
    pub status: u16,
    pub message: String,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn from_body(status: u16, body: ApiErrorBody) -> Self {
        Self::new(status, body.into_message(status))
    }
}

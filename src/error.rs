use serde::ser::Serializer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] simd_json::Error),
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Failure on the pull path. Every variant names the symbol set that was
/// requested so the caller can decide whether to resubmit the key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("snapshot request for [{symbols}] failed: {message}")]
    Transport { symbols: String, message: String },
    #[error("snapshot request for [{symbols}] returned status {status}")]
    Status { symbols: String, status: u16 },
    #[error("snapshot response for [{symbols}] could not be decoded: {message}")]
    Decode { symbols: String, message: String },
}

impl FetchError {
    pub fn requested_symbols(&self) -> &str {
        match self {
            Self::Transport { symbols, .. }
            | Self::Status { symbols, .. }
            | Self::Decode { symbols, .. } => symbols,
        }
    }
}

impl serde::Serialize for FetchError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Connection-level failure of the streaming source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("websocket connect error: {0}")]
    Connect(String),
    #[error("subscription handshake failed: {0}")]
    Handshake(String),
    #[error("websocket transport error: {0}")]
    Transport(String),
    #[error("stream rejected the subscription: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Failure to decode a single inbound frame. Never leaves the connector.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] simd_json::Error),
    #[error("unexpected frame shape: {0}")]
    Shape(String),
    #[error("field {index}: {reason}")]
    Field { index: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_keeps_requested_symbols() {
        let error = FetchError::Status {
            symbols: "AAPL,MSFT".to_string(),
            status: 503,
        };

        assert_eq!(error.requested_symbols(), "AAPL,MSFT");
        assert!(error.to_string().contains("503"));
        assert!(error.to_string().contains("AAPL,MSFT"));
    }

    #[test]
    fn app_error_serializes_as_display_string() {
        let error = AppError::InvalidArgument("debounceMs out of range".to_string());
        let encoded = simd_json::serde::to_string(&error).expect("error should serialize");

        assert_eq!(encoded, "\"invalid argument: debounceMs out of range\"");
    }
}

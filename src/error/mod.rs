use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope must be a json object, got {0}")]
    NotAnObject(&'static str),
    #[error("envelope is missing the `action` field")]
    MissingAction,
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error("connection closed before the exchange completed")]
    ConnectionClosed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("remote failure {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("browser instance is closed")]
    BrowserClosed,
    #[error("malformed reply: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} value is required")]
    Missing(&'static str),
    #[error("embed_url must start with the http or ws protocol, got `{0}`")]
    EmbedUrlScheme(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid target url: {0}")]
    Url(String),
    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

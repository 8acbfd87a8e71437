use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid rewrite rule '{pattern}': {reason}")]
    Rewrite { pattern: String, reason: String },

    /// The origin could not be reached on the ordinary forwarding path.
    #[error("remote {target} unreachable, could not forward: {message}")]
    Upstream { target: String, message: String },

    /// Dial, header replay or handshake failure on the tunnel path.
    #[error("proxy raw, {message}, url={target}")]
    Tunnel { target: String, message: String },

    #[error("Connection hijack error: {0}")]
    Hijack(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ProxyError {
    /// Status the client sees when this error terminates a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Upstream { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Tunnel { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn upstream(target: impl Into<String>, message: impl ToString) -> Self {
        ProxyError::Upstream {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn tunnel(target: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::Tunnel {
            target: target.into(),
            message: message.into(),
        }
    }
}

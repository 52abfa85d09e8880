//! Error type shared by the client, the workflow and the CLI.

use reqwest::StatusCode;

/// Errors raised while talking to a sandbox or preparing a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure before a response arrived.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The sandbox service answered with a non-success status.
    #[error("sandbox service returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// A response body or encoded payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Missing or invalid operator configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Decode(format!("base64: {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

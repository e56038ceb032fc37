//! Error types and result definitions for the ewelink crate.
//! Includes the eWeLink cloud error codes and conversions from IO/JSON/HTTP errors.

use thiserror::Error;

/// Represents all possible errors surfaced by the registry and its transports.
///
/// Device-level failures (a device answering with a non-zero `error`) are not
/// errors: they come back as [`Outcome`](crate::protocol::Outcome) values.
#[derive(Error, Debug, Clone)]
pub enum EwelinkError {
    /// Standard IO error (filesystem, sockets)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// HTTP request failed before a usable reply arrived
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket transport failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Login rejected; the user must re-enter credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The cloud API answered with a non-zero error code
    #[error("Cloud error {code}: {message}")]
    Cloud { code: i64, message: String },

    /// Failed to decrypt a LAN payload (wrong devicekey or corrupt data)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a LAN payload
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The payload was malformed or missing required fields
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Request timed out
    #[error("Timeout waiting for reply")]
    Timeout,

    /// Transport is not connected
    #[error("Transport offline")]
    Offline,

    /// Device ID not found in the registry
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// A dispatcher handler reported a failure
    #[error("Handler error: {0}")]
    Handler(String),
}

/// A specialized Result type for ewelink operations.
pub type Result<T> = std::result::Result<T, EwelinkError>;

impl From<std::io::Error> for EwelinkError {
    fn from(err: std::io::Error) -> Self {
        EwelinkError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EwelinkError {
    fn from(err: serde_json::Error) -> Self {
        EwelinkError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for EwelinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EwelinkError::Timeout
        } else {
            EwelinkError::Http(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EwelinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        EwelinkError::WebSocket(err.to_string())
    }
}

impl EwelinkError {
    /// Builds a [`EwelinkError::Cloud`] from a reply's `error` and optional `msg`.
    pub fn cloud(code: i64, message: Option<&str>) -> Self {
        EwelinkError::Cloud {
            code,
            message: message.unwrap_or(get_error_message(code)).to_string(),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            EwelinkError::Cloud { code, .. } => *code,
            EwelinkError::Auth(_) => ERR_AUTH,
            EwelinkError::Timeout => ERR_TIMEOUT,
            EwelinkError::Offline => ERR_OFFLINE,
            EwelinkError::DeviceNotFound(_) => ERR_NOT_FOUND,
            EwelinkError::Json(_) | EwelinkError::InvalidPayload(_) => ERR_PARAMS,
            EwelinkError::DecryptionFailed | EwelinkError::EncryptionFailed => ERR_FORBIDDEN,
            EwelinkError::Io(_)
            | EwelinkError::Http(_)
            | EwelinkError::WebSocket(_)
            | EwelinkError::Config(_)
            | EwelinkError::Handler(_) => ERR_SERVER,
        }
    }
}

// eWeLink v2 API error codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Success",
    ERR_PARAMS = 400 => "Parameter error",
    ERR_PASSWORD = 401 => "Wrong account or password",
    ERR_INACTIVE = 402 => "Account not activated",
    ERR_FORBIDDEN = 403 => "Forbidden",
    ERR_NOT_FOUND = 404 => "Device does not exist",
    ERR_AUTH = 406 => "Authentication failed, token expired",
    ERR_SERVER = 500 => "Server internal error",
    ERR_OFFLINE = 503 => "Device offline",
    ERR_TIMEOUT = 504 => "Device timeout",
    ERR_REGION = 10004 => "Wrong region",
}

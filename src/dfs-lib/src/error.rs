use reqwest::StatusCode;
use thiserror::Error;

/// The single error sum type surfaced by every operation in the system.
#[derive(Error, Debug)]
pub enum DfsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),
    #[error("storage full: {0}")]
    StorageFull(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl DfsError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => DfsError::NotFound(info),
            StatusCode::CONFLICT => DfsError::AlreadyExists(info),
            StatusCode::BAD_REQUEST => DfsError::InvalidArgument(info),
            StatusCode::UNPROCESSABLE_ENTITY => DfsError::IntegrityFailure(info),
            StatusCode::INSUFFICIENT_STORAGE => DfsError::StorageFull(info),
            StatusCode::SERVICE_UNAVAILABLE => DfsError::Unavailable(info),
            _ => DfsError::Transient(format!("HTTP {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DfsError::NotFound(_))
    }

    /// Rebuild a typed error from the `message` half of a `{success: false,
    /// message}` envelope, matching the `Display` prefixes above.
    pub fn from_message(message: String) -> Self {
        let rules: [(&str, fn(String) -> DfsError); 8] = [
            ("invalid argument: ", DfsError::InvalidArgument),
            ("not found: ", DfsError::NotFound),
            ("already exists: ", DfsError::AlreadyExists),
            ("unavailable: ", DfsError::Unavailable),
            ("integrity failure: ", DfsError::IntegrityFailure),
            ("storage full: ", DfsError::StorageFull),
            ("transient error: ", DfsError::Transient),
            ("fatal error: ", DfsError::Fatal),
        ];
        for (prefix, ctor) in rules {
            if let Some(rest) = message.strip_prefix(prefix) {
                return ctor(rest.to_string());
            }
        }
        DfsError::Transient(message)
    }

    /// Whether a caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DfsError::Transient(_))
    }
}

pub type DfsResult<T> = std::result::Result<T, DfsError>;

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DfsError::NotFound(err.to_string()),
            _ => DfsError::Transient(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for DfsError {
    fn from(err: reqwest::Error) -> Self {
        DfsError::Transient(err.to_string())
    }
}

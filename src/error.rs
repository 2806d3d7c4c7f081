use std::fmt;
use thiserror::Error;

/// Why a backup export or import was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupErrorKind {
    DecryptionFailed,
    InvalidFormat,
    ImportFailed,
}

impl fmt::Display for BackupErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupErrorKind::DecryptionFailed => "decryption failed",
            BackupErrorKind::InvalidFormat => "invalid format",
            BackupErrorKind::ImportFailed => "import failed",
        })
    }
}

#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid invite: {0}")]
    InvalidInvite(String),

    #[error("Backup {kind}: {message}")]
    Backup { kind: BackupErrorKind, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuorumError {
    pub fn backup(kind: BackupErrorKind, message: impl Into<String>) -> Self {
        QuorumError::Backup {
            kind,
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if it came from the directory API.
    pub fn status(&self) -> Option<u16> {
        match self {
            QuorumError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QuorumError::NotFound(_)) || self.status() == Some(404)
    }
}

impl From<reqwest::Error> for QuorumError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            QuorumError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            QuorumError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            QuorumError::Network(e.to_string())
        }
    }
}

/// Reduce an error to one of the user-safe categories written to `sendError`.
///
/// Internal details never leave this function.
pub fn sanitize_error(err: &QuorumError) -> String {
    match err {
        QuorumError::Timeout(_) => "Connection timed out".to_string(),
        QuorumError::Network(_) | QuorumError::Api { .. } => "Network error".to_string(),
        QuorumError::Crypto(_) => "Encryption error".to_string(),
        other => {
            let text = other.to_string().to_lowercase();
            if text.contains("timeout") || text.contains("timed out") {
                "Connection timed out".to_string()
            } else if text.contains("network") || text.contains("fetch") {
                "Network error".to_string()
            } else if text.contains("encrypt") || text.contains("ratchet") {
                "Encryption error".to_string()
            } else {
                "Failed to send message".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(QuorumError::Network("connection refused".into()), "Network error")]
    #[case(QuorumError::Api { status: 502, message: "bad gateway".into() }, "Network error")]
    #[case(QuorumError::Timeout("10s".into()), "Connection timed out")]
    #[case(QuorumError::Crypto("bad mac".into()), "Encryption error")]
    #[case(QuorumError::Storage("fetch failed".into()), "Network error")]
    #[case(QuorumError::Storage("disk full at /var/lib".into()), "Failed to send message")]
    #[case(QuorumError::Queue("ratchet state missing".into()), "Encryption error")]
    fn test_sanitize_error(#[case] err: QuorumError, #[case] expected: &str) {
        assert_eq!(sanitize_error(&err), expected);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(QuorumError::NotFound("space".into()).is_not_found());
        assert!(QuorumError::Api {
            status: 404,
            message: "gone".into()
        }
        .is_not_found());
        assert!(!QuorumError::Network("x".into()).is_not_found());
    }
}

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Dead link on {host}: {reason}")]
    DeadLink { host: String, reason: String },
    #[error("Transient network error: {0}")]
    TransientNetwork(String),
    #[error("Download interrupted: {0}")]
    Interrupted(String),
    #[error("Extraction failed: {0}")]
    Extraction(String),
    #[error("Extraction already running for {0}")]
    ExtractionInProgress(String),
    #[error("Registry corruption: {0}")]
    RegistryCorruption(String),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
}

impl LauncherError {
    pub fn dead_link(host: &str, reason: impl Into<String>) -> Self {
        Self::DeadLink {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_dead_link(&self) -> bool {
        matches!(self, Self::DeadLink { .. })
    }

    /// Transport level failures that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) => true,
            Self::Network(err) => err.is_timeout() || err.is_connect() || err.is_body(),
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Reason shown next to a failed download or install.
    pub fn user_message(&self) -> String {
        match self {
            Self::DeadLink { host, .. } => format!(
                "This file is no longer available on {}. If no other host has it, please report the dead link.",
                host_label(host)
            ),
            Self::TransientNetwork(_) | Self::Network(_) => {
                "Temporary network issue. Check your connection and retry.".to_string()
            }
            Self::Interrupted(_) => {
                "Download was interrupted when the app closed. Retry to continue.".to_string()
            }
            Self::Extraction(reason) => format!(
                "Extraction failed ({}). Downloaded files were kept, you can retry the install.",
                reason
            ),
            Self::ExtractionInProgress(_) => "This game is already being installed.".to_string(),
            Self::Cancelled => "Cancelled".to_string(),
            other => other.to_string(),
        }
    }
}

pub fn host_label(host: &str) -> String {
    let mut chars = host.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_link_and_transient_messages_differ() {
        let dead = LauncherError::dead_link("pixeldrain", "HTTP 404");
        let transient = LauncherError::TransientNetwork("connection reset".to_string());

        assert!(dead.user_message().contains("Pixeldrain"));
        assert!(dead.user_message().contains("report"));
        assert!(transient.user_message().contains("retry"));
        assert!(!dead.is_transient());
        assert!(transient.is_transient());
    }
}

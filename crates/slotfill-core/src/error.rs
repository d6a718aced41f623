use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building vocabularies or preparing examples.
#[derive(Debug, Error)]
pub enum SlotFillError {
    /// A vocabulary or argument is missing, empty or inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A resource file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file that could not be read.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A resource file is not valid JSON for its expected shape.
    #[error("malformed JSON in {path}: {source}")]
    Json {
        /// The offending file.
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// An example does not fit the vocabulary it is processed with.
    #[error("invalid example: {0}")]
    Data(String),
}

impl SlotFillError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SlotFillError::Configuration(msg.into())
    }

    pub(crate) fn data(msg: impl Into<String>) -> Self {
        SlotFillError::Data(msg.into())
    }

    /// Whether this error comes from configuration rather than data.
    ///
    /// Only vocabulary files are read here, so an unreadable file counts.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, SlotFillError::Data(_))
    }
}

/// Result type alias for slot filling operations.
pub type Result<T> = std::result::Result<T, SlotFillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = SlotFillError::config("role map is empty");
        assert_eq!(err.to_string(), "configuration error: role map is empty");

        let err = SlotFillError::Io {
            path: PathBuf::from("data/role2id.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("data/role2id.json"));
        assert!(err.is_configuration());

        assert!(!SlotFillError::data("span out of range").is_configuration());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SlotFillError>();
    }
}

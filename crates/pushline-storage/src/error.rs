//! Storage error types shared by all backends.

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind ("topic", "subscriber", ...).
        kind: String,
        /// Identifier that was looked up.
        id: String,
    },

    /// A uniqueness constraint was violated (duplicate topic name, ...).
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: String, id: String },

    /// Failed to reach the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError { message: String },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn already_exists(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StorageError::not_found("topic", "temp-alerts");
        assert_eq!(err.to_string(), "topic not found: temp-alerts");
        assert!(err.is_not_found());

        let err = StorageError::already_exists("topic", "temp-alerts");
        assert!(err.is_already_exists());
    }
}

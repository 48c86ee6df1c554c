use thiserror::Error;

/// Main error type for legion with structured error handling.
///
/// Variants map one-to-one onto the failure kinds the orchestrator
/// distinguishes: SDK subprocess failures, session state violations,
/// storage faults, transport faults, input validation, and resource
/// exhaustion. Each carries enough context to produce a user-visible
/// message without re-inspecting the source chain.
#[derive(Error, Debug)]
pub enum LegionError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Agent SDK failure (startup, streaming, interrupt)
    #[error("SDK error [{session_id}]: {message}")]
    Sdk {
        session_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Session management error (invalid transition, cascade anomaly)
    #[error("Session error [{session_id}]: {message}")]
    Session {
        session_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Persistent storage error
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transport/network communication error
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid parameters, non-unique names, caps exceeded
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Timeouts and resource exhaustion
    #[error("System error: {message}")]
    System {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration related error
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Generic error for cases not covered above
    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Severity classification used when surfacing errors to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl LegionError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a session-scoped failure without a source chain.
    pub fn session(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Session {
            session_id: session_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for an SDK-scoped failure without a source chain.
    pub fn sdk(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sdk {
            session_id: session_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a storage failure without a source chain.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Map the error kind onto a severity level.
    ///
    /// Validation problems are routine; storage/SDK/network faults are
    /// recoverable but noteworthy; session state violations are high
    /// because they indicate an invariant break; resource exhaustion is
    /// critical.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Validation { .. } => ErrorSeverity::Low,
            Self::Io(_) | Self::SerdeJson(_) => ErrorSeverity::Medium,
            Self::Storage { .. } | Self::Sdk { .. } | Self::Network { .. } => ErrorSeverity::Medium,
            Self::Session { .. } | Self::Configuration { .. } => ErrorSeverity::High,
            Self::System { .. } => ErrorSeverity::Critical,
            Self::Other { .. } => ErrorSeverity::Medium,
        }
    }
}

impl From<String> for LegionError {
    fn from(error: String) -> Self {
        Self::Other {
            message: error,
            source: None,
        }
    }
}

impl From<&str> for LegionError {
    fn from(error: &str) -> Self {
        Self::Other {
            message: error.to_string(),
            source: None,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, LegionError>;

use thiserror::Error;

/// Main error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ledger RPC error: {0}")]
    Rpc(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Decryption oracle errors
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    // Game errors
    #[error("Address {address} is not a participant in game {game_id}")]
    NotParticipant { game_id: u64, address: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Crypto/signing errors
    #[error("Wallet error: {0}")]
    Wallet(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    /// Whether the scheduler may re-attempt the step that produced this error.
    ///
    /// Identity violations, bad configuration and wallet problems never heal on
    /// their own; everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::NotParticipant { .. }
            | AgentError::Config(_)
            | AgentError::Validation(_)
            | AgentError::Wallet(_) => false,
            AgentError::Oracle(e) => e.kind != OracleErrorKind::Unauthorized,
            _ => true,
        }
    }
}

/// Result type alias for AgentError
pub type Result<T> = std::result::Result<T, AgentError>;

/// Stable category for decryption-oracle failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OracleErrorKind {
    /// Ciphertext not yet available to the oracle (handle too fresh)
    NotReady,
    RateLimited,
    Unauthorized,
    /// Oracle refused the request (unknown handle, ACL denied)
    Rejected,
    /// Transport failure or 5xx
    Unavailable,
    /// Response could not be parsed
    Malformed,
}

impl OracleErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OracleErrorKind::NotReady => "not_ready",
            OracleErrorKind::RateLimited => "rate_limited",
            OracleErrorKind::Unauthorized => "unauthorized",
            OracleErrorKind::Rejected => "rejected",
            OracleErrorKind::Unavailable => "unavailable",
            OracleErrorKind::Malformed => "malformed",
        }
    }

    /// Kinds worth retrying inside a single oracle call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleErrorKind::NotReady | OracleErrorKind::RateLimited | OracleErrorKind::Unavailable
        )
    }

    /// Map an HTTP status returned by the relayer to a category.
    pub fn from_status(status: u16) -> Self {
        match status {
            202 | 404 | 425 => OracleErrorKind::NotReady,
            429 => OracleErrorKind::RateLimited,
            401 | 403 => OracleErrorKind::Unauthorized,
            400 | 409 | 422 => OracleErrorKind::Rejected,
            _ => OracleErrorKind::Unavailable,
        }
    }
}

impl std::fmt::Display for OracleErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decryption / input-encryption failure with a stable category
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct OracleError {
    pub kind: OracleErrorKind,
    pub message: String,
}

impl OracleError {
    pub fn new(kind: OracleErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

use thiserror::Error;

/// Top-level error type for Harvest agent operations.
#[derive(Debug, Error)]
pub enum HarvestError {
    // --- Bootstrap errors (the process refuses to start) ---
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Coordinator API error: {0}")]
    Api(String),

    // --- Steady-state errors (logged, next cycle retries) ---
    #[error("Silo error: {0}")]
    Silo(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Task chain error: {0}")]
    Chain(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl HarvestError {
    /// Whether this error is only legal during bootstrap. Nothing in the
    /// steady-state loops may exit the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Api(_))
    }
}

/// Result type alias for Harvest agent operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

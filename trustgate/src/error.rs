// trustgate/src/error.rs
//
// Error taxonomy. Store errors are transient infrastructure failures; quota
// rejections are ordinary outcomes the caller turns into a user-facing reply.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by the downstream signal generator.
#[derive(Debug, thiserror::Error)]
#[error("signal generator failed: {0}")]
pub struct SignalError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Rejections and failures of the signal-generation gate. The `Display` text
/// is what the user sees.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Daily limit reached ({limit} signals per day). Credits reset at midnight.")]
    LimitReached { limit: u32 },

    #[error("Cooldown active, {minutes_remaining} minutes remaining")]
    CooldownActive { minutes_remaining: i64 },

    #[error("Another request for this account was processed first, please try again")]
    RaceLost,

    #[error("Account not found: {0}")]
    UnknownUser(String),

    #[error("Signal generation is temporarily unavailable, please try again later")]
    Unavailable(#[source] StoreError),

    #[error("Signal generation failed, please try again")]
    GenerationFailed(#[source] SignalError),
}

impl GenerationError {
    /// HTTP status the handler should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Self::LimitReached { .. } | Self::CooldownActive { .. } | Self::RaceLost => 429,
            Self::UnknownUser(_) => 404,
            Self::Unavailable(_) => 503,
            Self::GenerationFailed(_) => 502,
        }
    }
}

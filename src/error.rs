use thiserror::Error;

/// Errors surfaced to the caller of the sync engine.
///
/// Malformed inbound envelopes never show up here: the router logs and
/// drops them.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected to the message broker")]
    NotConnected,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("History service error: {0}")]
    History(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Transport failures heal through the reconnect loop; everything else
    /// needs the user's attention.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

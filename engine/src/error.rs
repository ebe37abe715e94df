use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to launch engine {path}: {reason}")]
    Launch { path: String, reason: String },
    #[error("Engine did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Engine process exited unexpectedly")]
    Crashed,
    #[error("Engine returned no move")]
    NoMove,
    #[error("Engine is not running")]
    NotRunning,
    #[error("Engine protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    pub(crate) fn launch(path: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::Launch {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Failures after which the process should be replaced with a fresh one.
    pub fn needs_restart(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Crashed | Self::NotRunning | Self::Protocol(_)
        )
    }
}

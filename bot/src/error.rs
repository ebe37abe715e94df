use engine::EngineError;

use crate::service::ServiceError;

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Move rejected: {0}")]
    InvalidMove(String),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Whether the bot keeps running after this error. Only bad credentials,
    /// bad configuration and internal faults stop it.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Engine(_) | Self::Protocol(_) | Self::InvalidMove(_) => true,
            Self::Auth(_) | Self::Config(_) | Self::Internal(_) => false,
        }
    }
}

impl From<ServiceError> for BotError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Auth(msg) => Self::Auth(msg),
            ServiceError::InvalidMove(msg) => Self::InvalidMove(msg),
            ServiceError::Protocol(msg) => Self::Protocol(msg),
            other => Self::Network(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name}: minimum {min_ms}ms exceeds maximum {max_ms}ms")]
    InvalidRange {
        name: &'static str,
        min_ms: u64,
        max_ms: u64,
    },
    #[error("safety fraction must be in (0, 1], got {0}")]
    SafetyFraction(f64),
    #[error("no engine executable configured")]
    MissingEnginePath,
    #[error("invalid time control '{0}'")]
    InvalidTimeControl(String),
    #[error("time control '{0}' is too fast for board play")]
    TooFast(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(BotError::Network("reset".into()).is_recoverable());
        assert!(BotError::Engine(EngineError::Crashed).is_recoverable());
        assert!(BotError::InvalidMove("e2e5".into()).is_recoverable());
        assert!(!BotError::Auth("bad token".into()).is_recoverable());
        assert!(!BotError::Config(ConfigError::MissingEnginePath).is_recoverable());
    }

    #[test]
    fn test_from_service_error() {
        assert!(matches!(
            BotError::from(ServiceError::Auth("401".into())),
            BotError::Auth(_)
        ));
        assert!(matches!(
            BotError::from(ServiceError::Network("eof".into())),
            BotError::Network(_)
        ));
        assert!(matches!(
            BotError::from(ServiceError::Http {
                status: 502,
                body: String::new()
            }),
            BotError::Network(_)
        ));
    }
}

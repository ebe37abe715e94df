//! Bot configuration.
//!
//! Every section has defaults, so a config file only needs the fields it
//! changes. Call [`BotConfig::validate`] before handing the config to the
//! supervisor.

use std::time::Duration;

use engine::{EngineSpec, EngineTimeouts};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::service::{SeekColor, SeekRequest, TimeControl};
use crate::timing::TimingConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub engine: PlayingEngineConfig,
    pub evaluation: EvaluationConfig,
    pub timing: TimingConfig,
    pub seek: SeekConfig,
    pub challenges: ChallengeConfig,
    pub reconnect: ReconnectConfig,
    pub engine_timeouts: EngineTimeouts,
    /// Keep the displayed position on the newest ply while the viewer has
    /// not navigated away from it.
    pub follow_live: bool,
    pub between_games_delay_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            engine: PlayingEngineConfig::default(),
            evaluation: EvaluationConfig::default(),
            timing: TimingConfig::default(),
            seek: SeekConfig::default(),
            challenges: ChallengeConfig::default(),
            reconnect: ReconnectConfig::default(),
            engine_timeouts: EngineTimeouts::default(),
            follow_live: true,
            between_games_delay_ms: 2_000,
        }
    }
}

impl BotConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.spec.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingEnginePath);
        }
        self.timing.validate()?;
        if self.evaluation.cadence_ms == 0 {
            return Err(ConfigError::Zero("evaluation.cadence_ms"));
        }
        if self.reconnect.idle_timeout_ms == 0 {
            return Err(ConfigError::Zero("reconnect.idle_timeout_ms"));
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            return Err(ConfigError::InvalidRange {
                name: "reconnect backoff",
                min_ms: self.reconnect.initial_backoff_ms,
                max_ms: self.reconnect.max_backoff_ms,
            });
        }
        Ok(())
    }

    /// The evaluation engine: its own spec when configured, otherwise a
    /// second process of the playing engine.
    pub fn evaluation_spec(&self) -> &EngineSpec {
        self.evaluation.engine.as_ref().unwrap_or(&self.engine.spec)
    }

    pub fn seek_request(&self) -> SeekRequest {
        SeekRequest {
            time_control: self.seek.time_control,
            rated: self.seek.rated,
            color: self.seek.color,
            variant: self.seek.variant.clone(),
        }
    }

    pub fn between_games_delay(&self) -> Duration {
        Duration::from_millis(self.between_games_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayingEngineConfig {
    #[serde(flatten)]
    pub spec: EngineSpec,
    /// Ask for a one-node search instead of a timed one, for engines that
    /// play straight from their policy network.
    pub single_node: bool,
    /// Launch a new process for every game and stop it when the game ends.
    pub fresh_process_per_game: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub enabled: bool,
    pub engine: Option<EngineSpec>,
    /// How often the displayed position is checked for changes.
    pub cadence_ms: u64,
    /// Minimum spacing of partial results during one search.
    pub publish_interval_ms: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine: None,
            cadence_ms: 200,
            publish_interval_ms: 500,
        }
    }
}

impl EvaluationConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeekConfig {
    pub time_control: TimeControl,
    pub rated: bool,
    pub color: SeekColor,
    pub variant: String,
    /// Wait this long for a game to start after a seek closes before
    /// seeking again.
    pub restart_after_ms: u64,
}

impl Default for SeekConfig {
    fn default() -> Self {
        Self {
            time_control: TimeControl::default(),
            rated: false,
            color: SeekColor::Random,
            variant: "standard".into(),
            restart_after_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePolicy {
    #[default]
    Decline,
    Accept,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub policy: ChallengePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// A stream silent for this long, keepalives included, is considered
    /// dead.
    pub idle_timeout_ms: u64,
    pub game_rejoin_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            idle_timeout_ms: 60_000,
            game_rejoin_attempts: 3,
        }
    }
}

impl ReconnectConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.initial_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            next: Duration::from_millis(self.initial_backoff_ms),
        }
    }
}

/// Doubling delay between reconnect attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    /// Delay to wait now; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TimingRange;

    fn valid() -> BotConfig {
        let mut config = BotConfig::default();
        config.engine.spec.path = "/usr/bin/stockfish".into();
        config
    }

    #[test]
    fn test_defaults() {
        let config = BotConfig::default();
        assert_eq!(config.between_games_delay_ms, 2_000);
        assert_eq!(config.reconnect.idle_timeout_ms, 60_000);
        assert_eq!(config.engine_timeouts.handshake_ms, 10_000);
        assert_eq!(config.timing.opening_plies, 10);
        assert!(!config.evaluation.enabled);
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_engine_path() {
        assert!(matches!(
            BotConfig::default().validate(),
            Err(ConfigError::MissingEnginePath)
        ));
    }

    #[test]
    fn test_rejects_inverted_range() {
        let mut config = valid();
        config.timing.later = TimingRange {
            min_ms: 9_000,
            max_ms: 3_000,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_partial_json() {
        let config = BotConfig::from_json(
            r#"{
                "engine": { "path": "/opt/maia/lc0", "args": ["--weights=maia-1500.pb.gz"], "single_node": true },
                "seek": { "time_control": "15+10", "rated": true },
                "challenges": { "policy": "accept" }
            }"#,
        )
        .unwrap();
        assert!(config.engine.single_node);
        assert_eq!(config.engine.spec.args.len(), 1);
        assert_eq!(config.seek.time_control, TimeControl::realtime(15, 10));
        assert_eq!(config.challenges.policy, ChallengePolicy::Accept);
        assert_eq!(config.seek.variant, "standard");
        assert_eq!(config.evaluation_spec().path, config.engine.spec.path);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = ReconnectConfig::default().backoff();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }
}

use std::path::{Path, PathBuf};

use crate::car::CarConfig;
use crate::dqn::AgentConfig;
use crate::error::ConfigError;
use crate::evaluator::EvaluatorConfig;
use crate::game::SessionConfig;
use crate::log;
use crate::train::TrainingConfig;

/// Where assets and learned state live.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub track: PathBuf,
    pub lines: PathBuf,
    pub model: PathBuf,
    pub replay_cache: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            track: PathBuf::from("assets/track-1.trk"),
            lines: PathBuf::from("assets/track-1.lns"),
            model: PathBuf::from("models/model.json"),
            replay_cache: PathBuf::from("models/replay.db"),
        }
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub car: CarConfig,
    pub evaluator: EvaluatorConfig,
    pub agent: AgentConfig,
    pub training: TrainingConfig,
    pub session: SessionConfig,
    pub paths: PathsConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            log::warn(&format!("config file '{}' not found, using defaults", path.display()));
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.agent;
        if !(0.0..=1.0).contains(&a.gamma) {
            return Err(ConfigError::Validation("agent.gamma must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&a.epsilon) {
            return Err(ConfigError::Validation("agent.epsilon must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&a.epsilon_min) {
            return Err(ConfigError::Validation("agent.epsilon_min must be in [0, 1]".into()));
        }
        if a.epsilon_min > a.epsilon {
            return Err(ConfigError::Validation("agent.epsilon_min must be <= agent.epsilon".into()));
        }
        if !(a.epsilon_decay > 0.0 && a.epsilon_decay <= 1.0) {
            return Err(ConfigError::Validation("agent.epsilon_decay must be in (0, 1]".into()));
        }
        if a.learning_rate <= 0.0 {
            return Err(ConfigError::Validation("agent.learning_rate must be > 0".into()));
        }
        if a.regulation_rate < 0.0 {
            return Err(ConfigError::Validation("agent.regulation_rate must be >= 0".into()));
        }
        if a.accepted_sensors == 0 {
            return Err(ConfigError::Validation("agent.accepted_sensors must be >= 1".into()));
        }
        if a.output_per_hidden == 0 {
            return Err(ConfigError::Validation("agent.output_per_hidden must be >= 1".into()));
        }
        if a.cache_capacity == Some(0) {
            return Err(ConfigError::Validation("agent.cache_capacity must be > 0 when set".into()));
        }

        let c = &self.car;
        if c.width <= 0.0 || c.height <= 0.0 {
            return Err(ConfigError::Validation("car.width and car.height must be > 0".into()));
        }
        if c.max_speed <= 0.0 {
            return Err(ConfigError::Validation("car.max_speed must be > 0".into()));
        }
        if c.min_speed < 0.0 || c.min_speed > c.max_speed {
            return Err(ConfigError::Validation("car.min_speed must be in [0, car.max_speed]".into()));
        }
        if c.max_turn_rate <= 0.0 || c.max_acceleration <= 0.0 {
            return Err(ConfigError::Validation(
                "car.max_turn_rate and car.max_acceleration must be > 0".into(),
            ));
        }
        if c.sensor_range <= 0.0 {
            return Err(ConfigError::Validation("car.sensor_range must be > 0".into()));
        }

        let e = &self.evaluator;
        if !e.checkpoint_reward.is_finite() {
            return Err(ConfigError::Validation("evaluator.checkpoint_reward must be finite".into()));
        }
        if !(e.stall_timeout.is_finite() && e.stall_timeout > 0.0) {
            return Err(ConfigError::Validation("evaluator.stall_timeout must be finite and > 0".into()));
        }
        if self.training.batch_size == 0 {
            return Err(ConfigError::Validation("training.batch_size must be > 0".into()));
        }
        if self.training.epochs == 0 {
            return Err(ConfigError::Validation("training.epochs must be > 0".into()));
        }

        let s = &self.session;
        if s.train_tick_hz <= 0.0 || s.play_tick_hz <= 0.0 {
            return Err(ConfigError::Validation("session tick rates must be > 0".into()));
        }
        if !s.crash_penalty.is_finite() {
            return Err(ConfigError::Validation("session.crash_penalty must be finite".into()));
        }
        if s.max_episode_seconds <= 0.0 {
            return Err(ConfigError::Validation("session.max_episode_seconds must be > 0".into()));
        }
        if !(s.shutdown_timeout_secs.is_finite() && s.shutdown_timeout_secs >= 0.0) {
            return Err(ConfigError::Validation("session.shutdown_timeout_secs must be finite and >= 0".into()));
        }
        Ok(())
    }
}

use std::path::PathBuf;

/// Malformed track or checkpoint-line assets. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum AssetFormatError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Syntax {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{path}: {reason}")]
    Invalid { path: PathBuf, reason: String },

    #[error("{0}: no checkpoint lines found")]
    Empty(PathBuf),
}

/// Model weights could not be restored. Callers fall back to fresh parameters.
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse model file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("model architecture mismatch: expected {expected}, found {found}")]
    ArchitectureMismatch { expected: String, found: String },
}

/// Failure inside a simulation tick. The session resets the episode and continues.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationFault {
    #[error("car state is not finite (position {x}, {y})")]
    NonFiniteState { x: f32, y: f32 },

    #[error("degenerate sensor ray from ({x}, {y})")]
    DegenerateRay { x: f32, y: f32 },

    #[error("state vector has length {found}, expected {expected}")]
    StateShape { expected: usize, found: usize },
}

/// Failures of the durable replay cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure inside a training pass. Logged and reported as "no loss".
#[derive(Debug, thiserror::Error)]
pub enum TrainingFault {
    #[error("replay cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("training produced a non-finite loss ({0})")]
    NonFiniteLoss(f32),

    #[error("training pass panicked: {0}")]
    Panicked(String),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_error_display() {
        let err = AssetFormatError::Syntax {
            path: PathBuf::from("track-1.trk"),
            line: 3,
            reason: "expected 2 numbers".into(),
        };
        assert_eq!(err.to_string(), "track-1.trk:3: expected 2 numbers");

        let err = AssetFormatError::Empty(PathBuf::from("track-1.lns"));
        assert_eq!(err.to_string(), "track-1.lns: no checkpoint lines found");
    }

    #[test]
    fn test_model_load_error_display() {
        let err = ModelLoadError::NotFound(PathBuf::from("model.json"));
        assert_eq!(err.to_string(), "model file not found: model.json");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("agent.gamma must be in [0, 1]".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: agent.gamma must be in [0, 1]"
        );
    }
}

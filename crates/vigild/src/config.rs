use std::path::PathBuf;
use std::time::Duration;

use vigil_core::LivenessPolicy;

use crate::service::ServiceSettings;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Length every stored and submitted descriptor must have.
    pub descriptor_dim: usize,
    /// Euclidean distance a probe must stay strictly below to match.
    pub match_threshold: f32,
    /// Recorded next to each stored descriptor.
    pub model_version: String,
    pub challenge_ttl_secs: u64,
    pub session_ttl_secs: u64,
    /// Evidence minimums re-checked on every verification.
    pub liveness: LivenessPolicy,
    /// Whether the daemon is running on the session bus (development mode).
    /// UID validation is skipped on the session bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("vigil");

        let db_path = std::env::var("VIGIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("descriptors.db"));

        let defaults = LivenessPolicy::default();
        let liveness = LivenessPolicy {
            min_blinks: env_parse("VIGIL_MIN_BLINKS", defaults.min_blinks),
            min_head_movements: env_parse("VIGIL_MIN_HEAD_MOVEMENTS", defaults.min_head_movements),
            min_duration_ms: env_parse("VIGIL_MIN_DURATION_MS", defaults.min_duration_ms),
            timeout_ms: env_parse("VIGIL_LIVENESS_TIMEOUT_MS", defaults.timeout_ms),
            ..defaults
        };

        Self {
            db_path,
            descriptor_dim: env_parse("VIGIL_DESCRIPTOR_DIM", 128),
            match_threshold: env_parse("VIGIL_MATCH_THRESHOLD", 0.6),
            model_version: std::env::var("VIGIL_MODEL_VERSION")
                .unwrap_or_else(|_| "unknown".to_string()),
            challenge_ttl_secs: env_parse("VIGIL_CHALLENGE_TTL_SECS", 300),
            session_ttl_secs: env_parse("VIGIL_SESSION_TTL_SECS", 3600),
            liveness,
            session_bus: std::env::var("VIGIL_SESSION_BUS").is_ok(),
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            match_threshold: self.match_threshold,
            model_version: self.model_version.clone(),
            liveness: self.liveness.clone(),
            challenge_ttl: Duration::from_secs(self.challenge_ttl_secs),
            session_ttl: Duration::from_secs(self.session_ttl_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

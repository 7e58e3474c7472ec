use rollcall_core::dedup::SessionKeyPolicy;
use rollcall_core::session::SessionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SYSTEM_CONFIG: &str = "/etc/rollcall/rollcalld.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may pick another.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which a face is accepted.
    pub match_threshold: f32,
    /// Usable samples needed to commit an enrollment.
    pub min_enroll_samples: usize,
    /// Frames captured per camera enrollment.
    pub frames_per_enroll: usize,
    /// Frames discarded while camera exposure settles.
    pub warmup_frames: usize,
    /// How long the recognition loop waits for a frame.
    pub frame_timeout_ms: u64,
    /// SQLite busy timeout.
    pub store_timeout_ms: u64,
    /// End a session after this many seconds without a face; 0 disables.
    pub idle_timeout_secs: u64,
    /// How attendance timestamps map to session keys.
    pub session_policy: SessionKeyPolicy,
    /// Apply CLAHE to captured frames before recognition.
    pub enhance_contrast: bool,
    /// Key file for encrypting stored encodings. Unset stores them in the clear.
    pub encryption_key_path: Option<PathBuf>,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: rollcall_core::default_model_dir(),
            db_path: default_data_dir().join("attendance.db"),
            match_threshold: rollcall_core::matcher::DEFAULT_THRESHOLD,
            min_enroll_samples: rollcall_core::enrollment::DEFAULT_MIN_SAMPLES,
            frames_per_enroll: 5,
            warmup_frames: 4,
            frame_timeout_ms: 2000,
            store_timeout_ms: 5000,
            idle_timeout_secs: 120,
            session_policy: SessionKeyPolicy::Daily,
            enhance_contrast: true,
            encryption_key_path: None,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load `ROLLCALL_CONFIG` (or the system file if present), then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var_os("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from(SYSTEM_CONFIG)).filter(|p| p.exists()));

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "config file loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `ROLLCALL_*` variables resolved through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_ENCRYPTION_KEY") {
            self.encryption_key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("ROLLCALL_SESSION_POLICY") {
            self.session_policy = v.parse().map_err(|e| invalid("ROLLCALL_SESSION_POLICY", e))?;
        }
        if let Some(v) = var("ROLLCALL_BUS") {
            self.bus = match v.trim() {
                "system" => BusKind::System,
                "session" => BusKind::Session,
                other => return Err(invalid("ROLLCALL_BUS", format!("{other:?} is not system or session"))),
            };
        }

        env_parse(&var, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width)?;
        env_parse(&var, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height)?;
        env_parse(&var, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold)?;
        env_parse(&var, "ROLLCALL_MIN_ENROLL_SAMPLES", &mut self.min_enroll_samples)?;
        env_parse(&var, "ROLLCALL_FRAMES_PER_ENROLL", &mut self.frames_per_enroll)?;
        env_parse(&var, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames)?;
        env_parse(&var, "ROLLCALL_FRAME_TIMEOUT_MS", &mut self.frame_timeout_ms)?;
        env_parse(&var, "ROLLCALL_STORE_TIMEOUT_MS", &mut self.store_timeout_ms)?;
        env_parse(&var, "ROLLCALL_IDLE_TIMEOUT_SECS", &mut self.idle_timeout_secs)?;
        if let Some(v) = var("ROLLCALL_ENHANCE_CONTRAST") {
            self.enhance_contrast = v != "0";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold <= 0.0 {
            return Err(invalid("match_threshold", format!("{} must be positive", self.match_threshold)));
        }
        if self.frame_timeout_ms == 0 {
            return Err(invalid("frame_timeout_ms", "must be positive"));
        }
        if self.min_enroll_samples == 0 {
            return Err(invalid("min_enroll_samples", "must be at least 1"));
        }
        if self.frames_per_enroll < self.min_enroll_samples {
            tracing::warn!(
                frames = self.frames_per_enroll,
                required = self.min_enroll_samples,
                "frames_per_enroll below min_enroll_samples, camera enrollment can never succeed"
            );
        }
        Ok(())
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            threshold: self.match_threshold,
            frame_timeout: self.frame_timeout(),
            idle_timeout: self.idle_timeout(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T>(var: &impl Fn(&str) -> Option<String>, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(v) = var(key) {
        *slot = v.trim().parse().map_err(|e: T::Err| invalid(key, e))?;
    }
    Ok(())
}

fn invalid(key: &'static str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.match_threshold, 1.0);
        assert_eq!(config.min_enroll_samples, 3);
        assert_eq!(config.session_policy, SessionKeyPolicy::Daily);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(120)));
        assert!(config.db_path.ends_with("rollcall/attendance.db"));
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_file_fields() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video2"
            match_threshold = 0.9
            idle_timeout_secs = 0
            bus = "system"
            session_policy = "window:3600"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.match_threshold, 0.9);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.session_policy, SessionKeyPolicy::Window { seconds: 3600 });
        assert_eq!(config.frames_per_enroll, 5, "unset fields keep defaults");
    }

    #[test]
    fn test_toml_policy_uses_the_env_syntax() {
        let config = Config::from_toml(r#"session_policy = "daily""#).unwrap();
        assert_eq!(config.session_policy, SessionKeyPolicy::Daily);
        let config = Config::from_toml(r#"session_policy = "fixed:exam-1""#).unwrap();
        assert_eq!(config.session_policy, SessionKeyPolicy::Fixed { name: "exam-1".into() });
        assert!(Config::from_toml(r#"session_policy = "weekly""#).is_err());
    }

    #[test]
    fn test_unknown_toml_key_rejected() {
        assert!(Config::from_toml("similarity_threshold = 0.4").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("match_threshold = 0.9").unwrap();
        config
            .apply_overrides(env(&[
                ("ROLLCALL_MATCH_THRESHOLD", "0.75"),
                ("ROLLCALL_SESSION_POLICY", "fixed:exam"),
                ("ROLLCALL_MIN_ENROLL_SAMPLES", "4"),
                ("ROLLCALL_ENHANCE_CONTRAST", "0"),
                ("ROLLCALL_DB_PATH", ""),
            ]))
            .unwrap();
        assert_eq!(config.match_threshold, 0.75);
        assert_eq!(config.session_policy, SessionKeyPolicy::Fixed { name: "exam".into() });
        assert_eq!(config.min_enroll_samples, 4);
        assert!(!config.enhance_contrast);
        assert!(config.db_path.ends_with("attendance.db"), "blank values are ignored");
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("ROLLCALL_FRAME_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ROLLCALL_FRAME_TIMEOUT_MS", .. }));
    }

    #[test]
    fn test_validate_rejects_nonpositive_threshold() {
        let config = Config {
            match_threshold: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_carries_timeouts() {
        let config = Config {
            frame_timeout_ms: 500,
            idle_timeout_secs: 30,
            ..Config::default()
        };
        let session = config.session_config();
        assert_eq!(session.frame_timeout, Duration::from_millis(500));
        assert_eq!(session.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(session.threshold, config.match_threshold);
    }
}

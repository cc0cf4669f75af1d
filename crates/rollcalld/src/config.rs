use rollcall_core::MatchStrategy;
use rollcall_hw::SourceSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration: optional TOML file, overridden by `ROLLCALL_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Directory holding one reference photo per student.
    pub face_dir: PathBuf,
    /// Suffix of reference photos stored as `<student id>.<ext>`.
    pub reference_extension: String,
    /// Cosine similarity a probe must reach to match a gallery face.
    pub similarity_threshold: f32,
    pub match_strategy: MatchStrategy,
    /// Length of one capture session.
    pub session_duration_secs: u64,
    /// Integer downsampling applied to frames before detection.
    pub downsample_factor: u32,
    /// Pause after an unreadable frame.
    pub frame_retry_delay_ms: u64,
    /// Dispatcher tick period.
    pub tick_interval_secs: u64,
    /// How far back a tick looks for due schedule entries.
    pub lookback_minutes: i64,
    /// Move entries whose window passed without success to the archive table.
    pub archive_stale_schedules: bool,
    /// Write all-Absent instead of failing when nobody was recognized.
    pub record_absent_when_empty: bool,
    pub capture_width: u32,
    pub capture_height: u32,
    pub stream_width: u32,
    pub stream_height: u32,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");
        let source = SourceSettings::default();

        Self {
            db_path: data_dir.join("rollcall.db"),
            model_dir: PathBuf::from("/usr/share/rollcall/models"),
            face_dir: PathBuf::from("face_data"),
            reference_extension: "jpg".to_string(),
            similarity_threshold: 0.40,
            match_strategy: MatchStrategy::First,
            session_duration_secs: 10,
            downsample_factor: 2,
            frame_retry_delay_ms: 50,
            tick_interval_secs: 60,
            lookback_minutes: 2,
            archive_stale_schedules: true,
            record_absent_when_empty: false,
            capture_width: source.capture_width,
            capture_height: source.capture_height,
            stream_width: source.stream_width,
            stream_height: source.stream_height,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load `$ROLLCALL_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ROLLCALL_*` overrides. Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn set<T: FromStr>(slot: &mut T, value: Option<String>) {
            if let Some(v) = value.and_then(|v| v.trim().parse().ok()) {
                *slot = v;
            }
        }
        fn set_flag(slot: &mut bool, value: Option<String>) {
            if let Some(v) = value {
                *slot = !matches!(v.trim(), "0" | "false" | "no" | "off");
            }
        }

        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_FACE_DIR") {
            self.face_dir = PathBuf::from(v);
        }
        set(&mut self.reference_extension, lookup("ROLLCALL_REFERENCE_EXTENSION"));
        set(&mut self.similarity_threshold, lookup("ROLLCALL_SIMILARITY_THRESHOLD"));
        set(&mut self.match_strategy, lookup("ROLLCALL_MATCH_STRATEGY"));
        set(&mut self.session_duration_secs, lookup("ROLLCALL_SESSION_DURATION_SECS"));
        set(&mut self.downsample_factor, lookup("ROLLCALL_DOWNSAMPLE_FACTOR"));
        set(&mut self.frame_retry_delay_ms, lookup("ROLLCALL_FRAME_RETRY_DELAY_MS"));
        set(&mut self.tick_interval_secs, lookup("ROLLCALL_TICK_INTERVAL_SECS"));
        set(&mut self.lookback_minutes, lookup("ROLLCALL_LOOKBACK_MINUTES"));
        set_flag(&mut self.archive_stale_schedules, lookup("ROLLCALL_ARCHIVE_STALE_SCHEDULES"));
        set_flag(&mut self.record_absent_when_empty, lookup("ROLLCALL_RECORD_ABSENT_WHEN_EMPTY"));
        set(&mut self.capture_width, lookup("ROLLCALL_CAPTURE_WIDTH"));
        set(&mut self.capture_height, lookup("ROLLCALL_CAPTURE_HEIGHT"));
        set(&mut self.stream_width, lookup("ROLLCALL_STREAM_WIDTH"));
        set(&mut self.stream_height, lookup("ROLLCALL_STREAM_HEIGHT"));
        set_flag(&mut self.session_bus, lookup("ROLLCALL_SESSION_BUS"));
    }

    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session_duration_secs)
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            capture_width: self.capture_width,
            capture_height: self.capture_height,
            stream_width: self.stream_width,
            stream_height: self.stream_height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session_duration(), Duration::from_secs(10));
        assert_eq!(config.lookback_minutes, 2);
        assert_eq!(config.tick_interval_secs, 60);
        assert_eq!(config.match_strategy, MatchStrategy::First);
        assert!(!config.record_absent_when_empty);
        assert!(config.db_path.ends_with("rollcall/rollcall.db"));
    }

    #[test]
    fn test_toml_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(
            &path,
            "face_dir = \"/srv/faces\"\nmatch_strategy = \"best\"\nsession_duration_secs = 15\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.face_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.match_strategy, MatchStrategy::Best);
        assert_eq!(config.session_duration_secs, 15);
        assert_eq!(config.downsample_factor, 2);
    }

    #[test]
    fn test_toml_rejects_bad_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "lookback_minutes = \"two\"\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ROLLCALL_SIMILARITY_THRESHOLD", "0.55"),
            ("ROLLCALL_LOOKBACK_MINUTES", "5"),
            ("ROLLCALL_RECORD_ABSENT_WHEN_EMPTY", "1"),
            ("ROLLCALL_ARCHIVE_STALE_SCHEDULES", "off"),
            ("ROLLCALL_DOWNSAMPLE_FACTOR", "not-a-number"),
            ("ROLLCALL_DB_PATH", "/var/lib/rollcall/db.sqlite"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert!((config.similarity_threshold - 0.55).abs() < 1e-6);
        assert_eq!(config.lookback_minutes, 5);
        assert!(config.record_absent_when_empty);
        assert!(!config.archive_stale_schedules);
        assert_eq!(config.downsample_factor, 2);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/db.sqlite"));
    }
}

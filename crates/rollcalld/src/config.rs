use rollcall_core::DedupScope;
use rollcall_hw::{CameraError, CameraSource, SessionPolicy};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} {reason}")]
    OutOfRange { key: &'static str, reason: &'static str },
    #[error("no cameras configured (set `cameras` in the config file or ROLLCALL_CAMERAS)")]
    NoCameras,
    #[error("camera id {0:?} is used more than once")]
    DuplicateCamera(String),
    #[error("camera {id}: {source}")]
    Camera {
        id: String,
        #[source]
        source: CameraError,
    },
    #[error("model file not found: {0}")]
    MissingModel(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    pub source: String,
}

/// Daemon configuration: an optional TOML file overridden by `ROLLCALL_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub recognizer_model: String,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Minimum SCRFD score for a detection.
    pub detection_confidence: f32,
    /// Faces per frame, highest confidence first; 0 for no limit.
    pub max_faces: usize,
    /// Process every N-th frame read.
    pub frame_stride: u32,
    pub cooldown_secs: u64,
    pub health_check_interval_secs: u64,
    pub reconnect_backoff_secs: u64,
    /// Consecutive connect failures before a camera is reported degraded.
    pub degraded_after: u32,
    pub enrollment_poll_interval_secs: u64,
    /// One sub-directory of reference images per identity.
    pub enrollment_dir: PathBuf,
    pub dedup_scope: DedupScope,
    pub db_path: PathBuf,
    /// Telegram bot token; notifications are only logged when unset.
    pub telegram_token: Option<String>,
    /// JSON map of identity name to Telegram chat.
    pub telegram_recipients: PathBuf,
    /// Serve status on the system bus.
    pub dbus: bool,
    pub cameras: Vec<CameraConfig>,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("rollcall")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".into(),
            recognizer_model: "w600k_r50.onnx".into(),
            similarity_threshold: 0.40,
            detection_confidence: rollcall_core::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            max_faces: 0,
            frame_stride: 3,
            cooldown_secs: 60,
            health_check_interval_secs: 60,
            reconnect_backoff_secs: 5,
            degraded_after: 3,
            enrollment_poll_interval_secs: 5,
            enrollment_dir: PathBuf::from("./faces"),
            dedup_scope: DedupScope::Global,
            db_path: data_dir.join("attendance.db"),
            telegram_token: None,
            telegram_recipients: data_dir.join("telegram_users.json"),
            dbus: true,
            cameras: Vec::new(),
        }
    }
}

impl Config {
    /// Load `ROLLCALL_CONFIG` (or the XDG default, if present), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os("ROLLCALL_CONFIG").map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(|| config_dir().join("rollcall.toml"));

        let mut config = if explicit.is_some() || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `ROLLCALL_*` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = var("ROLLCALL_RECOGNIZER_MODEL") {
            self.recognizer_model = v;
        }
        env_parse(&var, "ROLLCALL_SIMILARITY_THRESHOLD", &mut self.similarity_threshold)?;
        env_parse(&var, "ROLLCALL_DETECTION_CONFIDENCE", &mut self.detection_confidence)?;
        env_parse(&var, "ROLLCALL_MAX_FACES", &mut self.max_faces)?;
        env_parse(&var, "ROLLCALL_FRAME_STRIDE", &mut self.frame_stride)?;
        env_parse(&var, "ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs)?;
        env_parse(&var, "ROLLCALL_HEALTH_CHECK_INTERVAL_SECS", &mut self.health_check_interval_secs)?;
        env_parse(&var, "ROLLCALL_RECONNECT_BACKOFF_SECS", &mut self.reconnect_backoff_secs)?;
        env_parse(&var, "ROLLCALL_DEGRADED_AFTER", &mut self.degraded_after)?;
        env_parse(&var, "ROLLCALL_ENROLLMENT_POLL_INTERVAL_SECS", &mut self.enrollment_poll_interval_secs)?;
        if let Some(v) = var("ROLLCALL_ENROLLMENT_DIR") {
            self.enrollment_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DEDUP_SCOPE") {
            self.dedup_scope = parse_scope(&v).ok_or(ConfigError::InvalidValue {
                key: "ROLLCALL_DEDUP_SCOPE",
                value: v,
            })?;
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_TELEGRAM_TOKEN") {
            self.telegram_token = Some(v).filter(|t| !t.trim().is_empty());
        }
        if let Some(v) = var("ROLLCALL_TELEGRAM_RECIPIENTS") {
            self.telegram_recipients = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DBUS") {
            self.dbus = v != "0";
        }
        if let Some(v) = var("ROLLCALL_CAMERAS") {
            self.cameras = parse_camera_list(&v)?;
        }
        Ok(())
    }

    /// Reject configurations no worker could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::OutOfRange {
                key: "similarity_threshold",
                reason: "must be in [0, 1)",
            });
        }
        if !(self.detection_confidence > 0.0 && self.detection_confidence < 1.0) {
            return Err(ConfigError::OutOfRange {
                key: "detection_confidence",
                reason: "must be in (0, 1)",
            });
        }
        if self.frame_stride == 0 {
            return Err(ConfigError::OutOfRange { key: "frame_stride", reason: "must be at least 1" });
        }
        if self.reconnect_backoff_secs == 0 {
            return Err(ConfigError::OutOfRange {
                key: "reconnect_backoff_secs",
                reason: "must be at least 1",
            });
        }
        if self.enrollment_poll_interval_secs == 0 {
            return Err(ConfigError::OutOfRange {
                key: "enrollment_poll_interval_secs",
                reason: "must be at least 1",
            });
        }
        self.camera_sources().map(|_| ())
    }

    /// Parsed camera sources, in configuration order.
    pub fn camera_sources(&self) -> Result<Vec<(String, CameraSource)>, ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        let mut seen = HashSet::new();
        self.cameras
            .iter()
            .map(|cam| {
                if !seen.insert(cam.id.as_str()) {
                    return Err(ConfigError::DuplicateCamera(cam.id.clone()));
                }
                let source = cam.source.parse().map_err(|source| ConfigError::Camera {
                    id: cam.id.clone(),
                    source,
                })?;
                Ok((cam.id.clone(), source))
            })
            .collect()
    }

    /// Fail early when either model file is missing.
    pub fn check_models(&self) -> Result<(), ConfigError> {
        for path in [self.detector_model_path(), self.recognizer_model_path()] {
            if !path.is_file() {
                return Err(ConfigError::MissingModel(path));
            }
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_model)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn enrollment_poll_interval(&self) -> Duration {
        Duration::from_secs(self.enrollment_poll_interval_secs)
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            degraded_after: self.degraded_after,
        }
    }
}

fn env_parse<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(v) = var(key) {
        *slot = v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: v.clone() })?;
    }
    Ok(())
}

fn parse_scope(s: &str) -> Option<DedupScope> {
    match s.trim().to_ascii_lowercase().as_str() {
        "global" => Some(DedupScope::Global),
        "per_camera" | "per-camera" | "camera" => Some(DedupScope::PerCamera),
        _ => None,
    }
}

/// `cam01=/dev/video0;cam02=http://host/stream.mjpg`. Entries without an
/// `id=` prefix are named `camNN` by position.
fn parse_camera_list(s: &str) -> Result<Vec<CameraConfig>, ConfigError> {
    s.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| {
            // A URL may itself contain '=', so only split when the left side looks like an id.
            let (id, source) = match entry.split_once('=') {
                Some((id, source)) if !id.contains('/') && !id.contains(':') => (id.trim(), source.trim()),
                _ => ("", entry),
            };
            if source.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "ROLLCALL_CAMERAS",
                    value: entry.to_string(),
                });
            }
            let id = if id.is_empty() { format!("cam{:02}", i + 1) } else { id.to_string() };
            Ok(CameraConfig { id, source: source.to_string() })
        })
        .collect()
}

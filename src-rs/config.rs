//! Configuration file loading and validation.
//!
//! The JSON file is read into [`ConfigFile`] (every key optional, so missing
//! keys can be reported together) and then validated into the immutable
//! [`Config`] shared by all components for the process lifetime.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config/obs_config.json";
pub const DEFAULT_PREVIEW_PATH: &str = ".presence-switch/preview.png";

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CaptureMode {
    /// Screenshot of the monitored source, fetched over the control connection
    Remote,
    /// Local capture device, read through a capture program
    Camera,
}

/// Raw configuration record, exactly as it appears on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub obs_host: Option<String>,
    pub obs_port: Option<u32>,
    pub obs_password: Option<String>,
    pub monitor_source_name: Option<String>,
    pub show_source_name: Option<String>,
    pub hide_source_name: Option<String>,
    pub detection_scene_name: Option<String>,
    pub excluded_scenes: Vec<String>,
    pub face_detection_confidence: Option<f64>,
    pub check_interval: Option<f64>,
    pub standby_check_interval: Option<f64>,
    pub max_consecutive_errors: Option<u32>,
    pub request_timeout: Option<f64>,
    pub show_preview: bool,
    pub preview_path: Option<PathBuf>,
    pub screenshot_width: Option<u32>,
    pub screenshot_height: Option<u32>,
    pub screenshot_format: Option<String>,
    pub detector_command: Vec<String>,
    pub detector_timeout: Option<f64>,
    pub camera_index: Option<u32>,
    pub camera_path: Option<String>,
    pub camera_width: Option<u32>,
    pub camera_height: Option<u32>,
    pub camera_fps: Option<u32>,
    pub camera_command: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

impl ConnectionSettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

/// What gets toggled on a presence edge.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    /// Shown on presence, hidden on absence
    pub show: Option<String>,
    /// Hidden on presence, shown on absence
    pub hide: Option<String>,
    /// Scenes left untouched when the show-target is hidden
    pub detection_scenes: BTreeSet<String>,
}

impl Targets {
    pub fn is_empty(&self) -> bool {
        self.show.is_none() && self.hide.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub confidence: f64,
    pub command: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub standby_interval: Duration,
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone)]
pub enum CaptureSettings {
    Screenshot {
        source: String,
        format: String,
        width: u32,
        height: u32,
    },
    Camera {
        device: String,
        width: u32,
        height: u32,
        fps: u32,
        command: Option<Vec<String>>,
        timeout: Duration,
    },
}

/// Validated, read-only configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub targets: Targets,
    pub detection: DetectionSettings,
    pub poll: PollSettings,
    pub capture: CaptureSettings,
    pub preview: Option<PathBuf>,
}

impl Config {
    /// Reads and validates the file at `path`.
    pub fn load(path: &Path, mode: CaptureMode) -> Result<Self, ConfigError> {
        let raw = ConfigFile::read(path)?;
        raw.validate(mode)
    }

    /// Non-fatal problems worth reporting at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.targets.is_empty() {
            out.push(
                "neither show_source_name nor hide_source_name configured; no sources will be toggled"
                    .to_string(),
            );
        }
        if self.connection.password.is_none() {
            out.push("obs_password not set; connecting without authentication".to_string());
        }
        out
    }
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Connection-only validation, for commands that never capture frames.
    pub fn connection(&self) -> Result<ConnectionSettings, ConfigError> {
        let mut missing = Vec::new();
        if non_empty(&self.obs_host).is_none() {
            missing.push("obs_host".to_string());
        }
        if self.obs_port.is_none() {
            missing.push("obs_port".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }
        self.connection_settings()
    }

    pub fn validate(&self, mode: CaptureMode) -> Result<Config, ConfigError> {
        let mut missing = Vec::new();
        if non_empty(&self.obs_host).is_none() {
            missing.push("obs_host".to_string());
        }
        if self.obs_port.is_none() {
            missing.push("obs_port".to_string());
        }
        if mode == CaptureMode::Remote && non_empty(&self.monitor_source_name).is_none() {
            missing.push("monitor_source_name".to_string());
        }
        if self.detector_command.is_empty() {
            missing.push("detector_command".to_string());
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingKeys(missing));
        }

        let connection = self.connection_settings()?;

        let mut detection_scenes: BTreeSet<String> = self
            .excluded_scenes
            .iter()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect();
        if let Some(scene) = non_empty(&self.detection_scene_name) {
            detection_scenes.insert(scene);
        }

        let targets = Targets {
            show: non_empty(&self.show_source_name),
            hide: non_empty(&self.hide_source_name),
            detection_scenes,
        };

        let detection = self.detection()?;

        let poll = PollSettings {
            interval: seconds("check_interval", self.check_interval, 0.5)?,
            standby_interval: seconds("standby_check_interval", self.standby_check_interval, 5.0)?,
            max_consecutive_errors: self.max_consecutive_errors.unwrap_or(5).max(1),
        };

        let capture = match mode {
            CaptureMode::Remote => CaptureSettings::Screenshot {
                source: non_empty(&self.monitor_source_name).unwrap_or_default(),
                format: non_empty(&self.screenshot_format).unwrap_or_else(|| "png".to_string()),
                width: self.screenshot_width.unwrap_or(640),
                height: self.screenshot_height.unwrap_or(480),
            },
            CaptureMode::Camera => self.camera()?,
        };

        let preview = self.show_preview.then(|| {
            self.preview_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PREVIEW_PATH))
        });

        Ok(Config {
            connection,
            targets,
            detection,
            poll,
            capture,
            preview,
        })
    }

    /// Detector settings on their own; needs only `detector_command`.
    pub fn detection(&self) -> Result<DetectionSettings, ConfigError> {
        if self.detector_command.is_empty() {
            return Err(ConfigError::MissingKeys(vec!["detector_command".to_string()]));
        }
        let confidence = self.face_detection_confidence.unwrap_or(0.7);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ConfigError::invalid(
                "face_detection_confidence",
                format!("{confidence} is outside [0.0, 1.0]"),
            ));
        }
        Ok(DetectionSettings {
            confidence,
            command: self.detector_command.clone(),
            timeout: seconds("detector_timeout", self.detector_timeout, 10.0)?,
        })
    }

    /// Local camera capture settings; every camera key has a default.
    pub fn camera(&self) -> Result<CaptureSettings, ConfigError> {
        Ok(CaptureSettings::Camera {
            device: non_empty(&self.camera_path)
                .unwrap_or_else(|| format!("/dev/video{}", self.camera_index.unwrap_or(0))),
            width: self.camera_width.unwrap_or(640),
            height: self.camera_height.unwrap_or(480),
            fps: self.camera_fps.unwrap_or(30),
            command: self.camera_command.clone().filter(|argv| !argv.is_empty()),
            timeout: seconds("request_timeout", self.request_timeout, 5.0)?,
        })
    }

    fn connection_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        let port = self.obs_port.unwrap_or_default();
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ConfigError::invalid("obs_port", format!("{port} is not a valid port")))?;
        Ok(ConnectionSettings {
            host: non_empty(&self.obs_host).unwrap_or_default(),
            port,
            password: non_empty(&self.obs_password),
            request_timeout: seconds("request_timeout", self.request_timeout, 5.0)?,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn seconds(key: &'static str, value: Option<f64>, default: f64) -> Result<Duration, ConfigError> {
    let secs = value.unwrap_or(default);
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::invalid(key, format!("{secs} must be a positive number of seconds")));
    }
    Ok(Duration::from_secs_f64(secs))
}

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::{
    pipeline::{StreamConstraints, raster::DEFAULT_JPEG_QUALITY},
    render::DEFAULT_LOW_LIVENESS_THRESHOLD,
};

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CAMERA_INDEX: u32 = 0;
const DEFAULT_READY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_TICK_INTERVAL_MS: u64 = 3_000;
const DEFAULT_SESSION_FILE: &str = ".attendance/session.json";

pub const CONFIG_ENV: &str = "ATTENDANCE_CONFIG";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    api: Option<ApiSection>,
    camera: Option<CameraSection>,
    recognition: Option<RecognitionSection>,
    session: Option<SessionSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiSection {
    base_url: Option<String>,
    request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraSection {
    index: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    ready_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecognitionSection {
    tick_interval_ms: Option<u64>,
    jpeg_quality: Option<u8>,
    low_liveness_threshold: Option<f32>,
    order_guard: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SessionSection {
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub api: ApiSettings,
    pub camera: CameraSettings,
    pub recognition: RecognitionSettings,
    pub session_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiSettings {
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionSettings {
    pub tick_interval: Duration,
    pub jpeg_quality: u8,
    pub low_liveness_threshold: f32,
    /// Discard responses that arrive after a newer one was already applied.
    pub order_guard: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl MonitorConfig {
    /// Defaults, then the optional TOML file (explicit path or
    /// `ATTENDANCE_CONFIG`), then environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let file_cfg = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let recognition = file.recognition.unwrap_or_default();
        let session = file.session.unwrap_or_default();
        let constraints = StreamConstraints::default();

        Self {
            api: ApiSettings {
                base_url: api
                    .base_url
                    .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
                request_timeout: Duration::from_millis(
                    api.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
                ),
            },
            camera: CameraSettings {
                index: camera.index.unwrap_or(DEFAULT_CAMERA_INDEX),
                width: camera.width.unwrap_or(constraints.ideal_width),
                height: camera.height.unwrap_or(constraints.ideal_height),
                ready_timeout: Duration::from_millis(
                    camera.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS),
                ),
            },
            recognition: RecognitionSettings {
                tick_interval: Duration::from_millis(
                    recognition
                        .tick_interval_ms
                        .unwrap_or(DEFAULT_TICK_INTERVAL_MS),
                ),
                jpeg_quality: recognition.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                low_liveness_threshold: recognition
                    .low_liveness_threshold
                    .unwrap_or(DEFAULT_LOW_LIVENESS_THRESHOLD),
                order_guard: recognition.order_guard.unwrap_or(false),
            },
            session_file: session
                .file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_FILE)),
        }
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ATTENDANCE_API_URL") {
            if !url.trim().is_empty() {
                self.api.base_url = url.trim().to_string();
            }
        }
        if let Some(path) = lookup("ATTENDANCE_SESSION_FILE") {
            if !path.trim().is_empty() {
                self.session_file = PathBuf::from(path);
            }
        }
        if let Some(interval) = lookup("ATTENDANCE_TICK_MS") {
            let millis: u64 = interval
                .trim()
                .parse()
                .map_err(|_| anyhow!("ATTENDANCE_TICK_MS must be an integer number of milliseconds"))?;
            self.recognition.tick_interval = Duration::from_millis(millis);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            return Err(anyhow!("api.base_url must not be empty"));
        }
        if self.api.request_timeout.is_zero() {
            return Err(anyhow!("api.request_timeout_ms must be greater than zero"));
        }
        if self.camera.ready_timeout.is_zero() {
            return Err(anyhow!("camera.ready_timeout_ms must be greater than zero"));
        }
        if self.recognition.tick_interval.is_zero() {
            return Err(anyhow!("recognition.tick_interval_ms must be greater than zero"));
        }
        if !(1..=100).contains(&self.recognition.jpeg_quality) {
            return Err(anyhow!("recognition.jpeg_quality must be within 1..=100"));
        }
        if !(0.0..=1.0).contains(&self.recognition.low_liveness_threshold) {
            return Err(anyhow!(
                "recognition.low_liveness_threshold must be within [0.0, 1.0]"
            ));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera.width and camera.height must be non-zero"));
        }
        Ok(())
    }

    pub fn stream_constraints(&self) -> StreamConstraints {
        StreamConstraints {
            camera_index: self.camera.index,
            ideal_width: self.camera.width,
            ideal_height: self.camera.height,
            ..StreamConstraints::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

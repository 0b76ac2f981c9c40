use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::controller::{PipelineSettings, DEFAULT_ENDPOINT, DEFAULT_PACE_INTERVAL};
use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::ingest::CaptureSettings;

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    endpoint: Option<String>,
    capture: Option<CaptureConfigFile>,
    encoding: Option<EncodingConfigFile>,
    pacing: Option<PacingConfigFile>,
    output: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct EncodingConfigFile {
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct PacingConfigFile {
    interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint: String,
    pub capture: CaptureSettings,
    pub jpeg_quality: u8,
    pub pace_interval: Duration,
    /// Where rendered frames are written, if anywhere.
    pub output: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            capture: CaptureSettings::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            pace_interval: DEFAULT_PACE_INTERVAL,
            output: None,
        }
    }
}

impl StreamConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SCANNON_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StreamConfigFile) -> Self {
        let defaults = Self::default();
        let capture = file.capture.unwrap_or_default();
        Self {
            endpoint: file.endpoint.unwrap_or(defaults.endpoint),
            capture: CaptureSettings {
                url: capture.source.unwrap_or(defaults.capture.url),
                width: capture.width.unwrap_or(defaults.capture.width),
                height: capture.height.unwrap_or(defaults.capture.height),
                fps: capture.fps.unwrap_or(defaults.capture.fps),
            },
            jpeg_quality: file
                .encoding
                .and_then(|encoding| encoding.jpeg_quality)
                .unwrap_or(defaults.jpeg_quality),
            pace_interval: file
                .pacing
                .and_then(|pacing| pacing.interval_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.pace_interval),
            output: file.output,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("SCANNON_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.endpoint = endpoint.trim().to_string();
            }
        }
        if let Ok(source) = std::env::var("SCANNON_SOURCE") {
            if !source.trim().is_empty() {
                self.capture.url = source.trim().to_string();
            }
        }
        if let Ok(quality) = std::env::var("SCANNON_JPEG_QUALITY") {
            self.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("SCANNON_JPEG_QUALITY must be an integer between 1 and 100"))?;
        }
        if let Ok(pace) = std::env::var("SCANNON_PACE_MS") {
            let millis: u64 = pace
                .trim()
                .parse()
                .map_err(|_| anyhow!("SCANNON_PACE_MS must be an integer number of milliseconds"))?;
            self.pace_interval = Duration::from_millis(millis);
        }
        if let Ok(output) = std::env::var("SCANNON_OUTPUT") {
            if !output.trim().is_empty() {
                self.output = Some(PathBuf::from(output));
            }
        }
        Ok(())
    }

    /// Check the final settings. Called by `load` and again after any
    /// command-line overrides.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.endpoint)
            .with_context(|| format!("invalid endpoint '{}'", self.endpoint))?;
        match url.scheme() {
            "ws" => {}
            "wss" => {
                if !cfg!(feature = "tls") {
                    return Err(anyhow!("wss:// endpoints require the tls feature"));
                }
            }
            other => {
                return Err(anyhow!(
                    "endpoint scheme must be ws or wss, got '{}'",
                    other
                ))
            }
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality must be between 1 and 100, got {}",
                self.jpeg_quality
            ));
        }
        if self.pace_interval.is_zero() {
            return Err(anyhow!("pacing interval must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!(
                "capture dimensions must be non-zero, got {}x{}",
                self.capture.width,
                self.capture.height
            ));
        }
        if self.capture.url.trim().is_empty() {
            return Err(anyhow!("capture source must not be empty"));
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            endpoint: self.endpoint.clone(),
            pace_interval: self.pace_interval,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

fn read_config_file(path: &Path) -> Result<StreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

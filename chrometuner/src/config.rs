//! Configuration file format and conversion into runtime settings.
//!
//! Every key is optional. Built-in defaults apply first, then the TOML file,
//! then command-line flags (applied by `main` onto the loaded sections).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use chrometuner_protocol::{DeviceIdentity, Lineup, ProtocolError};

use crate::browser::capture::BROWSER_UI_HEIGHT;
use crate::browser::{BrowserOptions, CaptureConstraints, CaptureGeometry};
use crate::server::transcode::TranscodeConfig;
use crate::server::{OutputFormat, PipelineConfig};
use crate::tuner::lineup::lineup_from_config;
use crate::tuner::SelectorConfig;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "chrometuner.toml";

pub const DEFAULT_LISTEN: &str = "0.0.0.0:5589";
pub const DEFAULT_DISCOVERY_LISTEN: &str = "0.0.0.0:80";
pub const DEFAULT_FRIENDLY_NAME: &str = "chrometuner";

/// Errors raised while loading or interpreting the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this format.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A listen address did not parse.
    #[error("Invalid address for {key}: '{value}'")]
    InvalidAddress { key: &'static str, value: String },

    /// Unknown `[capture] output` value.
    #[error("Invalid output format '{0}' (expected 'native' or 'mpegts')")]
    InvalidOutput(String),

    /// The configured lineup failed validation.
    #[error("Invalid lineup: {0}")]
    Lineup(#[from] ProtocolError),
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tuner: TunerSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub channels: Vec<ChannelSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub listen: Option<String>,
    pub discovery_listen: Option<String>,
    pub enable_discovery: Option<bool>,
    /// External base URL; overrides the Host header.
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TunerSection {
    pub max_streams: Option<usize>,
    pub admission_wait_secs: Option<u64>,
    pub device_id: Option<String>,
    pub friendly_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BrowserSection {
    pub profile_dir: Option<String>,
    pub executable: Option<String>,
    pub headless: Option<bool>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CaptureSection {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Page width the guide is laid out for; the page is zoomed to fit `width`.
    pub layout_width: Option<u32>,
    pub video_bitrate: Option<u32>,
    pub audio_bitrate: Option<u32>,
    pub min_frame_rate: Option<u32>,
    pub max_frame_rate: Option<u32>,
    pub output: Option<String>,
    pub ffmpeg: Option<String>,
    pub navigation_timeout_secs: Option<u64>,
    pub grid_wait_secs: Option<u64>,
    pub click_settle_ms: Option<u64>,
    pub playback_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// One `[[channels]]` entry.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChannelSection {
    pub key: String,
    pub number: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub slug: Option<String>,
}

/// Read and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Explicit path, else `chrometuner.toml` in `dir` if it exists.
pub fn resolve_config_path(explicit: Option<PathBuf>, dir: &Path) -> Option<PathBuf> {
    explicit.or_else(|| {
        let default_path = dir.join(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

fn parse_addr(key: &'static str, value: Option<&str>, default: &str) -> Result<SocketAddr, ConfigError> {
    let value = value.unwrap_or(default);
    value.parse().map_err(|_| ConfigError::InvalidAddress {
        key,
        value: value.to_string(),
    })
}

impl ConfigFile {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr("server.listen", self.server.listen.as_deref(), DEFAULT_LISTEN)
    }

    pub fn discovery_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(
            "server.discovery_listen",
            self.server.discovery_listen.as_deref(),
            DEFAULT_DISCOVERY_LISTEN,
        )
    }

    pub fn discovery_enabled(&self) -> bool {
        self.server.enable_discovery.unwrap_or(true)
    }

    pub fn max_streams(&self) -> usize {
        self.tuner.max_streams.unwrap_or(2).max(1)
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(self.logging.log_dir.as_deref().unwrap_or("logs"))
    }

    pub fn log_retention_days(&self) -> u64 {
        self.logging.retention_days.unwrap_or(7)
    }

    pub fn output_format(&self) -> Result<OutputFormat, ConfigError> {
        match self.capture.output.as_deref() {
            None => Ok(OutputFormat::MpegTs),
            Some(value) => {
                OutputFormat::parse(value).ok_or_else(|| ConfigError::InvalidOutput(value.to_string()))
            }
        }
    }

    pub fn lineup(&self) -> Result<Lineup, ConfigError> {
        Ok(lineup_from_config(&self.channels)?)
    }

    /// Device identity advertised to DVR software.
    pub fn device_identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let friendly_name = self
            .tuner
            .friendly_name
            .clone()
            .unwrap_or_else(|| DEFAULT_FRIENDLY_NAME.to_string());
        let device_id = match &self.tuner.device_id {
            Some(id) => id.to_ascii_uppercase(),
            None => derive_device_id(&friendly_name, &self.listen_addr()?),
        };
        Ok(DeviceIdentity {
            friendly_name,
            device_id,
            tuner_count: self.max_streams(),
        })
    }

    pub fn browser_options(&self) -> BrowserOptions {
        let defaults = BrowserOptions::default();
        let section = &self.browser;
        let (width, height) = self.resolution();
        BrowserOptions {
            profile_dir: section
                .profile_dir
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or(defaults.profile_dir),
            executable: section.executable.as_deref().map(PathBuf::from),
            headless: section.headless.unwrap_or(defaults.headless),
            window_width: width,
            window_height: height + BROWSER_UI_HEIGHT,
            extra_args: section.extra_args.clone(),
        }
    }

    fn resolution(&self) -> (u32, u32) {
        let defaults = CaptureConstraints::default();
        (
            self.capture.width.unwrap_or(defaults.width),
            self.capture.height.unwrap_or(defaults.height),
        )
    }

    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let defaults = PipelineConfig::default();
        let capture = &self.capture;
        let (width, height) = self.resolution();

        let constraints = CaptureConstraints {
            width,
            height,
            video_bitrate: capture
                .video_bitrate
                .unwrap_or(defaults.constraints.video_bitrate),
            audio_bitrate: capture
                .audio_bitrate
                .unwrap_or(defaults.constraints.audio_bitrate),
            min_frame_rate: capture
                .min_frame_rate
                .unwrap_or(defaults.constraints.min_frame_rate),
            max_frame_rate: capture
                .max_frame_rate
                .unwrap_or(defaults.constraints.max_frame_rate),
            ..defaults.constraints
        };

        let secs = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);

        Ok(PipelineConfig {
            navigation_timeout: secs(capture.navigation_timeout_secs, defaults.navigation_timeout),
            admission_wait: secs(self.tuner.admission_wait_secs, defaults.admission_wait),
            playback_timeout: secs(capture.playback_timeout_secs, defaults.playback_timeout),
            playback_poll_interval: defaults.playback_poll_interval,
            geometry: CaptureGeometry::for_resolution(
                width,
                height,
                capture.layout_width.unwrap_or(1920),
            ),
            selector: SelectorConfig {
                grid_wait: secs(capture.grid_wait_secs, defaults.selector.grid_wait),
                settle_delay: capture
                    .click_settle_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.selector.settle_delay),
                ..defaults.selector
            },
            output: self.output_format()?,
            transcode: TranscodeConfig {
                ffmpeg: capture
                    .ffmpeg
                    .as_deref()
                    .map(PathBuf::from)
                    .unwrap_or(defaults.transcode.ffmpeg),
                audio_bitrate: constraints.audio_bitrate,
            },
            constraints,
        })
    }
}

/// Stable eight hex digit ID (FNV-1a over the name and listen address).
fn derive_device_id(friendly_name: &str, listen: &SocketAddr) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in friendly_name.bytes().chain(listen.to_string().bytes()) {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{:08X}", hash)
}

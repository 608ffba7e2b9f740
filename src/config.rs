//! Station configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `VOLUME_STATION_`, nested keys separated by `__`
//!
//! Environment variables win over the file, so
//! `VOLUME_STATION_HTTP__PORT=9000` overrides `[http] port`.
//!
//! # Example
//! ```toml
//! [devices.camera]
//! name = "fake"
//!
//! [devices.scales]
//! name = "casm"
//! port = "/dev/ttyUSB0"
//! settings = { min_weight_g = 5.0 }
//!
//! [[devices.scanners]]
//! name = "generic"
//! port = "/dev/ttyUSB1"
//!
//! [algorithm]
//! required_sample_count = 5
//!
//! [http]
//! port = 8080
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, StationError};

/// Top-level station configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationConfig {
    /// Attached peripherals
    #[serde(default)]
    pub devices: DevicesConfig,
    /// Capture and post-processing settings
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    /// HTTP trigger endpoint and dashboard listener
    #[serde(default)]
    pub http: HttpConfig,
    /// Outbound result senders
    #[serde(default)]
    pub senders: SendersConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingSection,
}

/// One configured device: registry name, optional port and driver-specific settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Registry name, e.g. `casm` or `keusb24r`
    pub name: String,
    /// Serial port path; empty when the device is not port based
    #[serde(default)]
    pub port: String,
    /// Driver-specific settings passed to the factory
    #[serde(default)]
    pub settings: toml::Table,
}

impl DeviceEntry {
    /// Create an entry with a name and port and no extra settings.
    pub fn new(name: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            settings: toml::Table::new(),
        }
    }

    /// Settings table handed to the device factory, with `port` folded in.
    pub fn factory_config(&self) -> toml::Value {
        let mut table = self.settings.clone();
        if !self.port.is_empty() {
            table.insert("port".into(), toml::Value::String(self.port.clone()));
        }
        toml::Value::Table(table)
    }

    /// True when both name and port are present.
    pub fn has_name_and_port(&self) -> bool {
        !self.name.is_empty() && !self.port.is_empty()
    }
}

/// Device section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Depth/color frame provider
    #[serde(default = "default_camera")]
    pub camera: DeviceEntry,
    /// Color and depth delivery rate for restricted consumers
    #[serde(default = "default_camera_fps")]
    pub camera_fps: f64,
    /// Barcode scanners
    #[serde(default)]
    pub scanners: Vec<DeviceEntry>,
    /// Scale
    #[serde(default)]
    pub scales: Option<DeviceEntry>,
    /// Relay/line I/O board
    #[serde(default)]
    pub io_circuit: Option<DeviceEntry>,
    /// Distance sensor above the measuring area
    #[serde(default)]
    pub range_meter: Option<DeviceEntry>,
    /// Network camera used for parcel photos
    #[serde(default)]
    pub ip_camera: Option<DeviceEntry>,
    /// Preset the IP camera moves to after connecting
    #[serde(default = "default_ip_camera_preset")]
    pub ip_camera_preset: u32,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            camera: default_camera(),
            camera_fps: default_camera_fps(),
            scanners: Vec::new(),
            scales: None,
            io_circuit: None,
            range_meter: None,
            ip_camera: None,
            ip_camera_preset: default_ip_camera_preset(),
        }
    }
}

/// Capture, algorithm and pallet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// Frames aggregated per measurement
    #[serde(default = "default_sample_count")]
    pub required_sample_count: usize,
    /// Depth-map algorithm 1 allowed
    #[serde(default = "default_true")]
    pub dm1_enabled: bool,
    /// Depth-map algorithm 2 allowed
    #[serde(default = "default_true")]
    pub dm2_enabled: bool,
    /// Color-image algorithm allowed
    #[serde(default = "default_true")]
    pub rgb_enabled: bool,
    /// Directory for diagnostic photos
    #[serde(default = "default_photos_dir")]
    pub photos_dir: PathBuf,
    /// Distance from the camera to the empty floor
    #[serde(default = "default_floor_depth")]
    pub floor_depth_mm: i16,
    /// Pixels closer than `floor - cutoff` count as object
    #[serde(default = "default_cutoff_depth")]
    pub cutoff_depth_mm: i16,
    /// Horizontal footprint of one depth pixel at 1 m
    #[serde(default = "default_mm_per_pixel")]
    pub mm_per_pixel_at_1m: f64,
    /// Added to every range meter reading
    #[serde(default)]
    pub range_meter_correction_mm: i32,
    /// Subtract pallet weight and height from the result
    #[serde(default)]
    pub enable_pallet_subtraction: bool,
    /// Pallet weight in grams
    #[serde(default)]
    pub pallet_weight_g: f64,
    /// Pallet height in millimetres
    #[serde(default)]
    pub pallet_height_mm: i32,
    /// Refuse to start without a scanned barcode
    #[serde(default)]
    pub require_barcode: bool,
    /// Refuse to start unless the scale reports a settled weight
    #[serde(default = "default_true")]
    pub require_stable_weight: bool,
    /// Maximum wait for each frame during capture
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            required_sample_count: default_sample_count(),
            dm1_enabled: true,
            dm2_enabled: true,
            rgb_enabled: true,
            photos_dir: default_photos_dir(),
            floor_depth_mm: default_floor_depth(),
            cutoff_depth_mm: default_cutoff_depth(),
            mm_per_pixel_at_1m: default_mm_per_pixel(),
            range_meter_correction_mm: 0,
            enable_pallet_subtraction: false,
            pallet_weight_g: 0.0,
            pallet_height_mm: 0,
            require_barcode: false,
            require_stable_weight: true,
            frame_timeout_ms: default_frame_timeout(),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bind address
    #[serde(default = "default_address")]
    pub address: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Basic auth login; authentication is off when unset
    #[serde(default)]
    pub login: Option<String>,
    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Time a calculate request may stay pending
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            login: None,
            password: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl HttpConfig {
    /// `address:port` string for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Outbound sender settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendersConfig {
    /// Directory receiving one text summary per successful measurement
    #[serde(default)]
    pub summary_dir: Option<PathBuf>,
    /// Directory holding `results.csv`, one row per successful measurement
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_camera() -> DeviceEntry {
    DeviceEntry::new("fake", "")
}

fn default_camera_fps() -> f64 {
    5.0
}

fn default_ip_camera_preset() -> u32 {
    1
}

fn default_sample_count() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_photos_dir() -> PathBuf {
    PathBuf::from("photos")
}

fn default_floor_depth() -> i16 {
    1500
}

fn default_cutoff_depth() -> i16 {
    20
}

fn default_mm_per_pixel() -> f64 {
    1.6
}

fn default_frame_timeout() -> u64 {
    3000
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    15_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl StationConfig {
    /// Load configuration from a specific file path plus `VOLUME_STATION_` environment overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VOLUME_STATION_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Load and validate in one step.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Self::load_from(path)?;
        config.validate().map_err(StationError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        if self.devices.camera.name.is_empty() {
            return Err("devices.camera.name must not be empty".to_string());
        }

        if self.devices.camera_fps <= 0.0 {
            return Err(format!(
                "devices.camera_fps must be positive, got {}",
                self.devices.camera_fps
            ));
        }

        if self.algorithm.required_sample_count == 0 {
            return Err("algorithm.required_sample_count must be at least 1".to_string());
        }

        if self.algorithm.pallet_weight_g < 0.0 {
            return Err("algorithm.pallet_weight_g must not be negative".to_string());
        }

        if self.algorithm.frame_timeout_ms == 0 {
            return Err("algorithm.frame_timeout_ms must be positive".to_string());
        }

        if let Some(scales) = &self.devices.scales {
            if let Some(min) = scales.settings.get("min_weight_g") {
                let negative = min
                    .as_float()
                    .map(|v| v < 0.0)
                    .or_else(|| min.as_integer().map(|v| v < 0))
                    .unwrap_or(true);
                if negative {
                    return Err("devices.scales.settings.min_weight_g must be a non-negative number".to_string());
                }
            }
        }

        if self.http.address.is_empty() {
            return Err("http.address must not be empty".to_string());
        }

        if self.http.port == 0 {
            return Err("http.port must not be 0".to_string());
        }

        if self.http.request_timeout_ms == 0 {
            return Err("http.request_timeout_ms must be positive".to_string());
        }

        if self.http.login.is_some() && self.http.password.is_none() {
            return Err("http.password is required when http.login is set".to_string());
        }

        Ok(())
    }
}

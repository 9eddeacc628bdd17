//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (by default `config/zptess.toml`)
//! 2. Environment variables prefixed with `ZPTESS_`, using `__` between nested keys
//!    (e.g. `ZPTESS_SESSION__NROUNDS=7`)
//!
//! # Example
//! ```no_run
//! use zptess::config::ZptessConfig;
//!
//! let config = ZptessConfig::load()?;
//! config.validate()?;
//! println!("Rounds per session: {}", config.session.nrounds);
//! # Ok::<(), zptess::error::ZptessError>(())
//! ```

use crate::endpoint::Endpoint;
use crate::logging::LogFormat;
use crate::error::{AppResult, ZptessError};
use crate::model::{CalibrationKind, CalibrationMetadata, CentralTendency, Role};
use crate::protocol::Protocol;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZptessConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Calibration session parameters
    #[serde(default)]
    pub session: SessionConfig,
    /// Free-text metadata stored with each summary
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Reference photometer
    #[serde(rename = "ref")]
    pub reference: DeviceConfig,
    /// Photometer under calibration
    pub test: DeviceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (compact, pretty, json)
    #[serde(default)]
    pub log_format: LogFormat,
    /// JSON snapshot file backing the store
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

/// What to do with a role whose metadata could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicy {
    /// Do not start the role's pipeline.
    Suppress,
    /// Start the pipeline anyway; readings are shown but not calibrated.
    Acquire,
}

/// Calibration session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Samples per round; also the capacity of each role's ring buffer
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Rounds per calibration session
    #[serde(default = "default_nrounds")]
    pub nrounds: u32,
    /// Estimator for the central frequency of a round
    #[serde(default = "default_method")]
    pub central: CentralTendency,
    /// Estimator for the summary frequency
    #[serde(default = "default_method")]
    pub freq_method: CentralTendency,
    /// Estimator for the summary zero point
    #[serde(default = "default_method")]
    pub zp_method: CentralTendency,
    /// Manual correction added to the computed zero point
    #[serde(default)]
    pub zp_offset: f64,
    /// Fictitious zero point for instrumental magnitudes
    #[serde(default = "default_zp_fict")]
    pub zp_fict: f64,
    /// Absolute zero point of the reference photometer
    #[serde(default = "default_ref_zero_point")]
    pub ref_zero_point: f64,
    /// Capacity of the decode → aggregation channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Timeout of the one-shot device info request, in seconds
    #[serde(default = "default_info_timeout")]
    pub info_timeout_secs: u64,
    /// Close an empty round after this many seconds without samples
    #[serde(default)]
    pub silence_timeout_secs: Option<u64>,
    /// Longest accepted line on stream and serial links
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Write the calibrated zero point to the test photometer
    #[serde(default)]
    pub update_device: bool,
    /// Overwrite a stored photometer whose fetched identity differs
    #[serde(default)]
    pub reprovision: bool,
    /// Behaviour for roles whose metadata fetch failed
    #[serde(default = "default_offline_policy")]
    pub offline_policy: OfflinePolicy,
}

/// Summary metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// AUTO or MANUAL
    #[serde(default = "default_kind")]
    pub calibration: CalibrationKind,
    /// Operator, comment and hardware accessories
    #[serde(flatten)]
    pub details: CalibrationMetadata,
}

/// One photometer's access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Endpoint descriptor (`udp:host:port`, `tcp:host:port`, `serial:path:baud`)
    pub endpoint: Endpoint,
    /// Wire format the unit speaks
    pub protocol: Protocol,
    /// Photometer model
    #[serde(default = "default_model")]
    pub model: String,
    /// Light sensor fitted to the unit
    #[serde(default = "default_sensor")]
    pub sensor: String,
    /// Where the device identity comes from
    pub info: InfoConfig,
}

/// Device metadata source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InfoConfig {
    /// Scrape the unit's web page
    Html {
        /// Host name or address of the unit
        host: String,
    },
    /// Fixed identity, for units without a web server
    Static {
        /// Unit name
        name: String,
        /// MAC address
        mac: String,
        /// Firmware string
        #[serde(default)]
        firmware: String,
        /// Zero point
        zero_point: f64,
        /// Frequency offset in Hz
        #[serde(default)]
        freq_offset: f64,
    },
}

// Default value functions
fn default_name() -> String {
    "zptess".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("zptess.json")
}

fn default_window_size() -> usize {
    75
}

fn default_nrounds() -> u32 {
    5
}

fn default_method() -> CentralTendency {
    CentralTendency::Median
}

fn default_zp_fict() -> f64 {
    20.50
}

fn default_ref_zero_point() -> f64 {
    20.44
}

fn default_channel_capacity() -> usize {
    4
}

fn default_info_timeout() -> u64 {
    5
}

fn default_max_frame_bytes() -> usize {
    256
}

fn default_offline_policy() -> OfflinePolicy {
    OfflinePolicy::Suppress
}

fn default_kind() -> CalibrationKind {
    CalibrationKind::Auto
}

fn default_model() -> String {
    "TESS-W".to_string()
}

fn default_sensor() -> String {
    "TSL237".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            nrounds: default_nrounds(),
            central: default_method(),
            freq_method: default_method(),
            zp_method: default_method(),
            zp_offset: 0.0,
            zp_fict: default_zp_fict(),
            ref_zero_point: default_ref_zero_point(),
            channel_capacity: default_channel_capacity(),
            info_timeout_secs: default_info_timeout(),
            silence_timeout_secs: None,
            max_frame_bytes: default_max_frame_bytes(),
            update_device: false,
            reprovision: false,
            offline_policy: default_offline_policy(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            calibration: default_kind(),
            details: CalibrationMetadata::default(),
        }
    }
}

impl SessionConfig {
    /// Timeout of the device info request
    pub fn info_timeout(&self) -> Duration {
        Duration::from_secs(self.info_timeout_secs)
    }

    /// Silence after which an empty round is recorded
    pub fn silence_timeout(&self) -> Option<Duration> {
        self.silence_timeout_secs.map(Duration::from_secs)
    }
}

impl ZptessConfig {
    /// Load configuration from config/zptess.toml and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/zptess.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ZPTESS_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Device configuration for `role`
    pub fn device(&self, role: Role) -> &DeviceConfig {
        match role {
            Role::Ref => &self.reference,
            Role::Test => &self.test,
        }
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(ZptessError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let session = &self.session;
        if session.window_size == 0 {
            return invalid("window_size must be greater than 0".to_string());
        }
        if session.nrounds == 0 {
            return invalid("nrounds must be greater than 0".to_string());
        }
        if session.channel_capacity == 0 {
            return invalid("channel_capacity must be greater than 0".to_string());
        }
        if session.max_frame_bytes < 16 {
            return invalid(format!(
                "max_frame_bytes {} is too small to hold a reading",
                session.max_frame_bytes
            ));
        }
        if !session.zp_offset.is_finite() || !session.zp_fict.is_finite() {
            return invalid("zp_offset and zp_fict must be finite numbers".to_string());
        }

        if self.reference.endpoint == self.test.endpoint {
            return invalid(format!(
                "ref and test share the same endpoint {}",
                self.test.endpoint
            ));
        }

        if matches!(self.reference.info, InfoConfig::Html { ref host } if host.is_empty())
            || matches!(self.test.info, InfoConfig::Html { ref host } if host.is_empty())
        {
            return invalid("html info source needs a host".to_string());
        }

        Ok(())
    }
}

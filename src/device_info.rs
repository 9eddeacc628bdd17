//! One-shot photometer identity exchange.
//!
//! TESS-W units serve a human-oriented configuration page at `http://<host>/config`
//! which is scraped for name, MAC, zero point, frequency offset, firmware and model.
//! The same web server accepts a new zero point at `/setconst?cons=NN.NN` and echoes
//! `New Zero Point NN.NN` on success. Units without a web server (typically the
//! serial reference) use a fixed identity from configuration instead.

use crate::config::{DeviceConfig, InfoConfig};
use crate::error::{AppResult, ZptessError};
use crate::model::{Photometer, Role};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

/// Firmware builds known to misreport their configuration.
pub const CONFLICTIVE_FIRMWARE: &[&str] = &["Nov 25 2021 v 3.2"];

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(stars\d+)").expect("Invalid name regex"));
static MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"MAC: ((?:[0-9A-Fa-f]{1,2}:){5}[0-9A-Fa-f]{1,2})").expect("Invalid MAC regex")
});
static ZP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:ZP|CI): (\d{1,2}\.\d{1,2})").expect("Invalid ZP regex"));
static OFFSET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Offset mHz: (\d{1,2}\.\d{1,2})").expect("Invalid offset regex")
});
static FIRMWARE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Compiled: (.+?)<br>").expect("Invalid firmware regex"));
static MODEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([-0-9A-Z]+)\s+Settings\.").expect("Invalid model regex"));
static FLASH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"New Zero Point (\d{1,2}\.\d{1,2})").expect("Invalid flash regex")
});

/// Where a role's identity comes from.
#[derive(Debug, Clone)]
pub enum InfoSource {
    /// Scrape the unit's web pages.
    Html {
        host: String,
        model: String,
        sensor: String,
        client: reqwest::Client,
    },
    /// Identity fixed in configuration.
    Static(Photometer),
}

impl InfoSource {
    /// Builds the source described by a device's configuration.
    pub fn from_config(device: &DeviceConfig) -> AppResult<Self> {
        match &device.info {
            InfoConfig::Html { host } => Ok(InfoSource::Html {
                host: host.clone(),
                model: device.model.clone(),
                sensor: device.sensor.clone(),
                client: reqwest::Client::builder().build()?,
            }),
            InfoConfig::Static {
                name,
                mac,
                firmware,
                zero_point,
                freq_offset,
            } => Ok(InfoSource::Static(Photometer {
                name: name.clone(),
                mac: normalize_mac(mac).unwrap_or_else(|| mac.to_uppercase()),
                model: device.model.clone(),
                sensor: device.sensor.clone(),
                firmware: firmware.clone(),
                zero_point: *zero_point,
                freq_offset: *freq_offset,
            })),
        }
    }

    /// Fetches the photometer identity, giving up after `timeout`.
    pub async fn fetch(&self, role: Role, timeout: Duration) -> AppResult<Photometer> {
        let photometer = tokio::time::timeout(timeout, self.fetch_inner(role))
            .await
            .map_err(|_| ZptessError::MetadataTimeout(role))??;
        info!(
            %role,
            name = %photometer.name,
            mac = %photometer.mac,
            zp = photometer.zero_point,
            firmware = %photometer.firmware,
            "Photometer identified"
        );
        Ok(photometer)
    }

    async fn fetch_inner(&self, role: Role) -> AppResult<Photometer> {
        match self {
            InfoSource::Static(photometer) => Ok(photometer.clone()),
            InfoSource::Html {
                host,
                model,
                sensor,
                client,
            } => {
                let url = format!("http://{}/config", host);
                info!(%role, %url, "Requesting photometer info");
                let page = client
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                parse_config_page(role, &page, model, sensor)
            }
        }
    }

    /// Writes `zero_point` to the device and returns the value it confirmed.
    pub async fn write_zero_point(
        &self,
        role: Role,
        zero_point: f64,
        timeout: Duration,
    ) -> AppResult<f64> {
        let (host, client) = match self {
            InfoSource::Html { host, client, .. } => (host, client),
            InfoSource::Static(_) => {
                return Err(ZptessError::Metadata {
                    role,
                    reason: "static identity cannot store a zero point".to_string(),
                })
            }
        };
        let url = format!("http://{}/setconst", host);
        let cons = format!("{:.2}", zero_point);
        info!(%role, %url, zp = %cons, "Writing zero point to photometer");

        let request = client.get(&url).query(&[("cons", cons.as_str())]).send();
        let page = tokio::time::timeout(timeout, async {
            request.await?.error_for_status()?.text().await
        })
        .await
        .map_err(|_| ZptessError::MetadataTimeout(role))??;

        let confirmed = FLASH_RE
            .captures(&page)
            .and_then(|c| c[1].parse::<f64>().ok())
            .ok_or_else(|| ZptessError::Metadata {
                role,
                reason: "zero point not written".to_string(),
            })?;
        Ok(confirmed)
    }
}

/// Extracts a photometer identity from the `/config` page.
pub fn parse_config_page(
    role: Role,
    page: &str,
    default_model: &str,
    sensor: &str,
) -> AppResult<Photometer> {
    let missing = |what: &str| ZptessError::Metadata {
        role,
        reason: format!("{} not found in config page", what),
    };

    let name = NAME_RE
        .captures(page)
        .map(|c| c[1].to_string())
        .ok_or_else(|| missing("name"))?;
    let mac = MAC_RE
        .captures(page)
        .and_then(|c| normalize_mac(&c[1]))
        .ok_or_else(|| missing("MAC"))?;
    let zero_point = ZP_RE
        .captures(page)
        .and_then(|c| c[1].parse::<f64>().ok())
        .ok_or_else(|| missing("zero point"))?;
    let firmware = FIRMWARE_RE
        .captures(page)
        .map(|c| c[1].trim().to_string())
        .ok_or_else(|| missing("firmware"))?;

    if CONFLICTIVE_FIRMWARE.contains(&firmware.as_str()) {
        warn!(%role, %firmware, "Firmware is known to be conflictive");
    }

    let freq_offset = match OFFSET_RE
        .captures(page)
        .and_then(|c| c[1].parse::<f64>().ok())
    {
        Some(mhz) => mhz / 1000.0,
        None => {
            warn!(%role, "Frequency offset not found, defaults to 0.0 mHz");
            0.0
        }
    };
    let model = match MODEL_RE.captures(page) {
        Some(c) => c[1].to_string(),
        None => {
            warn!(%role, "Model not found, defaults to {}", default_model);
            default_model.to_string()
        }
    };

    Ok(Photometer {
        name,
        mac,
        model,
        sensor: sensor.to_string(),
        firmware,
        zero_point,
        freq_offset,
    })
}

/// Upper-case, zero-padded `XX:XX:XX:XX:XX:XX`. `None` if not six hex octets.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let octets: Vec<String> = mac
        .trim()
        .split(':')
        .map(|part| u8::from_str_radix(part, 16).ok().map(|b| format!("{:02X}", b)))
        .collect::<Option<_>>()?;
    (octets.len() == 6).then(|| octets.join(":"))
}

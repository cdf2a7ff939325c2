//! Vendor API client: device discovery and screen-variable pushes.
//!
//! Works against the vendor cloud or a self-hosted server; the two expose
//! the same surface, so switching is a matter of pointing `base_url` at the
//! other host. The core only needs two calls from the whole vendor API:
//! `list_devices` for discovery and `update_variables` to hand the device's
//! fetch URL and rotating token to the plugin that drives the display.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CloudConfig;
use crate::device::{battery_percent_from_mv, Device, DisplayClass};
use crate::error::Error;

/// Request timeout for vendor API calls.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Variables pushed into the display plugin on every rotation or capture.
///
/// The plugin template interpolates these to build the device's next fetch:
/// `image_url` already carries the current token, and `token_expires` lets
/// the plugin surface staleness without parsing the token itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScreenVars {
    /// Public fetch URL for the device image, token included
    pub image_url: String,
    /// Current bearer token for the device
    pub auth_token: String,
    /// When the token stops validating
    pub token_expires: DateTime<Utc>,
    /// When these variables were pushed
    pub last_updated: DateTime<Utc>,
    /// Device the variables belong to
    pub device_id: String,
}

#[derive(Debug, Serialize)]
struct MergePayload<'a> {
    merge_variables: &'a ScreenVars,
}

#[derive(Debug, Deserialize)]
struct DevicesEnvelope {
    #[serde(default)]
    devices: Vec<DeviceWire>,
}

/// Device record as the vendor API spells it.
#[derive(Debug, Deserialize)]
struct DeviceWire {
    id: String,
    #[serde(default)]
    name: String,
    /// Panel width; the standard panel when absent
    #[serde(default = "default_panel_width")]
    width: u32,
    /// Panel height; the standard panel when absent
    #[serde(default = "default_panel_height")]
    height: u32,
    /// Palette size for color panels; absent or <= 2 means monochrome
    #[serde(default)]
    colors: Option<u8>,
    #[serde(default)]
    battery_voltage: Option<f64>,
    #[serde(default)]
    rssi: Option<i32>,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
}

fn default_panel_width() -> u32 {
    800
}

fn default_panel_height() -> u32 {
    480
}

impl From<DeviceWire> for Device {
    fn from(wire: DeviceWire) -> Self {
        let display = match wire.colors {
            Some(colors) if colors > 2 => DisplayClass::Color { colors },
            _ => DisplayClass::Monochrome,
        };
        let mut device = Device::new(wire.id, display, wire.width, wire.height);
        device.name = wire.name;
        device.battery_percent = wire
            .battery_voltage
            .map(|v| battery_percent_from_mv((v * 1000.0) as u32));
        device.rssi = wire.rssi;
        device.last_seen = wire.last_seen;
        device
    }
}

/// Client for the vendor cloud or self-hosted API.
///
/// # Example
///
/// ```rust,no_run
/// use inkboard::client::CloudClient;
/// use inkboard::config::CloudConfig;
///
/// # async fn example(config: &CloudConfig) -> Result<(), inkboard::Error> {
/// let client = CloudClient::new(config);
/// let devices = client.list_devices().await?;
/// println!("found {} devices", devices.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    api_key: String,
    plugin_id: String,
    base_url: String,
}

impl CloudClient {
    /// Create a client from the cloud section of the configuration.
    pub fn new(config: &CloudConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            api_key: config.api_key.clone(),
            plugin_id: config.plugin_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Set a custom base URL (useful for testing).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set a custom HTTP client.
    #[must_use]
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// The plugin the client pushes variables into.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Fetch the account's device list.
    pub async fn list_devices(&self) -> Result<Vec<Device>, Error> {
        let url = format!("{}/devices", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, body });
        }

        let envelope: DevicesEnvelope = response.json().await?;
        let devices: Vec<Device> = envelope.devices.into_iter().map(Device::from).collect();
        tracing::debug!(count = devices.len(), "discovered devices");
        Ok(devices)
    }

    /// Push screen variables into the display plugin.
    ///
    /// Called on every proactive token rotation and after manual pushes, so
    /// the device's next fetch cycle uses the fresh URL and token.
    pub async fn update_variables(&self, vars: &ScreenVars) -> Result<(), Error> {
        let url = format!("{}/custom_plugins/{}", self.base_url, self.plugin_id);
        let payload = MergePayload {
            merge_variables: vars,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, body });
        }

        tracing::info!(device_id = %vars.device_id, "pushed screen variables");
        Ok(())
    }
}

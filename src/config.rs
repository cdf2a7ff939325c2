//! Application configuration.
//!
//! Loaded once at startup from YAML and validated before anything else runs.
//! Every failure here is fatal by design: a bad secret or an unreachable
//! browser binary must stop the process, not surface later as per-capture
//! errors.
//!
//! # Example configuration
//!
//! ```yaml
//! dashboard_base_url: "http://controller.local:8123"
//! public_base_url: "https://home.example.net"
//! session_secret: "f3b1c9a04e5d6f7a8b9c0d1e2f304152"
//!
//! token:
//!   ttl_hours: 24
//!   rotation_lead_hours: 6
//!
//! capture:
//!   timeout_ms: 10000
//!   worker_slots: 2
//!
//! defaults:
//!   dashboard_path: "/dash/eink"
//!   theme: "eink-light"
//!
//! devices:
//!   - id: "kitchen"
//!     display: { kind: monochrome }
//!     width: 800
//!     height: 480
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::{CaptureRequest, CaptureSettings, ChromeRenderer, RetryPolicy};
use crate::device::Device;
use crate::error::Error;
use crate::token::TokenManager;
use crate::transform::{DitherKind, Margins, Orientation};

/// Minimum accepted session secret length in bytes.
const MIN_SECRET_LEN: usize = 16;

/// The HMAC key material, wrapped so it cannot leak through `Debug` output
/// or a serialized configuration view.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct SessionSecret(String);

impl SessionSecret {
    /// Construct from raw key material.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Borrow the key material. Only the token manager should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(redacted)")
    }
}

/// Token lifetime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Token lifetime in hours
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    /// Hours before expiry at which the rotation sweep reissues
    #[serde(default = "default_rotation_lead_hours")]
    pub rotation_lead_hours: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            rotation_lead_hours: default_rotation_lead_hours(),
        }
    }
}

/// Capture limits and browser settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Overall deadline per browser attempt, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Virtual time budget granted to the page before the screenshot
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Concurrent browser instances across all devices
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
    /// Queued captures allowed per device beyond the one in flight
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Canvas area limit per request, in pixels
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,
    /// Browser binary; falls back to `CHROME_PATH`, then `google-chrome`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<String>,
    /// Scratch directory for per-capture files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            settle_ms: default_settle_ms(),
            worker_slots: default_worker_slots(),
            queue_depth: default_queue_depth(),
            max_pixels: default_max_pixels(),
            chrome_path: None,
            temp_dir: default_temp_dir(),
        }
    }
}

impl CaptureConfig {
    /// Resolve the browser binary path.
    pub fn chrome_path(&self) -> String {
        self.chrome_path
            .clone()
            .or_else(|| std::env::var("CHROME_PATH").ok())
            .unwrap_or_else(|| "google-chrome".to_string())
    }
}

/// Delivery endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Listen address for the image endpoint
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// `max-age` on served images, short because content changes per schedule
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cache_max_age_secs: default_cache_max_age_secs(),
        }
    }
}

/// Vendor cloud (or self-hosted) endpoint credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Account API key
    pub api_key: String,
    /// Plugin to push image URL and token variables into
    pub plugin_id: String,
    /// API base; point at the self-hosted server to switch variants
    #[serde(default = "default_cloud_base_url")]
    pub base_url: String,
}

/// Per-device defaults applied when a trigger carries no explicit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureDefaults {
    /// Dashboard path below the base URL
    #[serde(default = "default_dashboard_path")]
    pub dashboard_path: String,
    /// Theme name, applied via query parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    /// Panel orientation
    #[serde(default)]
    pub orientation: Orientation,
    /// Fine rotation in degrees
    #[serde(default)]
    pub rotation_deg: f32,
    /// Horizontal content offset
    #[serde(default)]
    pub offset_x: i32,
    /// Vertical content offset
    #[serde(default)]
    pub offset_y: i32,
    /// Margin insets
    #[serde(default)]
    pub margins: Margins,
    /// Dithering algorithm
    #[serde(default)]
    pub dither: DitherKind,
}

impl Default for CaptureDefaults {
    fn default() -> Self {
        Self {
            dashboard_path: default_dashboard_path(),
            theme: None,
            orientation: Orientation::default(),
            rotation_deg: 0.0,
            offset_x: 0,
            offset_y: 0,
            margins: Margins::default(),
            dither: DitherKind::default(),
        }
    }
}

impl CaptureDefaults {
    /// Build a full request for a device from these defaults.
    ///
    /// The canvas is sized so the oriented output lands exactly on the
    /// device's native resolution.
    pub fn request_for(&self, device: &Device) -> CaptureRequest {
        let (width, height) = self.orientation.canvas_size(device.width, device.height);
        CaptureRequest {
            dashboard_path: self.dashboard_path.clone(),
            theme: self.theme.clone(),
            width,
            height,
            orientation: self.orientation,
            rotation_deg: self.rotation_deg,
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            margins: self.margins,
            dither: self.dither,
        }
    }
}

/// Whole-process configuration, immutable after startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Controller base URL the browser navigates to
    pub dashboard_base_url: String,
    /// Externally reachable base URL used in image links handed to the cloud
    pub public_base_url: String,
    /// HMAC key for token signing; never logged, never rotated at runtime
    pub session_secret: SessionSecret,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Vendor API credentials; omit to run delivery-endpoint-only
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
    #[serde(default)]
    pub defaults: CaptureDefaults,
    /// Seed devices, merged with discovery results
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: AppConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid config YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that must hold before startup proceeds.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, url) in [
            ("dashboard_base_url", &self.dashboard_base_url),
            ("public_base_url", &self.public_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(Error::Config(format!("{name} must be an http(s) URL")));
            }
        }
        if self.session_secret.expose().len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "session_secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.token.ttl_hours <= 0
            || self.token.rotation_lead_hours <= 0
            || self.token.rotation_lead_hours >= self.token.ttl_hours
        {
            return Err(Error::Config(
                "token.rotation_lead_hours must be positive and below token.ttl_hours".to_string(),
            ));
        }
        if self.capture.worker_slots == 0 {
            return Err(Error::Config("capture.worker_slots must be at least 1".to_string()));
        }
        if self.capture.timeout_ms == 0 {
            return Err(Error::Config("capture.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Build the token manager from this configuration.
    pub fn token_manager(&self) -> Result<TokenManager, Error> {
        TokenManager::new(
            self.session_secret.expose(),
            self.token.ttl_hours,
            self.token.rotation_lead_hours,
        )
    }

    /// Orchestrator settings derived from this configuration.
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            base_url: self.dashboard_base_url.clone(),
            timeout: Duration::from_millis(self.capture.timeout_ms),
            worker_slots: self.capture.worker_slots,
            queue_depth: self.capture.queue_depth,
            max_pixels: self.capture.max_pixels,
            retry: RetryPolicy::default(),
        }
    }

    /// Headless browser renderer derived from this configuration.
    pub fn chrome_renderer(&self) -> ChromeRenderer {
        ChromeRenderer::new(
            self.capture.chrome_path(),
            self.capture.temp_dir.clone(),
            self.capture.settle_ms,
        )
    }

    /// Public fetch URL for a device image under a given token.
    pub fn image_url(&self, device_id: &str, token: &str) -> String {
        format!(
            "{}/image/{}?token={}",
            self.public_base_url.trim_end_matches('/'),
            device_id,
            token
        )
    }

    /// Secret-free view served over the control channel.
    pub fn view(&self) -> ConfigView {
        ConfigView {
            dashboard_base_url: self.dashboard_base_url.clone(),
            public_base_url: self.public_base_url.clone(),
            token: self.token.clone(),
            capture: self.capture.clone(),
            delivery: self.delivery.clone(),
            defaults: self.defaults.clone(),
            cloud_configured: self.cloud.is_some(),
        }
    }
}

/// What `get_config` exposes. Carries no secret material.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub dashboard_base_url: String,
    pub public_base_url: String,
    pub token: TokenConfig,
    pub capture: CaptureConfig,
    pub delivery: DeliveryConfig,
    pub defaults: CaptureDefaults,
    pub cloud_configured: bool,
}

fn default_ttl_hours() -> i64 {
    24
}
fn default_rotation_lead_hours() -> i64 {
    6
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_settle_ms() -> u64 {
    750
}
fn default_worker_slots() -> usize {
    2
}
fn default_queue_depth() -> usize {
    2
}
fn default_max_pixels() -> u64 {
    4_000_000
}
fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/inkboard")
}
fn default_bind_addr() -> String {
    "0.0.0.0:2342".to_string()
}
fn default_cache_max_age_secs() -> u32 {
    60
}
fn default_cloud_base_url() -> String {
    "https://usetrmnl.com/api".to_string()
}
fn default_dashboard_path() -> String {
    "/".to_string()
}

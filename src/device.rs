//! Device model and registry.
//!
//! Devices are created by discovery against the vendor API (or seeded from
//! configuration) and are read-only to the capture core. The registry is the
//! single lookup table shared by the orchestrator, the control channel and
//! the rotation sweep.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// LiPo battery minimum voltage (0%)
pub const BATTERY_MIN_MV: u32 = 3000;

/// LiPo battery maximum voltage (100%)
pub const BATTERY_MAX_MV: u32 = 4200;

/// Panel class of a display, closed over the two families we quantize for.
///
/// The quantization stage dispatches on this variant. There is deliberately
/// no open-ended trait here: a panel is either bilevel or it has a bounded
/// indexed palette.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayClass {
    /// 1-bit panel, dithered
    Monochrome,
    /// Indexed-color panel with a fixed number of supported colors
    Color {
        /// Number of palette entries the panel can show
        colors: u8,
    },
}

/// One physical e-ink display.
///
/// Battery and signal readings are informational only. They are surfaced to
/// sensor consumers but never influence capture decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Opaque device identifier
    pub id: String,

    /// Friendly name
    #[serde(default)]
    pub name: String,

    /// Panel class, fixed per device
    pub display: DisplayClass,

    /// Native panel width in pixels
    pub width: u32,

    /// Native panel height in pixels
    pub height: u32,

    /// Battery charge (0-100), if the device reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,

    /// WiFi signal strength in dBm, if the device reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,

    /// Last time the vendor API saw the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// Create a device with the given id, class and native resolution.
    pub fn new(id: impl Into<String>, display: DisplayClass, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            display,
            width,
            height,
            battery_percent: None,
            rssi: None,
            last_seen: None,
        }
    }

    /// Set the friendly name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Native panel resolution as (width, height).
    pub fn native_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether the battery reading is low enough to be worth surfacing.
    pub fn battery_low(&self) -> bool {
        matches!(self.battery_percent, Some(p) if p < 20)
    }
}

/// Convert battery voltage (in millivolts) to percentage.
///
/// Uses the standard LiPo voltage curve: 3.0V (0%) to 4.2V (100%). Devices
/// that report a raw voltage instead of a percentage go through this on the
/// way into [`Device::battery_percent`].
pub fn battery_percent_from_mv(voltage_mv: u32) -> u8 {
    if voltage_mv <= BATTERY_MIN_MV {
        0
    } else if voltage_mv >= BATTERY_MAX_MV {
        100
    } else {
        ((voltage_mv - BATTERY_MIN_MV) * 100 / (BATTERY_MAX_MV - BATTERY_MIN_MV)) as u8
    }
}

/// Shared, read-mostly table of known devices.
///
/// Discovery (an external collaborator) writes through [`DeviceRegistry::sync`]
/// or [`DeviceRegistry::upsert`]; everything else only reads.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<HashMap<String, Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a single device.
    pub fn upsert(&self, device: Device) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(device.id.clone(), device);
    }

    /// Replace the registry contents with a freshly discovered device list.
    ///
    /// Devices absent from `devices` are dropped; a display that no longer
    /// exists upstream should not keep receiving captures.
    pub fn sync(&self, devices: Vec<Device>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
        for device in devices {
            map.insert(device.id.clone(), device);
        }
    }

    /// Look up one device by id.
    pub fn get(&self, id: &str) -> Option<Device> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).cloned()
    }

    /// Snapshot of all known devices, ordered by id for stable output.
    pub fn all(&self) -> Vec<Device> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut devices: Vec<Device> = map.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! # inkboard
//!
//! Renders a smart-home dashboard into a panel-ready image for an e-ink
//! display, delivers it over an authenticated HTTP endpoint, and keeps the
//! credentials on that endpoint rotating without manual intervention.
//!
//! The moving parts, in data-flow order:
//!
//! - [`channel`]: control protocol. The controller asks for device lists,
//!   triggers captures, and receives proactive token pushes.
//! - [`capture`]: orchestrates headless-browser captures under per-device
//!   serialization, a global worker-slot cap, retries and fallback images.
//! - [`transform`]: pure pipeline from screenshot bytes to the exact raster
//!   a panel expects (placement, rotation, dithering or palette reduction).
//! - [`store`]: last-published image per device; single writer, many readers.
//! - [`token`]: stateless HMAC-signed fetch tokens with proactive rotation.
//! - [`server`]: the delivery endpoint the vendor fetch cycle pulls from.
//! - [`client`]: the two vendor API calls the core needs, device discovery
//!   and screen-variable pushes.
//! - [`schedule`]: time-of-day capture cadence.
//! - [`config`]: YAML configuration, validated fatally at startup.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use inkboard::{AppConfig, ControlChannel, DeliveryState, ImageStore, Orchestrator};
//! use inkboard::device::DeviceRegistry;
//!
//! let config = Arc::new(AppConfig::load("inkboard.yaml")?);
//! let tokens = config.token_manager()?;
//! let registry = DeviceRegistry::new();
//! registry.sync(config.devices.clone());
//!
//! let renderer = Arc::new(config.chrome_renderer());
//! renderer.probe().await?;
//!
//! let store = ImageStore::new();
//! let orchestrator = Orchestrator::new(
//!     renderer, registry.clone(), store.clone(), config.capture_settings());
//! let channel = Arc::new(ControlChannel::new(
//!     config.clone(), registry, orchestrator, tokens.clone()));
//!
//! inkboard::server::serve(
//!     DeliveryState {
//!         tokens,
//!         store,
//!         cache_max_age_secs: config.delivery.cache_max_age_secs,
//!     },
//!     &config.delivery.bind_addr,
//! )
//! .await?;
//! ```
//!
//! ## Image contract
//!
//! Output dimensions always match the target panel's native resolution, and
//! the transform pipeline is deterministic: the same screenshot bytes and
//! parameters produce byte-identical output, so rendered dashboards can be
//! golden-tested.

pub mod capture;
pub mod channel;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod schedule;
pub mod server;
pub mod store;
pub mod token;
pub mod transform;

pub use capture::{CaptureRequest, CaptureSettings, ChromeRenderer, Orchestrator, Renderer};
pub use channel::{ControlChannel, Push, Request, RequestKind, Response};
pub use client::{CloudClient, ScreenVars};
pub use config::{AppConfig, SessionSecret};
pub use device::{Device, DeviceRegistry, DisplayClass};
pub use error::{AuthError, CaptureError, Error, TransformError};
pub use schedule::CadenceSchedule;
pub use server::DeliveryState;
pub use store::{CaptureOutcome, CaptureStamp, ImageStore, PublishedImage};
pub use token::{Token, TokenManager, ValidatedToken};
pub use transform::{DitherKind, Margins, Orientation, TransformParams};

/// Largest fine rotation angle in degrees, either direction.
pub const MAX_FINE_ROTATION_DEG: f32 = 15.0;

/// Largest center offset in pixels, either direction on either axis.
pub const MAX_CENTER_OFFSET_PX: i32 = 200;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_bounds() {
        assert_eq!(MAX_FINE_ROTATION_DEG, 15.0);
        assert_eq!(MAX_CENTER_OFFSET_PX, 200);
    }
}

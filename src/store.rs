//! Last-published image per device.
//!
//! Single writer (the capture orchestrator), many readers (the delivery
//! endpoint and sensor consumers). A new capture supersedes the previous
//! entry atomically; readers holding the old `Arc` keep a consistent image.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// How a published image came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CaptureOutcome {
    /// A real dashboard render
    Fresh,
    /// The generated placeholder, after capture attempts were exhausted
    Fallback {
        /// Human-readable reason for the last failure
        reason: String,
    },
}

/// Metadata emitted alongside every published image.
///
/// This is the fact stream sensor entities are fed from; the core emits it
/// and never renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureStamp {
    /// When the image was produced
    pub produced_at: DateTime<Utc>,
    /// Capture attempts spent, including the successful one
    pub attempts: u32,
    /// Fresh render or fallback
    pub outcome: CaptureOutcome,
}

impl CaptureStamp {
    /// Whether the published image is a real render.
    pub fn is_fresh(&self) -> bool {
        matches!(self.outcome, CaptureOutcome::Fresh)
    }
}

/// One published, immutable image.
#[derive(Debug)]
pub struct PublishedImage {
    /// Encoded image bytes in the device's fixed format
    pub bytes: Vec<u8>,
    /// MIME type of `bytes`
    pub content_type: &'static str,
    /// Production metadata
    pub stamp: CaptureStamp,
}

/// Shared per-device image cache.
#[derive(Debug, Clone, Default)]
pub struct ImageStore {
    inner: Arc<RwLock<HashMap<String, Arc<PublishedImage>>>>,
}

impl ImageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new image for a device, superseding any previous one.
    pub fn publish(&self, device_id: &str, image: PublishedImage) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(device_id.to_string(), Arc::new(image));
    }

    /// Latest published image for a device, if any capture has completed.
    pub fn latest(&self, device_id: &str) -> Option<Arc<PublishedImage>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(device_id).cloned()
    }

    /// Latest capture stamp for a device.
    pub fn stamp(&self, device_id: &str) -> Option<CaptureStamp> {
        self.latest(device_id).map(|img| img.stamp.clone())
    }
}

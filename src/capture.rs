//! Capture orchestration: browser lifecycle, concurrency limits, retries.
//!
//! One capture turns a dashboard URL into a panel-ready image. The
//! orchestrator enforces two bounds while doing so:
//!
//! - a global worker-slot pool caps concurrent browser instances across all
//!   devices, protecting memory
//! - per-device captures are strictly serialized; a second request for a
//!   device that is already capturing is queued (bounded) or rejected with
//!   [`CaptureError::Busy`] when the caller sets `skip_if_busy`
//!
//! Transient failures are retried on a bounded backoff schedule. When every
//! attempt is exhausted the orchestrator publishes the generated placeholder
//! instead, so the delivery endpoint always has something to serve. Requests
//! never block the caller: [`Orchestrator::trigger`] returns a handle
//! immediately and the capture proceeds on the worker pool.
//!
//! The browser itself sits behind the [`Renderer`] trait. Production uses
//! [`ChromeRenderer`], which drives headless Chrome as an external process;
//! tests substitute scripted renderers.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::timeout;

use crate::device::{Device, DeviceRegistry};
use crate::error::{CaptureError, Error, TransformError};
use crate::store::{CaptureOutcome, CaptureStamp, ImageStore, PublishedImage};
use crate::transform::{self, DitherKind, Margins, Orientation, Rendered, TransformParams};

/// One ask to render a dashboard for a device.
///
/// Created per trigger and consumed immediately; never persisted. Width and
/// height describe the pre-orientation canvas, so after the orientation
/// transpose they must land exactly on the device's native resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Dashboard path below the configured base URL, e.g. `/dash/home`
    pub dashboard_path: String,

    /// Theme name applied via query parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,

    /// Canvas width before orientation
    pub width: u32,

    /// Canvas height before orientation
    pub height: u32,

    /// Panel orientation
    #[serde(default)]
    pub orientation: Orientation,

    /// Fine rotation in degrees (±15.0)
    #[serde(default)]
    pub rotation_deg: f32,

    /// Horizontal content offset in pixels (±200)
    #[serde(default)]
    pub offset_x: i32,

    /// Vertical content offset in pixels (±200)
    #[serde(default)]
    pub offset_y: i32,

    /// Margin insets
    #[serde(default)]
    pub margins: Margins,

    /// Dithering algorithm for quantization
    #[serde(default)]
    pub dither: DitherKind,
}

impl CaptureRequest {
    /// Neutral full-screen request for a device's native resolution.
    pub fn for_device(device: &Device, dashboard_path: impl Into<String>) -> Self {
        Self {
            dashboard_path: dashboard_path.into(),
            theme: None,
            width: device.width,
            height: device.height,
            orientation: Orientation::Landscape,
            rotation_deg: 0.0,
            offset_x: 0,
            offset_y: 0,
            margins: Margins::default(),
            dither: DitherKind::FloydSteinberg,
        }
    }

    /// Validate the request against a device and produce pipeline parameters.
    ///
    /// Geometry violations and canvas/panel mismatches are configuration
    /// errors surfaced synchronously; they are never retried.
    pub fn validate_for(
        &self,
        device: &Device,
        max_pixels: u64,
    ) -> Result<TransformParams, Error> {
        validate_path(&self.dashboard_path)?;

        let oriented = self.orientation.oriented_size(self.width, self.height);
        if oriented != device.native_size() {
            return Err(TransformError::OutOfRange(format!(
                "oriented canvas {}x{} does not match panel {}x{}",
                oriented.0, oriented.1, device.width, device.height
            ))
            .into());
        }

        let params = TransformParams {
            width: self.width,
            height: self.height,
            margins: self.margins,
            offset_x: self.offset_x,
            offset_y: self.offset_y,
            rotation_deg: self.rotation_deg,
            orientation: self.orientation,
            display: device.display,
            dither: self.dither,
        };
        params.validate(max_pixels)?;
        Ok(params)
    }
}

/// Bounded retry schedule for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per further attempt
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// Runtime limits and endpoints for the orchestrator.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Dashboard base URL, e.g. `http://controller.local:8123`
    pub base_url: String,
    /// Overall deadline for one browser attempt
    pub timeout: Duration,
    /// Global cap on concurrent browser instances
    pub worker_slots: usize,
    /// Queued captures allowed per device beyond the one in flight
    pub queue_depth: usize,
    /// Canvas area limit per request
    pub max_pixels: u64,
    /// Retry schedule
    pub retry: RetryPolicy,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8123".to_string(),
            timeout: Duration::from_secs(10),
            worker_slots: 2,
            queue_depth: 2,
            max_pixels: 4_000_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Screenshot backend.
///
/// Implementations navigate to `url`, wait for render stability, and return
/// encoded screenshot bytes at the requested viewport. The deadline covers
/// the whole attempt including navigation.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render one page to image bytes.
    async fn render(
        &self,
        url: &str,
        viewport: (u32, u32),
        deadline: Duration,
    ) -> Result<Vec<u8>, CaptureError>;
}

/// Headless Chrome renderer.
///
/// Runs the browser as a short-lived external process per capture, the same
/// way a cron-driven screenshot script would: one profile directory and one
/// screenshot file per attempt, removed afterwards. Render stability comes
/// from Chrome's virtual time budget, which lets the page run its load and
/// settle work before the screenshot is taken.
pub struct ChromeRenderer {
    chrome_path: String,
    temp_dir: PathBuf,
    settle_ms: u64,
    seq: AtomicU64,
}

impl ChromeRenderer {
    /// Create a renderer.
    ///
    /// `chrome_path` is the browser binary, `temp_dir` holds per-capture
    /// scratch space, `settle_ms` is the virtual time budget granted to the
    /// page before the screenshot.
    pub fn new(chrome_path: impl Into<String>, temp_dir: impl Into<PathBuf>, settle_ms: u64) -> Self {
        Self {
            chrome_path: chrome_path.into(),
            temp_dir: temp_dir.into(),
            settle_ms,
            seq: AtomicU64::new(0),
        }
    }

    /// Verify the browser binary is runnable.
    ///
    /// Call once at startup; a missing browser is fatal there, not at
    /// capture time.
    pub async fn probe(&self) -> Result<(), Error> {
        let output = Command::new(&self.chrome_path)
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                Error::Config(format!(
                    "browser binary '{}' is not runnable: {e}",
                    self.chrome_path
                ))
            })?;
        if !output.status.success() {
            return Err(Error::Config(format!(
                "browser binary '{}' exited with {}",
                self.chrome_path, output.status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(
        &self,
        url: &str,
        viewport: (u32, u32),
        deadline: Duration,
    ) -> Result<Vec<u8>, CaptureError> {
        let capture_dir = self
            .temp_dir
            .join(format!("capture-{:06}", self.seq.fetch_add(1, Ordering::Relaxed)));
        let profile_dir = capture_dir.join("profile");
        let shot_path = capture_dir.join("screenshot.png");

        tokio::fs::create_dir_all(&profile_dir)
            .await
            .map_err(|e| CaptureError::BrowserCrashed(format!("scratch dir: {e}")))?;

        let mut cmd = Command::new(&self.chrome_path);
        cmd.arg("--headless=new")
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--force-device-scale-factor=1")
            .arg("--hide-scrollbars")
            .arg("--default-background-color=ffffffff")
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg(format!("--window-size={},{}", viewport.0, viewport.1))
            .arg(format!("--virtual-time-budget={}", self.settle_ms))
            .arg(format!("--screenshot={}", shot_path.display()))
            .arg(url)
            .kill_on_drop(true);

        let result = match timeout(deadline, cmd.output()).await {
            Err(_) => Err(CaptureError::RenderTimeout),
            Ok(Err(e)) => Err(CaptureError::BrowserCrashed(format!(
                "failed to run browser: {e}"
            ))),
            Ok(Ok(output)) => {
                if output.status.code().is_none() {
                    Err(CaptureError::BrowserCrashed(
                        "browser terminated by signal".to_string(),
                    ))
                } else {
                    if !output.status.success() {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        tracing::warn!(status = %output.status, "browser stderr: {}", stderr);
                    }
                    match tokio::fs::read(&shot_path).await {
                        Ok(bytes) => Ok(bytes),
                        // Chrome exits zero even when navigation failed; the
                        // missing screenshot is the reliable signal.
                        Err(_) => Err(CaptureError::NavigationTimeout),
                    }
                }
            }
        };

        let _ = tokio::fs::remove_dir_all(&capture_dir).await;
        result
    }
}

/// Completion handle for one accepted capture.
///
/// Dropping the handle does not cancel the capture; the result is published
/// to the store either way.
#[derive(Debug)]
pub struct CaptureHandle {
    rx: oneshot::Receiver<CaptureStamp>,
}

impl CaptureHandle {
    /// Wait for the capture to publish and return its stamp.
    pub async fn wait(self) -> Option<CaptureStamp> {
        self.rx.await.ok()
    }
}

#[derive(Default)]
struct Lane {
    capturing: bool,
    queue: VecDeque<Queued>,
}

struct Queued {
    device: Device,
    request: CaptureRequest,
    params: TransformParams,
    tx: oneshot::Sender<CaptureStamp>,
}

struct Inner {
    renderer: Arc<dyn Renderer>,
    registry: DeviceRegistry,
    store: ImageStore,
    settings: CaptureSettings,
    slots: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, Lane>>,
}

/// Drives captures end to end and publishes results.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator over a renderer, device registry and store.
    pub fn new(
        renderer: Arc<dyn Renderer>,
        registry: DeviceRegistry,
        store: ImageStore,
        settings: CaptureSettings,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(settings.worker_slots.max(1)));
        Self {
            inner: Arc::new(Inner {
                renderer,
                registry,
                store,
                settings,
                slots,
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The store this orchestrator publishes into.
    pub fn store(&self) -> &ImageStore {
        &self.inner.store
    }

    /// Accept a capture request for a device.
    ///
    /// Validation failures and `Busy` are returned synchronously; everything
    /// after acceptance happens on the worker pool. With `skip_if_busy` a
    /// device already capturing rejects immediately; otherwise the request
    /// joins that device's bounded queue and `Busy` only fires on overflow.
    pub fn trigger(
        &self,
        device_id: &str,
        request: CaptureRequest,
        skip_if_busy: bool,
    ) -> Result<CaptureHandle, Error> {
        let device = self
            .inner
            .registry
            .get(device_id)
            .ok_or_else(|| Error::Request(format!("unknown device: {device_id}")))?;
        let params = request.validate_for(&device, self.inner.settings.max_pixels)?;

        let (tx, rx) = oneshot::channel();
        let accepted = {
            let mut lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
            let lane = lanes.entry(device.id.clone()).or_default();
            if lane.capturing {
                if skip_if_busy {
                    return Err(CaptureError::Busy.into());
                }
                if lane.queue.len() >= self.inner.settings.queue_depth {
                    return Err(CaptureError::Busy.into());
                }
                lane.queue.push_back(Queued {
                    device,
                    request,
                    params,
                    tx,
                });
                tracing::debug!(device_id, "capture queued behind one in flight");
                None
            } else {
                lane.capturing = true;
                Some(Queued {
                    device,
                    request,
                    params,
                    tx,
                })
            }
        };

        if let Some(queued) = accepted {
            spawn_capture(self.inner.clone(), queued);
        }
        Ok(CaptureHandle { rx })
    }
}

fn spawn_capture(inner: Arc<Inner>, queued: Queued) {
    tokio::spawn(run_capture(inner, queued));
}

async fn run_capture(inner: Arc<Inner>, queued: Queued) {
    let Queued {
        device,
        request,
        params,
        tx,
    } = queued;

    // Worker slot is RAII: released on every exit path, panics included.
    let _permit = inner.slots.clone().acquire_owned().await.ok();

    let (rendered, attempts, outcome) =
        match attempt_with_retries(&inner, &request, &params).await {
            (Ok(rendered), attempts) => (Some(rendered), attempts, CaptureOutcome::Fresh),
            (Err(err), attempts) => {
                tracing::warn!(
                    device_id = %device.id,
                    attempts,
                    error = %err,
                    "capture failed, publishing placeholder"
                );
                let (out_w, out_h) = device.native_size();
                let placeholder =
                    transform::fallback(out_w, out_h, device.display, request.dither);
                (
                    placeholder.ok(),
                    attempts,
                    CaptureOutcome::Fallback {
                        reason: err.to_string(),
                    },
                )
            }
        };

    if let Some(rendered) = rendered {
        let stamp = CaptureStamp {
            produced_at: Utc::now(),
            attempts,
            outcome,
        };
        inner.store.publish(
            &device.id,
            PublishedImage {
                bytes: rendered.bytes,
                content_type: rendered.content_type,
                stamp: stamp.clone(),
            },
        );
        tracing::info!(
            device_id = %device.id,
            fresh = stamp.is_fresh(),
            attempts,
            "published {}x{} image",
            rendered.width,
            rendered.height
        );
        let _ = tx.send(stamp);
    } else {
        // Even the placeholder failed to build; nothing sane to publish.
        tracing::error!(device_id = %device.id, "placeholder synthesis failed");
    }

    let next = {
        let mut lanes = inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lane) = lanes.get_mut(&device.id) {
            lane.capturing = false;
            let next = lane.queue.pop_front();
            if next.is_some() {
                lane.capturing = true;
            }
            next
        } else {
            None
        }
    };
    if let Some(queued) = next {
        spawn_capture(inner, queued);
    }
}

async fn attempt_with_retries(
    inner: &Arc<Inner>,
    request: &CaptureRequest,
    params: &TransformParams,
) -> (Result<Rendered, Error>, u32) {
    let url = dashboard_url(&inner.settings.base_url, request);
    let viewport = (params.width, params.height);
    let policy = inner.settings.retry;

    let mut attempt = 0u32;
    let mut delay = policy.initial_backoff;
    loop {
        attempt += 1;
        let result = async {
            let raw = inner
                .renderer
                .render(&url, viewport, inner.settings.timeout)
                .await?;
            let rendered = transform::transform(&raw, params)?;
            Ok::<Rendered, Error>(rendered)
        }
        .await;

        match result {
            Ok(rendered) => return (Ok(rendered), attempt),
            Err(err) => {
                let transient =
                    matches!(&err, Error::Capture(kind) if kind.is_transient());
                if !transient || attempt >= policy.max_attempts {
                    return (Err(err), attempt);
                }
                tracing::debug!(attempt, error = %err, "capture attempt failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

/// Build the navigation URL for a request.
pub(crate) fn dashboard_url(base_url: &str, request: &CaptureRequest) -> String {
    let mut url = format!(
        "{}{}",
        base_url.trim_end_matches('/'),
        request.dashboard_path
    );
    if let Some(theme) = &request.theme {
        let encoded: String = form_urlencoded::byte_serialize(theme.as_bytes()).collect();
        let joiner = if request.dashboard_path.contains('?') {
            '&'
        } else {
            '?'
        };
        url.push(joiner);
        url.push_str("theme=");
        url.push_str(&encoded);
    }
    url
}

fn validate_path(path: &str) -> Result<(), CaptureError> {
    let reject = |why: &str| {
        Err(CaptureError::InvalidDashboardPath(format!(
            "{why}: {path:?}"
        )))
    };
    if path.is_empty() {
        return reject("empty path");
    }
    if !path.starts_with('/') || path.starts_with("//") {
        return reject("path must be absolute within the dashboard host");
    }
    if path.contains("://") {
        return reject("path must not carry a scheme");
    }
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return reject("path contains whitespace or control characters");
    }
    Ok(())
}

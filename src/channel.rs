//! Control channel between the orchestrating controller and this process.
//!
//! A small JSON message protocol: requests carry a correlation `id` that the
//! response echoes, and the server emits unsolicited pushes (no `id`) for
//! proactive token rotation. The transport is the embedder's concern; this
//! module owns message shapes and handling, so it works the same over a
//! websocket, a unix socket or a test harness.
//!
//! Request kinds: `list_devices`, `trigger_capture`, `get_config`,
//! `generate_token`, `push_variables`. Pushes: `push_token`. A duplicate
//! push is harmless on the receiving side; the token it carries simply
//! validates like the first copy.
//!
//! # Wire examples
//!
//! ```json
//! {"id": 7, "type": "trigger_capture", "device_id": "kitchen", "wait": true}
//! {"id": 7, "success": true, "result": {"stamp": {...}}}
//! {"type": "push_token", "device_id": "kitchen", "token": "ink...", "expires_at": "..."}
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::capture::{CaptureRequest, Orchestrator};
use crate::client::{CloudClient, ScreenVars};
use crate::config::AppConfig;
use crate::device::DeviceRegistry;
use crate::error::{CaptureError, Error};
use crate::token::{Token, TokenManager};

/// One request from the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed in the response
    pub id: u64,
    #[serde(flatten)]
    pub kind: RequestKind,
}

/// What the controller is asking for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestKind {
    /// List known devices with their last capture stamps
    ListDevices,
    /// Capture a dashboard for one device
    TriggerCapture {
        /// Target device
        device_id: String,
        /// Explicit request; the device defaults apply when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<CaptureRequest>,
        /// Reject instead of queueing when the device is already capturing
        #[serde(default)]
        skip_if_busy: bool,
        /// Await the published result instead of returning on acceptance
        #[serde(default)]
        wait: bool,
    },
    /// Secret-free configuration view
    GetConfig,
    /// Mint a fetch token for a device
    GenerateToken {
        /// Target device
        device_id: String,
    },
    /// Push the current image URL and token into the vendor plugin
    PushVariables {
        /// Target device
        device_id: String,
        /// Token authorizing the push; must be scoped to `device_id`
        token: String,
    },
}

/// Response to one request, echoing its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id from the request
    pub id: u64,
    /// Whether the request succeeded
    pub success: bool,
    /// Result body on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error details on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Error category and human-readable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable category, e.g. `busy` or `unauthorized`
    pub code: String,
    /// Description for logs and operators
    pub message: String,
}

impl Response {
    /// Successful response with a result body.
    pub fn result(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response with a category and message.
    pub fn error(id: u64, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Server-initiated message. Carries no correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Push {
    /// A freshly issued token for a device, sent ahead of the old one expiring
    PushToken {
        /// Device the token is scoped to
        device_id: String,
        /// Encoded token string
        token: String,
        /// When the token stops validating
        expires_at: DateTime<Utc>,
    },
}

/// Handles control requests and drives proactive token rotation.
pub struct ControlChannel {
    config: Arc<AppConfig>,
    registry: DeviceRegistry,
    orchestrator: Orchestrator,
    tokens: TokenManager,
    cloud: Option<CloudClient>,
    /// Current token per device, replaced by the rotation sweep
    issued: Mutex<HashMap<String, Token>>,
}

impl ControlChannel {
    /// Create a channel over the shared runtime pieces.
    pub fn new(
        config: Arc<AppConfig>,
        registry: DeviceRegistry,
        orchestrator: Orchestrator,
        tokens: TokenManager,
    ) -> Self {
        let cloud = config.cloud.as_ref().map(CloudClient::new);
        Self {
            config,
            registry,
            orchestrator,
            tokens,
            cloud,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one request and produce its response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id;
        match request.kind {
            RequestKind::ListDevices => self.list_devices(id),
            RequestKind::TriggerCapture {
                device_id,
                request,
                skip_if_busy,
                wait,
            } => {
                self.trigger_capture(id, &device_id, request, skip_if_busy, wait)
                    .await
            }
            RequestKind::GetConfig => Response::result(id, json!(self.config.view())),
            RequestKind::GenerateToken { device_id } => self.generate_token(id, &device_id),
            RequestKind::PushVariables { device_id, token } => {
                self.push_variables(id, &device_id, &token).await
            }
        }
    }

    /// Handle one request in JSON-line form.
    ///
    /// Convenience for byte transports: parses the request, dispatches, and
    /// serializes the response. A request that does not parse gets an
    /// `invalid_format` error echoing whatever `id` could be recovered.
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(err) => {
                let id = serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
                    .unwrap_or(0);
                Response::error(id, "invalid_format", err.to_string())
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"id":0,"success":false,"error":{"code":"internal_error","message":"serialization"}}"#
                .to_string()
        })
    }

    fn list_devices(&self, id: u64) -> Response {
        let store = self.orchestrator.store();
        let devices: Vec<serde_json::Value> = self
            .registry
            .all()
            .into_iter()
            .map(|device| {
                let last_capture = store.stamp(&device.id);
                json!({ "device": device, "last_capture": last_capture })
            })
            .collect();
        Response::result(id, json!({ "devices": devices }))
    }

    async fn trigger_capture(
        &self,
        id: u64,
        device_id: &str,
        request: Option<CaptureRequest>,
        skip_if_busy: bool,
        wait: bool,
    ) -> Response {
        let Some(device) = self.registry.get(device_id) else {
            return Response::error(id, "unknown_device", format!("no device '{device_id}'"));
        };
        let request = request.unwrap_or_else(|| self.config.defaults.request_for(&device));

        match self.orchestrator.trigger(device_id, request, skip_if_busy) {
            Ok(handle) if wait => match handle.wait().await {
                Some(stamp) => Response::result(id, json!({ "stamp": stamp })),
                None => Response::error(id, "internal_error", "capture task dropped"),
            },
            Ok(_) => Response::result(id, json!({ "accepted": true })),
            Err(Error::Capture(CaptureError::Busy)) => {
                Response::error(id, "busy", "capture already in progress for this device")
            }
            Err(err) => Response::error(id, "invalid_request", err.to_string()),
        }
    }

    fn generate_token(&self, id: u64, device_id: &str) -> Response {
        if self.registry.get(device_id).is_none() {
            return Response::error(id, "unknown_device", format!("no device '{device_id}'"));
        }
        let token = self.mint(device_id);
        Response::result(
            id,
            json!({ "token": token.as_str(), "expires_at": token.expires_at }),
        )
    }

    async fn push_variables(&self, id: u64, device_id: &str, token: &str) -> Response {
        let validated = match self.tokens.validate(token) {
            Ok(validated) => validated,
            Err(err) => return Response::error(id, "unauthorized", err.to_string()),
        };
        if validated.device_id != device_id {
            tracing::warn!(
                requested = %device_id,
                scoped_to = %validated.device_id,
                "variable push with a token for the wrong device"
            );
            return Response::error(id, "unauthorized", "token is not valid for this device");
        }

        if let Some(cloud) = &self.cloud {
            let vars = self.screen_vars(device_id, token, validated.expires_at);
            if let Err(err) = cloud.update_variables(&vars).await {
                return Response::error(id, "internal_error", err.to_string());
            }
        }
        Response::result(id, json!({ "success": true }))
    }

    /// Issue fresh tokens where needed and return the pushes to send.
    ///
    /// A device gets a new token when it has none yet or when its current
    /// one is inside the rotation lead. Running the sweep twice in a row is
    /// idempotent: the second pass finds nothing to rotate.
    pub fn rotation_sweep(&self) -> Vec<Push> {
        let mut pushes = Vec::new();
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());

        for device in self.registry.all() {
            let needs_new = match issued.get(&device.id) {
                Some(token) => self.tokens.should_rotate(token),
                None => true,
            };
            if !needs_new {
                continue;
            }
            let token = self.tokens.issue(&device.id);
            tracing::info!(
                device_id = %device.id,
                expires_at = %token.expires_at,
                "rotated device token"
            );
            pushes.push(Push::PushToken {
                device_id: device.id.clone(),
                token: token.as_str().to_string(),
                expires_at: token.expires_at,
            });
            issued.insert(device.id, token);
        }
        pushes
    }

    /// Propagate rotation pushes to the vendor plugin.
    ///
    /// A push that fails upstream is logged and skipped; one device's cloud
    /// trouble must not stall rotation for the rest.
    pub async fn propagate(&self, pushes: &[Push]) {
        let Some(cloud) = &self.cloud else {
            return;
        };
        for push in pushes {
            let Push::PushToken {
                device_id,
                token,
                expires_at,
            } = push;
            let vars = self.screen_vars(device_id, token, *expires_at);
            if let Err(err) = cloud.update_variables(&vars).await {
                tracing::warn!(device_id = %device_id, error = %err, "variable push failed");
            }
        }
    }

    fn mint(&self, device_id: &str) -> Token {
        let token = self.tokens.issue(device_id);
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        issued.insert(device_id.to_string(), token.clone());
        token
    }

    fn screen_vars(&self, device_id: &str, token: &str, expires_at: DateTime<Utc>) -> ScreenVars {
        ScreenVars {
            image_url: self.config.image_url(device_id, token),
            auth_token: token.to_string(),
            token_expires: expires_at,
            last_updated: Utc::now(),
            device_id: device_id.to_string(),
        }
    }
}

/// Periodic rotation driver.
///
/// Each tick runs the sweep, propagates to the vendor plugin, and forwards
/// the pushes to `outbound` for the connected controller. Ends when the
/// receiver is dropped.
pub async fn run_rotation(channel: Arc<ControlChannel>, tick: Duration, outbound: mpsc::Sender<Push>) {
    loop {
        tokio::time::sleep(tick).await;
        let pushes = channel.rotation_sweep();
        channel.propagate(&pushes).await;
        for push in pushes {
            if outbound.send(push).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSettings, Renderer};
    use crate::device::{Device, DisplayClass};
    use crate::error::CaptureError;
    use crate::store::ImageStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use image::{Rgba, RgbaImage};
    use std::io::Cursor;

    const CONFIG: &str = r#"
dashboard_base_url: "http://controller.local:8123"
public_base_url: "https://home.example.net"
session_secret: "f3b1c9a04e5d6f7a8b9c0d1e2f304152"
"#;

    struct StubRenderer {
        delay_ms: u64,
    }

    #[async_trait]
    impl Renderer for StubRenderer {
        async fn render(
            &self,
            _url: &str,
            viewport: (u32, u32),
            _deadline: std::time::Duration,
        ) -> Result<Vec<u8>, CaptureError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            let img = RgbaImage::from_pixel(viewport.0, viewport.1, Rgba([200, 200, 200, 255]));
            let mut out = Cursor::new(Vec::new());
            img.write_to(&mut out, image::ImageFormat::Png).unwrap();
            Ok(out.into_inner())
        }
    }

    fn channel_with(renderer: StubRenderer) -> ControlChannel {
        let config = Arc::new(AppConfig::from_yaml(CONFIG).unwrap());
        let registry = DeviceRegistry::new();
        registry.upsert(Device::new("d1", DisplayClass::Monochrome, 800, 480));
        let orchestrator = Orchestrator::new(
            Arc::new(renderer),
            registry.clone(),
            ImageStore::new(),
            CaptureSettings::default(),
        );
        let tokens = config.token_manager().unwrap();
        ControlChannel::new(config, registry, orchestrator, tokens)
    }

    fn channel() -> ControlChannel {
        channel_with(StubRenderer { delay_ms: 0 })
    }

    #[test]
    fn test_request_wire_format() {
        let request: Request = serde_json::from_str(
            r#"{"id": 7, "type": "trigger_capture", "device_id": "d1", "wait": true}"#,
        )
        .unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(
            request.kind,
            RequestKind::TriggerCapture {
                device_id: "d1".to_string(),
                request: None,
                skip_if_busy: false,
                wait: true,
            }
        );

        let request: Request =
            serde_json::from_str(r#"{"id": 1, "type": "list_devices"}"#).unwrap();
        assert_eq!(request.kind, RequestKind::ListDevices);
    }

    #[test]
    fn test_push_carries_no_correlation_id() {
        let push = Push::PushToken {
            device_id: "d1".to_string(),
            token: "ink.abc.def".to_string(),
            expires_at: "2026-08-06T12:00:00Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json["type"], "push_token");
        assert_eq!(json["device_id"], "d1");
        assert!(json.get("id").is_none());
    }

    #[tokio::test]
    async fn test_correlation_id_is_echoed() {
        let channel = channel();
        let response = channel
            .handle(Request {
                id: 42,
                kind: RequestKind::ListDevices,
            })
            .await;

        assert_eq!(response.id, 42);
        assert!(response.success);
        let devices = &response.result.unwrap()["devices"];
        assert_eq!(devices.as_array().unwrap().len(), 1);
        assert_eq!(devices[0]["device"]["id"], "d1");
        assert!(devices[0]["last_capture"].is_null());
    }

    #[tokio::test]
    async fn test_trigger_capture_wait_returns_stamp() {
        let channel = channel();
        let response = channel
            .handle(Request {
                id: 5,
                kind: RequestKind::TriggerCapture {
                    device_id: "d1".to_string(),
                    request: None,
                    skip_if_busy: false,
                    wait: true,
                },
            })
            .await;

        assert!(response.success, "{:?}", response.error);
        let stamp = &response.result.unwrap()["stamp"];
        assert_eq!(stamp["outcome"]["kind"], "fresh");
        assert_eq!(stamp["attempts"], 1);

        // The image is published and listed.
        let listed = channel
            .handle(Request {
                id: 6,
                kind: RequestKind::ListDevices,
            })
            .await;
        let devices = &listed.result.unwrap()["devices"];
        assert_eq!(devices[0]["last_capture"]["outcome"]["kind"], "fresh");
    }

    #[tokio::test]
    async fn test_trigger_capture_accepts_without_wait() {
        let channel = channel();
        let response = channel
            .handle(Request {
                id: 9,
                kind: RequestKind::TriggerCapture {
                    device_id: "d1".to_string(),
                    request: None,
                    skip_if_busy: false,
                    wait: false,
                },
            })
            .await;

        assert!(response.success);
        assert_eq!(response.result.unwrap()["accepted"], true);
    }

    #[tokio::test]
    async fn test_busy_device_with_skip_flag() {
        let channel = channel_with(StubRenderer { delay_ms: 200 });
        let first = channel
            .handle(Request {
                id: 1,
                kind: RequestKind::TriggerCapture {
                    device_id: "d1".to_string(),
                    request: None,
                    skip_if_busy: false,
                    wait: false,
                },
            })
            .await;
        assert!(first.success);

        let second = channel
            .handle(Request {
                id: 2,
                kind: RequestKind::TriggerCapture {
                    device_id: "d1".to_string(),
                    request: None,
                    skip_if_busy: true,
                    wait: false,
                },
            })
            .await;
        assert!(!second.success);
        assert_eq!(second.error.unwrap().code, "busy");
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let channel = channel();
        for kind in [
            RequestKind::TriggerCapture {
                device_id: "ghost".to_string(),
                request: None,
                skip_if_busy: false,
                wait: false,
            },
            RequestKind::GenerateToken {
                device_id: "ghost".to_string(),
            },
        ] {
            let response = channel.handle(Request { id: 3, kind }).await;
            assert!(!response.success);
            assert_eq!(response.error.unwrap().code, "unknown_device");
        }
    }

    #[tokio::test]
    async fn test_generate_token_validates() {
        let channel = channel();
        let response = channel
            .handle(Request {
                id: 11,
                kind: RequestKind::GenerateToken {
                    device_id: "d1".to_string(),
                },
            })
            .await;

        assert!(response.success);
        let token = response.result.unwrap()["token"].as_str().unwrap().to_string();
        let validated = channel.tokens.validate(&token).unwrap();
        assert_eq!(validated.device_id, "d1");
    }

    #[tokio::test]
    async fn test_get_config_has_no_secret() {
        let channel = channel();
        let response = channel
            .handle(Request {
                id: 13,
                kind: RequestKind::GetConfig,
            })
            .await;

        assert!(response.success);
        let body = serde_json::to_string(&response.result.unwrap()).unwrap();
        assert!(!body.contains("f3b1c9a0"));
        assert!(body.contains("dashboard_base_url"));
    }

    #[tokio::test]
    async fn test_push_variables_rejects_wrong_device() {
        let channel = channel();
        let token = channel.tokens.issue("d2").into_string();

        let response = channel
            .handle(Request {
                id: 21,
                kind: RequestKind::PushVariables {
                    device_id: "d1".to_string(),
                    token,
                },
            })
            .await;

        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "unauthorized");
    }

    #[tokio::test]
    async fn test_push_variables_accepts_scoped_token() {
        // No cloud configured: the push validates and succeeds locally.
        let channel = channel();
        let token = channel.tokens.issue("d1").into_string();

        let response = channel
            .handle(Request {
                id: 22,
                kind: RequestKind::PushVariables {
                    device_id: "d1".to_string(),
                    token,
                },
            })
            .await;
        assert!(response.success);
    }

    #[tokio::test]
    async fn test_rotation_sweep_is_idempotent() {
        let channel = channel();

        // First sweep issues the initial token.
        let pushes = channel.rotation_sweep();
        assert_eq!(pushes.len(), 1);
        let Push::PushToken { device_id, token, .. } = &pushes[0];
        assert_eq!(device_id, "d1");
        assert!(channel.tokens.validate(token).is_ok());

        // Second sweep right after finds nothing to rotate.
        assert!(channel.rotation_sweep().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_sweep_reissues_near_expiry() {
        let channel = channel();

        // Plant a token issued 19h ago: 5h left, inside the 6h lead.
        let aging = channel
            .tokens
            .issue_at("d1", Utc::now() - ChronoDuration::hours(19));
        let aging_string = aging.as_str().to_string();
        channel
            .issued
            .lock()
            .unwrap()
            .insert("d1".to_string(), aging);

        let pushes = channel.rotation_sweep();
        assert_eq!(pushes.len(), 1);
        let Push::PushToken { token, .. } = &pushes[0];

        // Fresh token validates immediately; the superseded one rides out
        // its remaining validity as the grace window.
        assert!(channel.tokens.validate(token).is_ok());
        assert!(channel.tokens.validate(&aging_string).is_ok());
    }

    #[tokio::test]
    async fn test_handle_json_round_trip() {
        let channel = channel();
        let response = channel
            .handle_json(r#"{"id": 31, "type": "list_devices"}"#)
            .await;
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["id"], 31);
        assert_eq!(value["success"], true);

        let response = channel.handle_json(r#"{"id": 32, "type": "no_such"}"#).await;
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["id"], 32);
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "invalid_format");

        let response = channel.handle_json("not json").await;
        let value: serde_json::Value = serde_json::from_str(&response).unwrap();
        assert_eq!(value["error"]["code"], "invalid_format");
    }
}

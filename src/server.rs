//! Delivery endpoint: serves the latest captured image per device.
//!
//! One route matters: `GET /image/{device_id}?token=...`. The token is
//! validated statelessly by the [`TokenManager`] and must be scoped to the
//! device being fetched. On any authentication failure the response carries
//! only the bare failure category; the token itself and anything about the
//! signing scheme stay out of the body and the logs.
//!
//! Handlers never block on a capture in progress. They read whatever the
//! orchestrator last published and return immediately.
//!
//! # Example
//!
//! ```rust,ignore
//! use inkboard::server::{router, DeliveryState};
//!
//! let app = router(DeliveryState {
//!     tokens: token_manager,
//!     store: image_store,
//!     cache_max_age_secs: 60,
//! });
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:2342").await?;
//! axum::serve(listener, app).await?;
//! ```

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::error::{AuthError, Error};
use crate::store::ImageStore;
use crate::token::TokenManager;

/// Shared state behind the delivery routes.
#[derive(Clone)]
pub struct DeliveryState {
    /// Validates fetch tokens
    pub tokens: TokenManager,
    /// Last-published image per device
    pub store: ImageStore,
    /// `max-age` on served images; short, since content changes per schedule
    pub cache_max_age_secs: u32,
}

/// Extracts the `token` query parameter.
///
/// Some firmware appends its own API path to a base URL configured with a
/// query string, which mangles the token value into `<token>/api/display`.
/// Anything from `/api/` on is stripped before validation.
#[derive(Debug, Clone, Default)]
pub struct TokenQuery {
    /// The token from the query string, if present
    pub token: Option<String>,
}

impl TokenQuery {
    /// Extract a token from a raw query string.
    pub fn from_query_string(query: &str) -> Self {
        let token = form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "token")
            .map(|(_, v)| strip_firmware_suffix(v.to_string()));
        Self { token }
    }
}

fn strip_firmware_suffix(token: String) -> String {
    match token.find("/api/") {
        Some(idx) => token[..idx].to_string(),
        None => token,
    }
}

impl<S> FromRequestParts<S> for TokenQuery
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .uri
            .query()
            .map(TokenQuery::from_query_string)
            .unwrap_or_default())
    }
}

/// Build the delivery router.
pub fn router(state: DeliveryState) -> Router {
    Router::new()
        .route("/image/{device_id}", get(serve_image))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind and serve the delivery endpoint until the task is dropped.
pub async fn serve(state: DeliveryState, bind_addr: &str) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind delivery endpoint to '{bind_addr}': {e}")))?;
    tracing::info!(addr = %bind_addr, "delivery endpoint listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::Io(e.to_string()))
}

async fn serve_image(
    State(state): State<DeliveryState>,
    Path(device_id): Path<String>,
    auth: TokenQuery,
) -> Response {
    let Some(token) = auth.token else {
        return auth_failure(AuthError::Malformed);
    };

    let validated = match state.tokens.validate(&token) {
        Ok(validated) => validated,
        Err(err) => return auth_failure(err),
    };

    // A token only authorizes fetches for the device it was minted for.
    if validated.device_id != device_id {
        tracing::warn!(
            requested = %device_id,
            scoped_to = %validated.device_id,
            "token presented for the wrong device"
        );
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    match state.store.latest(&device_id) {
        Some(image) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, image.content_type.to_string()),
                (
                    header::CACHE_CONTROL,
                    format!("max-age={}, private", state.cache_max_age_secs),
                ),
            ],
            image.bytes.clone(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "no image").into_response(),
    }
}

fn auth_failure(err: AuthError) -> Response {
    // The category is all an external caller learns.
    (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CaptureOutcome, CaptureStamp, PublishedImage};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::{Duration, Utc};
    use tower::ServiceExt;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn state_with_image() -> DeliveryState {
        let store = ImageStore::new();
        store.publish(
            "d1",
            PublishedImage {
                bytes: vec![0x89, b'P', b'N', b'G'],
                content_type: "image/png",
                stamp: CaptureStamp {
                    produced_at: Utc::now(),
                    attempts: 1,
                    outcome: CaptureOutcome::Fresh,
                },
            },
        );
        DeliveryState {
            tokens: TokenManager::new(SECRET, 24, 6).unwrap(),
            store,
            cache_max_age_secs: 60,
        }
    }

    async fn fetch(state: DeliveryState, uri: &str) -> (StatusCode, Vec<u8>, Option<String>) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let cache = response
            .headers()
            .get(header::CACHE_CONTROL)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec(), cache)
    }

    #[tokio::test]
    async fn test_valid_token_serves_image() {
        let state = state_with_image();
        let token = state.tokens.issue("d1").into_string();

        let (status, body, cache) = fetch(state, &format!("/image/d1?token={token}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(cache.unwrap(), "max-age=60, private");
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let (status, body, _) = fetch(state_with_image(), "/image/d1").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, b"malformed");
    }

    #[tokio::test]
    async fn test_bad_token_gets_bare_category_only() {
        let state = state_with_image();
        let token = state.tokens.issue("d1").into_string();
        let flipped = if token.ends_with('0') { "1" } else { "0" };
        let tampered = format!("{}{flipped}", &token[..token.len() - 1]);

        let (status, body, _) = fetch(state, &format!("/image/d1?token={tampered}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        // The body is the category and nothing else; no token echo.
        assert_eq!(body, b"invalid_signature");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let state = state_with_image();
        let old = Utc::now() - Duration::hours(48);
        let token = state.tokens.issue_at("d1", old).into_string();

        let (status, body, _) = fetch(state, &format!("/image/d1?token={token}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, b"expired");
    }

    #[tokio::test]
    async fn test_token_scoped_to_other_device_rejected() {
        let state = state_with_image();
        let token = state.tokens.issue("d2").into_string();

        let (status, body, _) = fetch(state, &format!("/image/d1?token={token}")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, b"unauthorized");
    }

    #[tokio::test]
    async fn test_no_published_image_is_404() {
        let state = DeliveryState {
            tokens: TokenManager::new(SECRET, 24, 6).unwrap(),
            store: ImageStore::new(),
            cache_max_age_secs: 60,
        };
        let token = state.tokens.issue("d1").into_string();

        let (status, body, _) = fetch(state, &format!("/image/d1?token={token}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"no image");
    }

    #[tokio::test]
    async fn test_firmware_suffix_is_stripped() {
        let state = state_with_image();
        let token = state.tokens.issue("d1").into_string();

        // Firmware appended its display path to the configured query string.
        let uri = format!("/image/d1?token={token}/api/display");
        let (status, _, _) = fetch(state, &uri).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_healthz() {
        let (status, body, _) = fetch(state_with_image(), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[test]
    fn test_token_query_parsing() {
        let auth = TokenQuery::from_query_string("token=ink.abc.def&other=1");
        assert_eq!(auth.token.as_deref(), Some("ink.abc.def"));

        let auth = TokenQuery::from_query_string("other=1");
        assert!(auth.token.is_none());

        let auth = TokenQuery::from_query_string("token=ink.abc.def/api/display");
        assert_eq!(auth.token.as_deref(), Some("ink.abc.def"));
    }
}

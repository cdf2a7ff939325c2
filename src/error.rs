//! Error types for the inkboard core.

use thiserror::Error;

/// Authentication failures on the delivery path.
///
/// These are surfaced to external callers as a bare category only. Never
/// include token material or signing internals in the rendered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Token could not be parsed into its prefix, payload and signature parts
    #[error("malformed")]
    Malformed,

    /// Signature did not match the payload under the session secret
    #[error("invalid_signature")]
    InvalidSignature,

    /// Token parsed and verified but its expiry is in the past
    #[error("expired")]
    Expired,
}

/// Failures while driving a capture to completion.
///
/// All variants except [`CaptureError::InvalidDashboardPath`] and
/// [`CaptureError::Busy`] are transient and retried before the orchestrator
/// falls back to a generated placeholder image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The browser never finished loading the dashboard
    #[error("navigation did not complete")]
    NavigationTimeout,

    /// The page loaded but did not reach render stability within the deadline
    #[error("render did not settle within the deadline")]
    RenderTimeout,

    /// The browser process could not be started or died underneath us
    #[error("browser crashed: {0}")]
    BrowserCrashed(String),

    /// The requested dashboard path is not something we will navigate to
    #[error("invalid dashboard path: {0}")]
    InvalidDashboardPath(String),

    /// The device is already capturing and the caller asked not to wait
    #[error("capture already in progress for this device")]
    Busy,
}

impl CaptureError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Retrying a rejected path or a busy device only wastes a worker slot.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CaptureError::NavigationTimeout
                | CaptureError::RenderTimeout
                | CaptureError::BrowserCrashed(_)
        )
    }
}

/// Failures in the image transform pipeline.
///
/// These indicate a bad request or bad device configuration rather than a
/// transient condition, so they are reported to the caller and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// The device class asks for a color depth the quantizer cannot produce
    #[error("unsupported color depth: {0}")]
    UnsupportedDepth(String),

    /// A geometry parameter is outside its declared bounds
    #[error("parameter out of range: {0}")]
    OutOfRange(String),

    /// The raw screenshot bytes could not be decoded
    #[error("undecodable capture: {0}")]
    Decode(String),

    /// The final raster could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Top-level error for the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Delivery-path authentication failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Capture orchestration failure
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Image transform failure
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Invalid or missing configuration (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// The vendor API returned an error status code
    #[error("API returned error status {status}: {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// HTTP request failed (network error, timeout, etc.)
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Rate limited by the vendor API
    #[error("rate limited by the vendor API")]
    RateLimited,

    /// Filesystem or process I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Request(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_is_opaque() {
        // Rendered categories carry no token or secret material.
        assert_eq!(AuthError::Malformed.to_string(), "malformed");
        assert_eq!(AuthError::InvalidSignature.to_string(), "invalid_signature");
        assert_eq!(AuthError::Expired.to_string(), "expired");
    }

    #[test]
    fn test_capture_error_transience() {
        assert!(CaptureError::NavigationTimeout.is_transient());
        assert!(CaptureError::RenderTimeout.is_transient());
        assert!(CaptureError::BrowserCrashed("boom".into()).is_transient());
        assert!(!CaptureError::InvalidDashboardPath("ftp://x".into()).is_transient());
        assert!(!CaptureError::Busy.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Api {
            status: 400,
            body: "Bad request".to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Bad request"));

        let err: Error = TransformError::OutOfRange("rotation 20.0".into()).into();
        assert!(err.to_string().contains("rotation 20.0"));
    }
}

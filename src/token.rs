//! HMAC-signed bearer tokens for the delivery endpoint.
//!
//! A token authorizes read-only image fetches for exactly one device. The
//! whole scheme is stateless: validity is determined by recomputing the
//! signature and checking the embedded expiry, so there is no session store
//! and no revocation list. The tradeoff is that a leaked session secret
//! compromises every outstanding token until the operator rotates the secret,
//! which is acceptable for a short-lived, fetch-only credential.
//!
//! # Wire format
//!
//! ```text
//! ink.<payload>.<signature>
//! ```
//!
//! where `payload` is URL-safe base64 of a JSON object with `device_id`,
//! `issued_at` and `expires_at`, and `signature` is hex HMAC-SHA256 over the
//! encoded payload. All three parts are URL-safe, so the token can ride in a
//! query parameter without escaping.
//!
//! # Rotation
//!
//! Tokens live for 24 hours and are reissued 6 hours before expiry. Because
//! validation is stateless, the superseded token keeps validating until its
//! own expiry, which gives in-flight fetches the full rotation lead as a
//! grace window with no cutover race.
//!
//! # Example
//!
//! ```
//! use inkboard::token::TokenManager;
//!
//! let manager = TokenManager::new("0123456789abcdef0123456789abcdef", 24, 6).unwrap();
//! let token = manager.issue("display-1");
//!
//! let validated = manager.validate(token.as_str()).unwrap();
//! assert_eq!(validated.device_id, "display-1");
//! assert!(!manager.should_rotate(&token));
//! ```

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::{AuthError, Error};

type HmacSha256 = Hmac<Sha256>;

/// Leading tag on every token string.
pub const TOKEN_PREFIX: &str = "ink";

/// Separator between token parts. Chosen to survive URL query encoding.
const TOKEN_SEPARATOR: char = '.';

/// Minimum accepted session secret length in bytes.
const MIN_SECRET_LEN: usize = 16;

/// Signed claims carried in the token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    device_id: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// A freshly issued token plus its claims.
#[derive(Debug, Clone)]
pub struct Token {
    /// Device this token is scoped to
    pub device_id: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Expiry time; validation fails strictly after this instant
    pub expires_at: DateTime<Utc>,
    encoded: String,
}

impl Token {
    /// The encoded token string.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Consume the token and return the encoded string.
    pub fn into_string(self) -> String {
        self.encoded
    }
}

/// Claims recovered from a token that passed signature and expiry checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedToken {
    /// Device the token was issued for
    pub device_id: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

/// Issues, validates and rotation-checks device tokens.
///
/// Holds the only copy of the session secret. The secret is loaded once at
/// startup and never rotated at runtime; rotating it invalidates every
/// outstanding token immediately, which is an explicit operator action.
#[derive(Clone)]
pub struct TokenManager {
    mac: HmacSha256,
    ttl: Duration,
    rotation_lead: Duration,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("ttl", &self.ttl)
            .field("rotation_lead", &self.rotation_lead)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Create a manager from the session secret and token lifetimes.
    ///
    /// Fails when the secret is missing or too short. This is the only
    /// failure mode of the token scheme and it is fatal at startup, never at
    /// issue or validate time.
    pub fn new(secret: &str, ttl_hours: i64, rotation_lead_hours: i64) -> Result<Self, Error> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "session secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if ttl_hours <= 0 || rotation_lead_hours <= 0 || rotation_lead_hours >= ttl_hours {
            return Err(Error::Config(
                "token rotation lead must be positive and shorter than the TTL".to_string(),
            ));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| Error::Config("session secret rejected by HMAC".to_string()))?;
        Ok(Self {
            mac,
            ttl: Duration::hours(ttl_hours),
            rotation_lead: Duration::hours(rotation_lead_hours),
        })
    }

    /// Issue a token for a device, expiring one TTL from now.
    pub fn issue(&self, device_id: &str) -> Token {
        self.issue_at(device_id, Utc::now())
    }

    /// Issue a token as of a specific instant.
    ///
    /// Useful for testing expiry and rotation timelines.
    pub fn issue_at(&self, device_id: &str, now: DateTime<Utc>) -> Token {
        let claims = Claims {
            device_id: device_id.to_string(),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
        let signature = hex_encode(&self.sign(payload.as_bytes()));
        let encoded = format!(
            "{TOKEN_PREFIX}{TOKEN_SEPARATOR}{payload}{TOKEN_SEPARATOR}{signature}"
        );

        tracing::debug!(device_id, expires_at = %claims.expires_at, "issued token");

        Token {
            device_id: claims.device_id,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
            encoded,
        }
    }

    /// Validate a token string and return its claims.
    ///
    /// Checks, in order: wire format, signature (constant-time comparison),
    /// expiry. Expiry is strict: a token is rejected the instant `now` passes
    /// `expires_at`.
    pub fn validate(&self, token: &str) -> Result<ValidatedToken, AuthError> {
        self.validate_at(token, Utc::now())
    }

    /// Validate a token string as of a specific instant.
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<ValidatedToken, AuthError> {
        let (payload, signature) = split_token(token)?;

        let claimed = hex_decode(signature).ok_or(AuthError::InvalidSignature)?;
        let expected = self.sign(payload.as_bytes());
        let matches: bool = expected.ct_eq(claimed.as_slice()).into();
        if !matches {
            return Err(AuthError::InvalidSignature);
        }

        let claims = decode_claims(payload)?;
        if now > claims.expires_at {
            return Err(AuthError::Expired);
        }

        Ok(ValidatedToken {
            device_id: claims.device_id,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
        })
    }

    /// Whether a token is close enough to expiry to be reissued.
    ///
    /// True once less than the rotation lead remains. The transition is
    /// monotonic: a token that should rotate never flips back.
    pub fn should_rotate(&self, token: &Token) -> bool {
        self.should_rotate_at(token.expires_at, Utc::now())
    }

    /// Rotation check against an explicit clock.
    pub fn should_rotate_at(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        expires_at - now < self.rotation_lead
    }

    /// Read a token's claims without verifying the signature.
    ///
    /// This is introspection only. Never make an authorization decision from
    /// the result; use [`TokenManager::validate`] for that.
    pub fn peek(token: &str) -> Result<ValidatedToken, AuthError> {
        let (payload, _) = split_token(token)?;
        let claims = decode_claims(payload)?;
        Ok(ValidatedToken {
            device_id: claims.device_id,
            issued_at: claims.issued_at,
            expires_at: claims.expires_at,
        })
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

fn split_token(token: &str) -> Result<(&str, &str), AuthError> {
    let mut parts = token.split(TOKEN_SEPARATOR);
    let (prefix, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(prefix), Some(payload), Some(signature), None) => (prefix, payload, signature),
        _ => return Err(AuthError::Malformed),
    };
    if prefix != TOKEN_PREFIX || payload.is_empty() || signature.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok((payload, signature))
}

fn decode_claims(payload: &str) -> Result<Claims, AuthError> {
    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&raw).map_err(|_| AuthError::Malformed)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if !s.is_ascii() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn manager() -> TokenManager {
        TokenManager::new(SECRET, 24, 6).unwrap()
    }

    #[test]
    fn test_issue_validate_round_trip() {
        let manager = manager();
        let token = manager.issue("display-1");

        let validated = manager.validate(token.as_str()).unwrap();
        assert_eq!(validated.device_id, "display-1");
        assert_eq!(validated.expires_at, token.expires_at);
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(TokenManager::new("short", 24, 6).is_err());
        assert!(TokenManager::new(SECRET, 24, 24).is_err());
        assert!(TokenManager::new(SECRET, 24, 0).is_err());
    }

    #[test]
    fn test_expiry_is_strict() {
        let manager = manager();
        let now = Utc::now();
        let token = manager.issue_at("display-1", now);

        // Valid at the expiry instant itself, rejected strictly after.
        assert!(manager.validate_at(token.as_str(), token.expires_at).is_ok());
        let result = manager.validate_at(token.as_str(), token.expires_at + Duration::seconds(1));
        assert_eq!(result.unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let manager = manager();
        let token = manager.issue("display-1").into_string();

        // Flip every signature nibble in turn; none may validate.
        let sig_start = token.rfind('.').unwrap() + 1;
        for i in sig_start..token.len() {
            let mut tampered: Vec<u8> = token.bytes().collect();
            tampered[i] = if tampered[i] == b'0' { b'1' } else { b'0' };
            let tampered = String::from_utf8(tampered).unwrap();
            if tampered == token {
                continue;
            }
            assert_eq!(
                manager.validate(&tampered).unwrap_err(),
                AuthError::InvalidSignature,
                "tamper at byte {i} was accepted"
            );
        }
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let manager = manager();
        let token = manager.issue("display-1").into_string();

        let mut parts: Vec<&str> = token.split('.').collect();
        let other = manager.issue("display-2").into_string();
        let other_payload = other.split('.').nth(1).unwrap().to_string();
        parts[1] = &other_payload;
        let spliced = parts.join(".");

        assert_eq!(
            manager.validate(&spliced).unwrap_err(),
            AuthError::InvalidSignature
        );
    }

    #[test]
    fn test_malformed_tokens() {
        let manager = manager();
        for bad in [
            "",
            "ink",
            "ink.",
            "ink..",
            "nope.abc.def",
            "ink.abc.def.extra",
            "ink.!!!notb64.00",
        ] {
            assert_eq!(
                manager.validate(bad).unwrap_err(),
                AuthError::Malformed,
                "token {bad:?}"
            );
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let manager = manager();
        let other = TokenManager::new("ffffffffffffffffffffffffffffffff", 24, 6).unwrap();
        let token = manager.issue("display-1");
        assert_eq!(
            other.validate(token.as_str()).unwrap_err(),
            AuthError::InvalidSignature
        );
    }

    #[test]
    fn test_should_rotate_is_monotonic() {
        let manager = manager();
        let now = Utc::now();
        let token = manager.issue_at("display-1", now);

        // Fresh token: 24h remaining, no rotation.
        assert!(!manager.should_rotate_at(token.expires_at, now));
        // Just before the lead window opens.
        assert!(!manager.should_rotate_at(token.expires_at, now + Duration::hours(18) - Duration::seconds(1)));
        // Once inside the window it stays true all the way past expiry.
        let mut t = now + Duration::hours(18) + Duration::seconds(1);
        while t < now + Duration::hours(26) {
            assert!(manager.should_rotate_at(token.expires_at, t));
            t += Duration::hours(1);
        }
    }

    #[test]
    fn test_rotation_overlap() {
        let manager = manager();
        let now = Utc::now();
        let old = manager.issue_at("display-1", now);

        // 18h in, the sweep reissues. Both tokens must validate.
        let rotation_time = now + Duration::hours(18) + Duration::minutes(1);
        assert!(manager.should_rotate_at(old.expires_at, rotation_time));
        let fresh = manager.issue_at("display-1", rotation_time);

        assert!(manager.validate_at(fresh.as_str(), rotation_time).is_ok());
        assert!(manager.validate_at(old.as_str(), rotation_time).is_ok());
        // The old token rides out its remaining validity as the grace window.
        assert!(manager
            .validate_at(old.as_str(), old.expires_at)
            .is_ok());
        assert!(manager
            .validate_at(fresh.as_str(), old.expires_at + Duration::hours(1))
            .is_ok());
    }

    #[test]
    fn test_peek_reads_claims_without_verifying() {
        let manager = manager();
        let token = manager.issue("display-1").into_string();

        // Corrupt the signature; peek still reads the payload.
        let truncated = format!("{}x0", &token[..token.len() - 2]);
        let info = TokenManager::peek(&truncated).unwrap();
        assert_eq!(info.device_id, "display-1");
        assert!(manager.validate(&truncated).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let bytes = vec![0x00, 0x7f, 0xff, 0x10];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("0g").is_none());
        assert!(hex_decode("abc").is_none());
    }
}

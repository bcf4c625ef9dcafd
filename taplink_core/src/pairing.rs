//! Pairing token generation and redemption
//!
//! Produces a signed, expiring payload embedding the host address, port, and
//! a one-time session secret, rendered as a scannable QR code. Tokens are
//! single-use: a successful redemption consumes the token, and replays or
//! expired tokens are rejected.

use crate::error::{Result, TaplinkError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// URI scheme for pairing payloads
pub const URI_SCHEME: &str = "taplink";
/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// The data a client needs to connect, carried inside the QR code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingPayload {
    pub host: String,
    pub port: u16,
    pub token: String,
    /// Unix timestamp (seconds) after which the token is invalid
    pub expires_at: u64,
}

/// A freshly issued token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub uri: String,
    pub payload: PairingPayload,
}

/// Issues and redeems pairing tokens for one host session.
///
/// The HMAC key is random per issuer, so tokens do not survive a host
/// restart. That is intentional: a pairing code is a short-lived secret,
/// not a credential store.
pub struct TokenIssuer {
    key: [u8; 32],
    redeemed: Mutex<HashSet<String>>,
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenIssuer {
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            key,
            redeemed: Mutex::new(HashSet::new()),
        }
    }

    /// Issue a signed pairing token for the given host endpoint
    pub fn issue(&self, host: &str, port: u16, ttl: Duration) -> Result<IssuedToken> {
        let mut token_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token_bytes);

        let payload = PairingPayload {
            host: host.to_string(),
            port,
            token: hex::encode(token_bytes),
            expires_at: unix_now() + ttl.as_secs(),
        };

        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
        let sig = hex::encode(self.sign(encoded.as_bytes())?);
        let uri = format!("{}://pair?d={}&sig={}", URI_SCHEME, encoded, sig);

        debug!("issued pairing token for {}:{}", host, port);
        Ok(IssuedToken { uri, payload })
    }

    /// Redeem a pairing URI. Verifies the signature, then the expiry, then
    /// marks the token used; each failure is a distinct rejection reason.
    pub fn redeem(&self, uri: &str) -> Result<PairingPayload> {
        let (encoded, sig) = parse_pairing_uri(uri)?;

        let sig_bytes = hex::decode(sig)
            .map_err(|_| TaplinkError::Pairing("malformed signature".to_string()))?;
        let mut mac = self.mac()?;
        mac.update(encoded.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| TaplinkError::Pairing("invalid signature".to_string()))?;

        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TaplinkError::Pairing("malformed payload".to_string()))?;
        let payload: PairingPayload = serde_json::from_slice(&raw)?;

        if unix_now() >= payload.expires_at {
            return Err(TaplinkError::Pairing("token expired".to_string()));
        }

        let mut redeemed = self.redeemed.lock().unwrap();
        if !redeemed.insert(payload.token.clone()) {
            return Err(TaplinkError::Pairing("token already redeemed".to_string()));
        }

        debug!("pairing token redeemed for {}:{}", payload.host, payload.port);
        Ok(payload)
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| TaplinkError::Pairing(format!("hmac init failed: {}", e)))
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn parse_pairing_uri(uri: &str) -> Result<(&str, &str)> {
    let prefix = format!("{}://pair?", URI_SCHEME);
    let rest = uri
        .strip_prefix(&prefix)
        .ok_or_else(|| TaplinkError::Pairing("unrecognized pairing URI".to_string()))?;

    let mut data = None;
    let mut sig = None;
    for param in rest.split('&') {
        match param.split_once('=') {
            Some(("d", v)) => data = Some(v),
            Some(("sig", v)) => sig = Some(v),
            _ => {}
        }
    }
    match (data, sig) {
        (Some(d), Some(s)) => Ok((d, s)),
        _ => Err(TaplinkError::Pairing("missing URI parameters".to_string())),
    }
}

/// Render a pairing URI as a terminal-printable QR code
pub fn render_qr(uri: &str) -> Result<String> {
    render_qr_sized(uri, 1)
}

/// Render with each QR module scaled to `scale` character cells
pub fn render_qr_sized(uri: &str, scale: u32) -> Result<String> {
    let scale = scale.max(1);
    let code = qrcode::QrCode::new(uri.as_bytes())
        .map_err(|e| TaplinkError::Pairing(format!("failed to generate QR code: {}", e)))?;
    Ok(code
        .render::<qrcode::render::unicode::Dense1x2>()
        .module_dimensions(scale, scale)
        .build())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_redeem_once() {
        let issuer = TokenIssuer::new();
        let issued = issuer.issue("192.168.1.10", 7905, DEFAULT_TOKEN_TTL).unwrap();

        assert!(issued.uri.starts_with("taplink://pair?d="));

        let payload = issuer.redeem(&issued.uri).unwrap();
        assert_eq!(payload, issued.payload);
        assert_eq!(payload.host, "192.168.1.10");
        assert_eq!(payload.port, 7905);
    }

    #[test]
    fn test_token_is_single_use() {
        let issuer = TokenIssuer::new();
        let issued = issuer.issue("10.0.0.1", 7905, DEFAULT_TOKEN_TTL).unwrap();

        assert!(issuer.redeem(&issued.uri).is_ok());
        let second = issuer.redeem(&issued.uri);
        assert!(matches!(
            second,
            Err(TaplinkError::Pairing(ref msg)) if msg.contains("already redeemed")
        ));
    }

    #[test]
    fn test_zero_ttl_token_is_rejected() {
        let issuer = TokenIssuer::new();
        let issued = issuer.issue("10.0.0.1", 7905, Duration::ZERO).unwrap();

        let result = issuer.redeem(&issued.uri);
        assert!(matches!(
            result,
            Err(TaplinkError::Pairing(ref msg)) if msg.contains("expired")
        ));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let issuer = TokenIssuer::new();
        let issued = issuer.issue("10.0.0.1", 7905, DEFAULT_TOKEN_TTL).unwrap();

        // Flip the first payload character
        let tampered = {
            let idx = issued.uri.find("d=").unwrap() + 2;
            let mut chars: Vec<char> = issued.uri.chars().collect();
            chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
            chars.into_iter().collect::<String>()
        };

        let result = issuer.redeem(&tampered);
        assert!(matches!(result, Err(TaplinkError::Pairing(_))));
    }

    #[test]
    fn test_foreign_issuer_token_is_rejected() {
        let issuer_a = TokenIssuer::new();
        let issuer_b = TokenIssuer::new();
        let issued = issuer_a.issue("10.0.0.1", 7905, DEFAULT_TOKEN_TTL).unwrap();

        let result = issuer_b.redeem(&issued.uri);
        assert!(matches!(
            result,
            Err(TaplinkError::Pairing(ref msg)) if msg.contains("signature")
        ));
    }

    #[test]
    fn test_garbage_uri_is_rejected() {
        let issuer = TokenIssuer::new();
        assert!(issuer.redeem("not-a-uri").is_err());
        assert!(issuer.redeem("taplink://pair?x=1").is_err());
    }

    #[test]
    fn test_tokens_are_unique() {
        let issuer = TokenIssuer::new();
        let a = issuer.issue("h", 1, DEFAULT_TOKEN_TTL).unwrap();
        let b = issuer.issue("h", 1, DEFAULT_TOKEN_TTL).unwrap();
        assert_ne!(a.payload.token, b.payload.token);
    }

    #[test]
    fn test_render_qr() {
        let issuer = TokenIssuer::new();
        let issued = issuer.issue("192.168.1.10", 7905, DEFAULT_TOKEN_TTL).unwrap();
        let qr = render_qr(&issued.uri).unwrap();
        assert!(!qr.is_empty());
    }

    #[test]
    fn test_render_qr_scales() {
        let issuer = TokenIssuer::new();
        let issued = issuer.issue("192.168.1.10", 7905, DEFAULT_TOKEN_TTL).unwrap();

        let small = render_qr_sized(&issued.uri, 1).unwrap();
        let large = render_qr_sized(&issued.uri, 2).unwrap();
        assert!(large.len() > small.len());

        // Zero scale is clamped, not an error
        assert_eq!(render_qr_sized(&issued.uri, 0).unwrap(), small);
    }

    #[test]
    fn test_payload_serialization() {
        let payload = PairingPayload {
            host: "192.168.1.10".to_string(),
            port: 7905,
            token: "abc123".to_string(),
            expires_at: 1_700_000_000,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: PairingPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(payload, back);
    }
}

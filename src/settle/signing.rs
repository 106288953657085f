// Settle request signing and callback signature verification
//
// Signed message: METHOD|URI|X-SETTLE-A=v&X-SETTLE-B=v|
// Settle headers are upper-cased and sorted by name before joining.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDateTime, Utc};
use http::HeaderMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::settle::errors::{CallbackError, SettleApiError};

pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_CONTENT_DIGEST: &str = "x-settle-content-digest";
pub const HEADER_TIMESTAMP: &str = "x-settle-timestamp";
pub const HEADER_MERCHANT: &str = "x-settle-merchant";
pub const HEADER_USER: &str = "x-settle-user";
pub const HEADER_TESTBED_TOKEN: &str = "x-testbed-token";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `SHA256=<base64 digest>` of a request body.
pub fn content_digest(body: &[u8]) -> String {
    format!("SHA256={}", STANDARD.encode(Sha256::digest(body)))
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Build the canonical message covered by a Settle signature.
pub fn signing_message<'a, I>(method: &str, uri: &str, headers: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut settle_headers: Vec<(String, &str)> = headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_uppercase(), v))
        .filter(|(k, _)| k.starts_with("X-SETTLE-"))
        .collect();
    settle_headers.sort_by(|a, b| a.0.cmp(&b.0));
    let joined = settle_headers
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}|{}|{}|", method.to_ascii_uppercase(), uri, joined)
}

/// Produces the `Authorization` header for outbound provider calls.
pub trait RequestSigner: Send + Sync {
    fn authorization(&self, message: &str) -> Result<String, SettleApiError>;
}

/// Merchant users registered with a shared secret authenticate with `SECRET <secret>`.
pub struct SecretSigner {
    secret: String,
}

impl SecretSigner {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

impl RequestSigner for SecretSigner {
    fn authorization(&self, _message: &str) -> Result<String, SettleApiError> {
        if self.secret.is_empty() {
            return Err(SettleApiError::Signing("api secret not configured".to_string()));
        }
        Ok(format!("SECRET {}", self.secret))
    }
}

/// Checks one authorization scheme (e.g. `RSA-SHA256`) over the signed message.
///
/// RSA verification against Settle's published key plugs in here.
pub trait SignatureVerifier: Send + Sync {
    fn scheme(&self) -> &'static str;
    fn verify(&self, message: &str, signature: &str) -> bool;
}

/// Accepts callbacks carrying `Authorization: SECRET <callback secret>`.
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

impl SignatureVerifier for SharedSecretVerifier {
    fn scheme(&self) -> &'static str {
        "SECRET"
    }

    fn verify(&self, _message: &str, signature: &str) -> bool {
        !self.secret.is_empty() && constant_time_eq(self.secret.as_bytes(), signature.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Envelope checks for an inbound callback before its body is trusted.
#[derive(Clone)]
pub struct CallbackVerifier {
    verifiers: Vec<Arc<dyn SignatureVerifier>>,
    tolerance_seconds: i64,
}

impl CallbackVerifier {
    pub fn new(tolerance_seconds: i64) -> Self {
        Self {
            verifiers: Vec::new(),
            tolerance_seconds,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifiers.push(verifier);
        self
    }

    pub fn verify(
        &self,
        method: &str,
        uri: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), CallbackError> {
        self.verify_at(method, uri, headers, body, Utc::now())
    }

    pub fn verify_at(
        &self,
        method: &str,
        uri: &str,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), CallbackError> {
        let authorization = header_str(headers, HEADER_AUTHORIZATION)
            .ok_or_else(|| CallbackError::InvalidSignature("missing authorization header".into()))?;
        let (scheme, signature) = authorization
            .split_once(' ')
            .ok_or_else(|| CallbackError::InvalidSignature("malformed authorization header".into()))?;

        let verifier = self
            .verifiers
            .iter()
            .find(|v| v.scheme().eq_ignore_ascii_case(scheme))
            .ok_or_else(|| CallbackError::InvalidSignature(format!("unsupported scheme {scheme}")))?;

        if !body.is_empty() {
            let digest = header_str(headers, HEADER_CONTENT_DIGEST)
                .ok_or_else(|| CallbackError::InvalidSignature("missing content digest".into()))?;
            if digest != content_digest(body) {
                return Err(CallbackError::InvalidSignature("content digest mismatch".into()));
            }
        }

        let timestamp = header_str(headers, HEADER_TIMESTAMP)
            .and_then(parse_timestamp)
            .ok_or_else(|| CallbackError::InvalidSignature("missing or invalid timestamp".into()))?;
        let drift = (now - timestamp).num_seconds().abs();
        if drift > self.tolerance_seconds {
            return Err(CallbackError::InvalidSignature(format!(
                "timestamp drift {drift}s exceeds tolerance {}s",
                self.tolerance_seconds
            )));
        }

        let message = signing_message(
            method,
            uri,
            headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
        );
        if !verifier.verify(&message, signature.trim()) {
            return Err(CallbackError::InvalidSignature("signature mismatch".into()));
        }

        debug!(target: "settle", scheme = %scheme, drift = drift, "callback signature verified");
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

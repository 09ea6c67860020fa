//! Bearer tokens and claim checks

use crate::error::{OpsError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use std::fmt;

/// Tokens with this much lifetime left or less are renewed before use
pub const REFRESH_THRESHOLD_MINUTES: i64 = 15;

/// Access token plus where it came from
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Raw bearer token
    pub token: String,
    /// Expiry instant
    pub expires_on: DateTime<Utc>,
    /// Name of the credential that produced it
    pub source: String,
}

impl AccessToken {
    /// Create a token
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>, source: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_on,
            source: source.into(),
        }
    }

    /// Lifetime left at `now`
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_on - now
    }

    /// Whether the token must be renewed before use
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now) <= Duration::minutes(REFRESH_THRESHOLD_MINUTES)
    }
}

// never print the secret itself
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .field("source", &self.source)
            .finish()
    }
}

/// Claims read from a JWT payload
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    /// Tenant id
    #[serde(default)]
    pub tid: Option<String>,
    /// User principal name
    #[serde(default)]
    pub upn: Option<String>,
    /// Legacy account name claim
    #[serde(default)]
    pub unique_name: Option<String>,
    /// v2 account name claim
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Object id
    #[serde(default)]
    pub oid: Option<String>,
    /// Expiry (seconds since epoch)
    #[serde(default)]
    pub exp: Option<i64>,
}

impl Claims {
    /// First account-name style claim present
    pub fn account(&self) -> Option<&str> {
        self.upn
            .as_deref()
            .or(self.unique_name.as_deref())
            .or(self.preferred_username.as_deref())
    }

    /// Expiry as a timestamp
    pub fn expires_on(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|e| Utc.timestamp_opt(e, 0).single())
    }

    fn matches_account(&self, expected: &str) -> bool {
        [&self.upn, &self.unique_name, &self.preferred_username]
            .into_iter()
            .flatten()
            .any(|v| v.eq_ignore_ascii_case(expected))
    }
}

/// Decode the payload segment of a JWT without verifying its signature
pub fn decode_claims(token: &str) -> Result<Claims> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return Err(OpsError::TokenDecode("token is not a three-part JWT".into())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| OpsError::TokenDecode(format!("payload is not base64url: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| OpsError::TokenDecode(format!("payload is not JSON: {}", e)))
}

/// Identity a token must belong to; `None` fields are not checked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenExpectation {
    /// Expected tenant id
    pub tenant: Option<String>,
    /// Expected user principal name
    pub account: Option<String>,
}

/// Whether `token` was issued for the expected tenant and account
///
/// Undecodable tokens never validate.
pub fn validate_token_claims(token: &str, expected: &TokenExpectation) -> bool {
    let claims = match decode_claims(token) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("Rejecting token: {}", e);
            return false;
        }
    };

    if let Some(ref tenant) = expected.tenant {
        if !claims.tid.as_deref().is_some_and(|t| t.eq_ignore_ascii_case(tenant)) {
            tracing::debug!("Rejecting token: tenant {:?} != {}", claims.tid, tenant);
            return false;
        }
    }
    if let Some(ref account) = expected.account {
        if !claims.matches_account(account) {
            tracing::debug!("Rejecting token: account {:?} != {}", claims.account(), account);
            return false;
        }
    }
    true
}

#[cfg(test)]
pub(crate) fn test_jwt(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

//! Two-tier authentication with claim validation
//!
//! The primary chain is tried first, each provider in turn. Tokens that do not
//! belong to the expected tenant or account are dropped and the chain moves on.
//! When the primary chain is exhausted (or skipped) the legacy chain runs once.

use super::credential::CredentialProvider;
use super::token::{validate_token_claims, AccessToken, TokenExpectation};
use crate::error::{OpsError, Result};
use chrono::{DateTime, Utc};

/// Clock used for expiry checks
pub type Clock = Box<dyn Fn() -> DateTime<Utc>>;

/// Obtains and caches the bearer token for one resource
pub struct Authenticator {
    resource: String,
    expectation: TokenExpectation,
    primary: Vec<Box<dyn CredentialProvider>>,
    legacy: Vec<Box<dyn CredentialProvider>>,
    primary_supported: bool,
    cached: Option<AccessToken>,
    clock: Clock,
}

impl Authenticator {
    /// Authenticator for `resource`; tokens must satisfy `expectation`
    pub fn new(resource: impl Into<String>, expectation: TokenExpectation) -> Self {
        Self {
            resource: resource.into(),
            expectation,
            primary: Vec::new(),
            legacy: Vec::new(),
            primary_supported: true,
            cached: None,
            clock: Box::new(Utc::now),
        }
    }

    /// Append a provider to the primary chain
    pub fn with_primary(mut self, provider: Box<dyn CredentialProvider>) -> Self {
        self.primary.push(provider);
        self
    }

    /// Append a provider to the legacy chain
    pub fn with_legacy(mut self, provider: Box<dyn CredentialProvider>) -> Self {
        self.legacy.push(provider);
        self
    }

    /// Mark the primary chain unusable on this host
    pub fn with_primary_supported(mut self, supported: bool) -> Self {
        self.primary_supported = supported;
        self
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Resource tokens are requested for
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Current cached token, if any
    pub fn cached(&self) -> Option<&AccessToken> {
        self.cached.as_ref()
    }

    /// Forget the cached token
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Cached token while it has more than the refresh threshold left, else a new login
    pub fn token(&mut self) -> Result<AccessToken> {
        let now = (self.clock)();
        if let Some(ref token) = self.cached {
            if !token.needs_refresh(now) {
                return Ok(token.clone());
            }
            tracing::debug!("Token from {} expires at {}, renewing", token.source, token.expires_on);
        }
        self.login(false)
    }

    /// Run the chains and cache the first token that validates
    pub fn login(&mut self, force_legacy: bool) -> Result<AccessToken> {
        let tenant = self.expectation.tenant.clone();
        let mut attempts = Vec::new();

        if !force_legacy && self.primary_supported {
            if let Some(token) = self.try_chain(ChainKind::Primary, tenant.as_deref(), &mut attempts) {
                return Ok(self.assign(token));
            }
            tracing::warn!("Primary authentication chain exhausted, falling back to interactive login");
        } else if force_legacy {
            tracing::info!("Forcing interactive login");
        }

        if let Some(token) = self.try_chain(ChainKind::Legacy, tenant.as_deref(), &mut attempts) {
            return Ok(self.assign(token));
        }

        Err(OpsError::AuthenticationExhausted { attempts })
    }

    fn assign(&mut self, token: AccessToken) -> AccessToken {
        tracing::info!("Authenticated via {}", token.source);
        self.cached = Some(token.clone());
        token
    }

    fn try_chain(&self, kind: ChainKind, tenant: Option<&str>, attempts: &mut Vec<String>) -> Option<AccessToken> {
        let chain = match kind {
            ChainKind::Primary => &self.primary,
            ChainKind::Legacy => &self.legacy,
        };

        for provider in chain {
            match provider.acquire_token(&self.resource, tenant) {
                Ok(token) if validate_token_claims(&token.token, &self.expectation) => return Some(token),
                Ok(_) => {
                    tracing::warn!("{}: token does not match the expected tenant/account, skipping", provider.name());
                    attempts.push(format!("{}: claim mismatch", provider.name()));
                }
                Err(e) => {
                    tracing::warn!("{}: {}", provider.name(), e);
                    attempts.push(format!("{}: {}", provider.name(), e));
                }
            }
        }
        None
    }
}

#[derive(Clone, Copy)]
enum ChainKind {
    Primary,
    Legacy,
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Provider returning a fixed outcome and counting calls
    pub struct StaticProvider {
        pub name: &'static str,
        pub token: Option<String>,
        pub lifetime: Duration,
        pub calls: Arc<AtomicUsize>,
    }

    impl StaticProvider {
        pub fn ok(name: &'static str, token: String) -> (Box<dyn CredentialProvider>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let provider = Self {
                name,
                token: Some(token),
                lifetime: Duration::hours(1),
                calls: calls.clone(),
            };
            (Box::new(provider), calls)
        }

        pub fn failing(name: &'static str) -> (Box<dyn CredentialProvider>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let provider = Self {
                name,
                token: None,
                lifetime: Duration::zero(),
                calls: calls.clone(),
            };
            (Box::new(provider), calls)
        }
    }

    impl CredentialProvider for StaticProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn acquire_token(&self, _resource: &str, _tenant: Option<&str>) -> Result<AccessToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.token {
                Some(ref t) => Ok(AccessToken::new(t.clone(), Utc::now() + self.lifetime, self.name)),
                None => Err(OpsError::auth(self.name, "unavailable")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::StaticProvider;
    use super::super::token::test_jwt;
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    fn expect_tenant(t: &str) -> TokenExpectation {
        TokenExpectation {
            tenant: Some(t.into()),
            account: None,
        }
    }

    fn jwt_for(tenant: &str) -> String {
        test_jwt(json!({"tid": tenant, "upn": "ops@contoso.com"}))
    }

    #[test]
    fn test_mismatched_tenant_is_never_assigned() {
        let (wrong, wrong_calls) = StaticProvider::ok("sp", jwt_for("tenant-b"));
        let (right, _) = StaticProvider::ok("cli", jwt_for("tenant-a"));
        let mut auth = Authenticator::new("https://c", expect_tenant("tenant-a"))
            .with_primary(wrong)
            .with_primary(right);

        let token = auth.login(false).unwrap();
        assert_eq!(token.source, "cli");
        assert_eq!(wrong_calls.load(Ordering::SeqCst), 1);
        assert_eq!(auth.cached().unwrap().source, "cli");
    }

    #[test]
    fn test_only_mismatches_exhausts_without_caching() {
        let (wrong, _) = StaticProvider::ok("sp", jwt_for("tenant-b"));
        let (legacy_wrong, _) = StaticProvider::ok("device-code", jwt_for("tenant-b"));
        let mut auth = Authenticator::new("https://c", expect_tenant("tenant-a"))
            .with_primary(wrong)
            .with_legacy(legacy_wrong);

        match auth.login(false) {
            Err(OpsError::AuthenticationExhausted { attempts }) => assert_eq!(attempts.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(auth.cached().is_none());
    }

    #[test]
    fn test_primary_exhaustion_runs_legacy_once() {
        let (p1, _) = StaticProvider::failing("sp");
        let (p2, _) = StaticProvider::failing("cli");
        let (silent, silent_calls) = StaticProvider::failing("cached-account");
        let (device, device_calls) = StaticProvider::ok("device-code", jwt_for("tenant-a"));
        let mut auth = Authenticator::new("https://c", expect_tenant("tenant-a"))
            .with_primary(p1)
            .with_primary(p2)
            .with_legacy(silent)
            .with_legacy(device);

        assert_eq!(auth.login(false).unwrap().source, "device-code");
        assert_eq!(silent_calls.load(Ordering::SeqCst), 1);
        assert_eq!(device_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_legacy_skips_primary() {
        let (primary, primary_calls) = StaticProvider::ok("sp", jwt_for("t"));
        let (legacy, legacy_calls) = StaticProvider::ok("device-code", jwt_for("t"));
        let mut auth = Authenticator::new("https://c", expect_tenant("t"))
            .with_primary(primary)
            .with_legacy(legacy);

        auth.login(true).unwrap();
        assert_eq!(primary_calls.load(Ordering::SeqCst), 0);
        assert_eq!(legacy_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cached_token_reused_until_threshold() {
        let (primary, calls) = StaticProvider::ok("sp", jwt_for("t"));
        let now = Arc::new(Mutex::new(Utc::now()));
        let clock_now = now.clone();
        let mut auth = Authenticator::new("https://c", expect_tenant("t"))
            .with_primary(primary)
            .with_clock(Box::new(move || *clock_now.lock().unwrap()));

        auth.token().unwrap();
        auth.token().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // one hour lifetime; 50 minutes later only 10 remain
        *now.lock().unwrap() += Duration::minutes(50);
        auth.token().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsupported_primary_goes_straight_to_legacy() {
        let (primary, primary_calls) = StaticProvider::ok("sp", jwt_for("t"));
        let (legacy, _) = StaticProvider::ok("device-code", jwt_for("t"));
        let mut auth = Authenticator::new("https://c", TokenExpectation::default())
            .with_primary(primary)
            .with_legacy(legacy)
            .with_primary_supported(false);
        assert_eq!(auth.token().unwrap().source, "device-code");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 0);
    }
}

//! Legacy interactive login chain
//!
//! Used when the primary chain yields nothing usable, or when the service
//! rejected a token and a fresh user login is forced. Order: silent reuse of a
//! cached account, `az login` in the terminal, device code.

use super::credential::{default_scope, parse_token_response, AzureCliCredential, CredentialProvider};
use super::http::{HttpRequest, HttpTransport};
use super::token::{decode_claims, AccessToken};
use crate::azure::cli::{args, AzCli};
use crate::error::{IoResultExt, OpsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Public client id of the Azure CLI, usable for device code logins
pub const AZURE_CLI_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Account remembered after an interactive login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccount {
    /// Account name (UPN)
    pub username: String,
    /// Home tenant
    pub tenant_id: String,
    /// Client the refresh token was issued to
    pub client_id: String,
    /// Refresh token
    pub refresh_token: String,
}

/// JSON file of [`CachedAccount`]s
#[derive(Debug, Clone)]
pub struct AccountCache {
    path: PathBuf,
}

impl AccountCache {
    /// Cache at an explicit path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<cache dir>/opskit/accounts.json`
    pub fn default_location() -> Option<Self> {
        dirs::cache_dir().map(|d| Self::new(d.join("opskit").join("accounts.json")))
    }

    /// Cache file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All cached accounts; a missing file is an empty cache
    pub fn load(&self) -> Result<Vec<CachedAccount>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path).with_path(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| {
            OpsError::Json(format!("account cache '{}': {}", self.path.display(), e))
        })
    }

    /// Insert or replace the entry for the same user, tenant and client
    pub fn upsert(&self, account: CachedAccount) -> Result<()> {
        let mut accounts = self.load()?;
        accounts.retain(|a| {
            !(a.username.eq_ignore_ascii_case(&account.username)
                && a.tenant_id == account.tenant_id
                && a.client_id == account.client_id)
        });
        accounts.push(account);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        let json = serde_json::to_string_pretty(&accounts)?;
        std::fs::write(&self.path, json).with_path(&self.path)?;
        restrict_permissions(&self.path)
    }

    /// Remember the refresh token that came with `token`
    fn remember(&self, token: &AccessToken, refresh_token: Option<String>, client_id: &str, tenant: &str) {
        let Some(refresh_token) = refresh_token else { return };
        let claims = decode_claims(&token.token).unwrap_or_default();
        let account = CachedAccount {
            username: claims.account().unwrap_or_default().to_string(),
            tenant_id: claims.tid.unwrap_or_else(|| tenant.to_string()),
            client_id: client_id.to_string(),
            refresh_token,
        };
        if let Err(e) = self.upsert(account) {
            tracing::warn!("Could not update account cache: {}", e);
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).with_path(path)
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Shared endpoint settings of the legacy flows
#[derive(Debug, Clone)]
pub struct LegacySettings {
    /// Authority host
    pub authority: String,
    /// Public client id
    pub client_id: String,
    /// Tenant for the login (`organizations` when unknown)
    pub tenant: String,
    /// Account to prefer from the cache
    pub account: Option<String>,
}

impl LegacySettings {
    fn token_url(&self, tenant: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority.trim_end_matches('/'), tenant)
    }
}

/// Refresh-token grant using an account from the cache
pub struct SilentCachedAccount {
    transport: Arc<dyn HttpTransport>,
    cache: AccountCache,
    settings: LegacySettings,
}

impl SilentCachedAccount {
    /// Create the provider
    pub fn new(transport: Arc<dyn HttpTransport>, cache: AccountCache, settings: LegacySettings) -> Self {
        Self {
            transport,
            cache,
            settings,
        }
    }

    fn pick(&self, tenant: Option<&str>) -> Result<CachedAccount> {
        let accounts = self.cache.load()?;
        accounts
            .into_iter()
            .filter(|a| a.client_id == self.settings.client_id)
            .filter(|a| tenant.map_or(true, |t| a.tenant_id.eq_ignore_ascii_case(t)))
            .find(|a| {
                self.settings
                    .account
                    .as_deref()
                    .map_or(true, |u| a.username.eq_ignore_ascii_case(u))
            })
            .ok_or_else(|| OpsError::auth(self.name(), "no matching cached account"))
    }
}

impl CredentialProvider for SilentCachedAccount {
    fn name(&self) -> &str {
        "cached-account"
    }

    fn acquire_token(&self, resource: &str, tenant: Option<&str>) -> Result<AccessToken> {
        let account = self.pick(tenant)?;
        let scope = format!("{} offline_access", default_scope(resource));
        let request = HttpRequest::form(
            self.settings.token_url(&account.tenant_id),
            &[
                ("grant_type", "refresh_token"),
                ("client_id", account.client_id.as_str()),
                ("refresh_token", account.refresh_token.as_str()),
                ("scope", scope.as_str()),
            ],
        );
        let response = self.transport.send(&request)?;
        let (token, refresh) = parse_token_response(self.name(), &response)?;
        self.cache
            .remember(&token, refresh, &account.client_id, &account.tenant_id);
        Ok(token)
    }
}

/// `az login` in the operator's terminal, then the CLI token
pub struct InteractiveBrowser {
    cli: AzCli,
    attended: bool,
}

impl InteractiveBrowser {
    /// `attended` tells whether a person is at the terminal
    pub fn new(cli: AzCli, attended: bool) -> Self {
        Self { cli, attended }
    }
}

impl CredentialProvider for InteractiveBrowser {
    fn name(&self) -> &str {
        "interactive-browser"
    }

    fn acquire_token(&self, resource: &str, tenant: Option<&str>) -> Result<AccessToken> {
        if !self.attended {
            return Err(OpsError::auth(self.name(), "no user attached to the terminal"));
        }
        let mut argv = args(["login"]);
        if let Some(t) = tenant {
            argv.extend(args(["--tenant", t]));
        }
        self.cli
            .run_attached(&argv)
            .map_err(|e| OpsError::auth(self.name(), e.to_string()))?;

        let mut token = AzureCliCredential::new(self.cli.clone()).acquire_token(resource, tenant)?;
        token.source = self.name().to_string();
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    user_code: String,
    #[serde(default)]
    verification_uri: String,
    #[serde(default = "default_device_expiry")]
    expires_in: u64,
    #[serde(default = "default_device_interval")]
    interval: u64,
}

fn default_device_expiry() -> u64 {
    900
}

fn default_device_interval() -> u64 {
    5
}

/// OAuth device authorization grant
pub struct DeviceCodeCredential {
    transport: Arc<dyn HttpTransport>,
    cache: Option<AccountCache>,
    settings: LegacySettings,
    poll_interval: Option<Duration>,
}

impl DeviceCodeCredential {
    /// Create the provider; successful logins are remembered in `cache`
    pub fn new(transport: Arc<dyn HttpTransport>, cache: Option<AccountCache>, settings: LegacySettings) -> Self {
        Self {
            transport,
            cache,
            settings,
            poll_interval: None,
        }
    }

    /// Poll at a fixed interval instead of the server-provided one
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

impl CredentialProvider for DeviceCodeCredential {
    fn name(&self) -> &str {
        "device-code"
    }

    fn acquire_token(&self, resource: &str, tenant: Option<&str>) -> Result<AccessToken> {
        let tenant = tenant.unwrap_or(&self.settings.tenant);
        let scope = format!("{} offline_access", default_scope(resource));
        let start = HttpRequest::form(
            format!(
                "{}/{}/oauth2/v2.0/devicecode",
                self.settings.authority.trim_end_matches('/'),
                tenant
            ),
            &[("client_id", self.settings.client_id.as_str()), ("scope", scope.as_str())],
        );
        let response = self.transport.send(&start)?;
        if !response.is_success() {
            return Err(parse_token_response(self.name(), &response)
                .err()
                .unwrap_or_else(|| OpsError::auth(self.name(), "device code request failed")));
        }
        let code: DeviceCodeResponse = response.json()?;

        if code.message.is_empty() {
            eprintln!("To sign in, open {} and enter the code {}", code.verification_uri, code.user_code);
        } else {
            eprintln!("{}", code.message);
        }

        let deadline = Instant::now() + Duration::from_secs(code.expires_in);
        let mut interval = self.poll_interval.unwrap_or(Duration::from_secs(code.interval));
        let poll = HttpRequest::form(
            self.settings.token_url(tenant),
            &[
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", self.settings.client_id.as_str()),
                ("device_code", code.device_code.as_str()),
            ],
        );

        while Instant::now() < deadline {
            std::thread::sleep(interval);
            let response = self.transport.send(&poll)?;
            if response.is_success() {
                let (token, refresh) = parse_token_response(self.name(), &response)?;
                if let Some(ref cache) = self.cache {
                    cache.remember(&token, refresh, &self.settings.client_id, tenant);
                }
                return Ok(token);
            }

            let err: super::credential::TokenError = serde_json::from_str(&response.body).unwrap_or_default();
            match err.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => {
                    if self.poll_interval.is_none() {
                        interval += Duration::from_secs(5);
                    }
                    tracing::debug!("Device code polling slowed to {:?}", interval);
                }
                _ => return parse_token_response(self.name(), &response).map(|(t, _)| t),
            }
        }

        Err(OpsError::auth(self.name(), "device code expired before sign-in completed"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::http::fake::ScriptedTransport;
    use super::super::http::HttpResponse;
    use super::super::token::test_jwt;
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn settings() -> LegacySettings {
        LegacySettings {
            authority: "https://login.example".into(),
            client_id: AZURE_CLI_CLIENT_ID.into(),
            tenant: "organizations".into(),
            account: None,
        }
    }

    fn token_body(refresh: &str) -> String {
        let jwt = test_jwt(json!({"tid": "tenant-a", "upn": "ops@contoso.com"}));
        json!({"access_token": jwt, "expires_in": 3600, "refresh_token": refresh}).to_string()
    }

    #[test]
    fn test_cache_upsert_replaces_same_account() {
        let dir = tempdir().unwrap();
        let cache = AccountCache::new(dir.path().join("nested").join("accounts.json"));
        assert!(cache.load().unwrap().is_empty());

        let account = CachedAccount {
            username: "ops@contoso.com".into(),
            tenant_id: "tenant-a".into(),
            client_id: "c".into(),
            refresh_token: "r1".into(),
        };
        cache.upsert(account.clone()).unwrap();
        cache
            .upsert(CachedAccount {
                username: "OPS@contoso.com".into(),
                refresh_token: "r2".into(),
                ..account
            })
            .unwrap();

        let accounts = cache.load().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].refresh_token, "r2");
    }

    #[test]
    fn test_device_code_polls_until_granted() {
        let dir = tempdir().unwrap();
        let cache = AccountCache::new(dir.path().join("accounts.json"));
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpResponse::new(
                200,
                r#"{"device_code": "dc", "user_code": "ABCD", "verification_uri": "https://microsoft.com/devicelogin",
                    "expires_in": 60, "interval": 5}"#,
            ),
            HttpResponse::new(400, r#"{"error": "authorization_pending"}"#),
            HttpResponse::new(400, r#"{"error": "slow_down"}"#),
            HttpResponse::new(200, token_body("refresh-1")),
        ]));

        let cred = DeviceCodeCredential::new(transport.clone(), Some(cache.clone()), settings())
            .with_poll_interval(Duration::ZERO);
        let token = cred.acquire_token("https://c.kusto.windows.net", None).unwrap();
        assert_eq!(token.source, "device-code");
        assert_eq!(transport.sent(), 4);

        let requests = transport.requests.lock().unwrap();
        assert!(requests[0].url.ends_with("/organizations/oauth2/v2.0/devicecode"));
        assert_eq!(requests[3].form_field("device_code"), Some("dc"));

        let cached = cache.load().unwrap();
        assert_eq!(cached[0].username, "ops@contoso.com");
        assert_eq!(cached[0].tenant_id, "tenant-a");
        assert_eq!(cached[0].refresh_token, "refresh-1");
    }

    #[test]
    fn test_device_code_declined() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            HttpResponse::new(200, r#"{"device_code": "dc", "message": "go sign in", "expires_in": 60}"#),
            HttpResponse::new(400, r#"{"error": "authorization_declined", "error_description": "nope"}"#),
        ]));
        let cred = DeviceCodeCredential::new(transport, None, settings()).with_poll_interval(Duration::ZERO);
        let err = cred.acquire_token("https://c", None).unwrap_err();
        assert!(err.to_string().contains("authorization_declined"));
    }

    #[test]
    fn test_silent_refresh_uses_cached_account() {
        let dir = tempdir().unwrap();
        let cache = AccountCache::new(dir.path().join("accounts.json"));
        cache
            .upsert(CachedAccount {
                username: "ops@contoso.com".into(),
                tenant_id: "tenant-a".into(),
                client_id: AZURE_CLI_CLIENT_ID.into(),
                refresh_token: "old".into(),
            })
            .unwrap();

        let transport = Arc::new(ScriptedTransport::new(vec![HttpResponse::new(200, token_body("new"))]));
        let silent = SilentCachedAccount::new(transport.clone(), cache.clone(), settings());

        assert!(silent.acquire_token("https://c", Some("tenant-b")).is_err());
        silent.acquire_token("https://c", Some("tenant-a")).unwrap();

        let sent = transport.requests.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].form_field("refresh_token"), Some("old"));
        assert_eq!(cache.load().unwrap()[0].refresh_token, "new");
    }

    #[test]
    fn test_interactive_requires_attended_terminal() {
        let browser = InteractiveBrowser::new(AzCli::with_binary("az"), false);
        assert!(matches!(
            browser.acquire_token("https://c", None),
            Err(OpsError::Authentication { .. })
        ));
    }
}

//! Credential providers for the primary (SDK-style) chain
//!
//! Providers are tried in a fixed order by the
//! [`Authenticator`](super::auth::Authenticator): service principal, explicit
//! managed identity, ambient managed identity, then the Azure CLI session.

use super::http::{HttpRequest, HttpResponse, HttpTransport};
use super::token::AccessToken;
use crate::azure::cli::{args, AzCli};
use crate::error::{OpsError, Result};
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Public cloud authority
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Something that can produce a token for a resource
pub trait CredentialProvider {
    /// Short name used in logs and error reports
    fn name(&self) -> &str;
    /// Acquire a token for `resource`, optionally in `tenant`
    fn acquire_token(&self, resource: &str, tenant: Option<&str>) -> Result<AccessToken>;
}

/// `{resource}/.default`, the v2 scope for a resource
pub fn default_scope(resource: &str) -> String {
    format!("{}/.default", resource.trim_end_matches('/'))
}

/// Token endpoint response, covering the AAD v2 and managed identity shapes
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<Value>,
    #[serde(default)]
    pub expires_on: Option<Value>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Error body of an AAD token endpoint
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}

// managed identity endpoints send numbers as strings
fn as_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl TokenResponse {
    pub fn expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self
            .expires_on
            .as_ref()
            .and_then(as_seconds)
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
        {
            return at;
        }
        let secs = self.expires_in.as_ref().and_then(as_seconds).unwrap_or(3600);
        now + Duration::seconds(secs)
    }
}

/// Decode a token endpoint reply into a token, or a provider error
pub(crate) fn parse_token_response(
    source: &str,
    response: &HttpResponse,
) -> Result<(AccessToken, Option<String>)> {
    if !response.is_success() {
        let err: TokenError = serde_json::from_str(&response.body).unwrap_or_default();
        let message = if err.error.is_empty() {
            format!("HTTP {}: {}", response.status, response.body.trim())
        } else {
            format!("{}: {}", err.error, err.error_description)
        };
        return Err(OpsError::auth(source, message));
    }
    let parsed: TokenResponse = response.json()?;
    let token = AccessToken::new(parsed.access_token.clone(), parsed.expiry(Utc::now()), source);
    Ok((token, parsed.refresh_token))
}

/// Client credentials grant for an application registration
pub struct ServicePrincipalCredential {
    transport: Arc<dyn HttpTransport>,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

impl ServicePrincipalCredential {
    /// Create the provider
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        authority: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            authority: authority.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl CredentialProvider for ServicePrincipalCredential {
    fn name(&self) -> &str {
        "service-principal"
    }

    fn acquire_token(&self, resource: &str, tenant: Option<&str>) -> Result<AccessToken> {
        let tenant = tenant.unwrap_or(&self.tenant_id);
        let url = format!("{}/{}/oauth2/v2.0/token", self.authority.trim_end_matches('/'), tenant);
        let scope = default_scope(resource);
        let request = HttpRequest::form(
            url,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ],
        );
        let response = self.transport.send(&request)?;
        parse_token_response(self.name(), &response).map(|(token, _)| token)
    }
}

/// Where a managed identity token can be requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsiEndpoint {
    /// App Service / Functions (`IDENTITY_ENDPOINT` + `IDENTITY_HEADER`)
    AppService {
        /// Endpoint URL
        endpoint: String,
        /// Value of the `X-IDENTITY-HEADER` header
        header: String,
    },
    /// Older hosts exposing `MSI_ENDPOINT` (and maybe `MSI_SECRET`)
    Legacy {
        /// Endpoint URL
        endpoint: String,
        /// Value of the `secret` header
        secret: Option<String>,
    },
    /// Instance Metadata Service on VMs
    Imds,
}

impl MsiEndpoint {
    /// Detect the endpoint from environment lookups
    pub fn detect<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let (Some(endpoint), Some(header)) = (lookup("IDENTITY_ENDPOINT"), lookup("IDENTITY_HEADER")) {
            return Self::AppService { endpoint, header };
        }
        if let Some(endpoint) = lookup("MSI_ENDPOINT") {
            return Self::Legacy {
                endpoint,
                secret: lookup("MSI_SECRET"),
            };
        }
        Self::Imds
    }

    /// Detect from the process environment
    pub fn from_env() -> Self {
        Self::detect(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    fn request(&self, resource: &str, client_id: Option<&str>) -> HttpRequest {
        let id_param = client_id
            .map(|id| format!("&client_id={}", id))
            .unwrap_or_default();
        match self {
            Self::AppService { endpoint, header } => HttpRequest::get(format!(
                "{}?api-version=2019-08-01&resource={}{}",
                endpoint, resource, id_param
            ))
            .header("X-IDENTITY-HEADER", header.clone()),
            Self::Legacy { endpoint, secret } => {
                let req = HttpRequest::get(format!(
                    "{}?api-version=2017-09-01&resource={}{}",
                    endpoint, resource, id_param
                ));
                match secret {
                    Some(s) => req.header("secret", s.clone()),
                    None => req,
                }
            }
            Self::Imds => HttpRequest::get(format!(
                "{}?api-version=2018-02-01&resource={}{}",
                IMDS_ENDPOINT, resource, id_param
            ))
            .header("Metadata", "true"),
        }
    }
}

/// Managed identity, either a specific user-assigned one or whatever the host offers
pub struct ManagedIdentityCredential {
    transport: Arc<dyn HttpTransport>,
    endpoint: MsiEndpoint,
    client_id: Option<String>,
    name: &'static str,
}

impl ManagedIdentityCredential {
    /// User-assigned identity chosen by client id
    pub fn explicit(transport: Arc<dyn HttpTransport>, endpoint: MsiEndpoint, client_id: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint,
            client_id: Some(client_id.into()),
            name: "managed-identity",
        }
    }

    /// Whatever identity the host assigns by default
    pub fn ambient(transport: Arc<dyn HttpTransport>, endpoint: MsiEndpoint) -> Self {
        Self {
            transport,
            endpoint,
            client_id: None,
            name: "ambient-managed-identity",
        }
    }
}

impl CredentialProvider for ManagedIdentityCredential {
    fn name(&self) -> &str {
        self.name
    }

    fn acquire_token(&self, resource: &str, _tenant: Option<&str>) -> Result<AccessToken> {
        let request = self.endpoint.request(resource, self.client_id.as_deref());
        let response = self
            .transport
            .send(&request)
            .map_err(|e| OpsError::auth(self.name, format!("endpoint unreachable: {}", e)))?;
        parse_token_response(self.name, &response).map(|(token, _)| token)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    // newer CLI versions add the POSIX timestamp
    #[serde(rename = "expires_on", default)]
    expires_on_epoch: Option<i64>,
}

impl CliToken {
    fn expiry(&self) -> Result<DateTime<Utc>> {
        if let Some(at) = self.expires_on_epoch.and_then(|s| Utc.timestamp_opt(s, 0).single()) {
            return Ok(at);
        }
        let raw = self
            .expires_on
            .as_deref()
            .ok_or_else(|| OpsError::auth("azure-cli", "token has no expiry"))?;
        // local wall-clock time, e.g. "2026-10-19 14:03:11.000000"
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|e| OpsError::auth("azure-cli", format!("bad expiry '{}': {}", raw, e)))?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| OpsError::auth("azure-cli", format!("ambiguous expiry '{}'", raw)))
    }
}

/// Token from the signed-in Azure CLI session
pub struct AzureCliCredential {
    cli: AzCli,
}

impl AzureCliCredential {
    /// Use the given CLI runner
    pub fn new(cli: AzCli) -> Self {
        Self { cli }
    }
}

impl CredentialProvider for AzureCliCredential {
    fn name(&self) -> &str {
        "azure-cli"
    }

    fn acquire_token(&self, resource: &str, tenant: Option<&str>) -> Result<AccessToken> {
        let mut argv = args(["account", "get-access-token", "--resource", resource]);
        if let Some(t) = tenant {
            argv.extend(args(["--tenant", t]));
        }
        let token: CliToken = self
            .cli
            .run_json(&argv)
            .map_err(|e| OpsError::auth(self.name(), e.to_string()))?;
        Ok(AccessToken::new(token.access_token.clone(), token.expiry()?, self.name()))
    }
}

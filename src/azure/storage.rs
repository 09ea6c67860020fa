//! Storage account inventory and user-delegation SAS tokens

use crate::azure::cli::{args, AzCli};
use crate::error::{OpsError, Result};
use crate::output::Tabular;
use crate::select::Confirmer;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Longest lifetime of a user delegation key, and so of the SAS
pub const MAX_SAS_LIFETIME_DAYS: i64 = 7;

const PERMISSION_ORDER: &str = "racwdl";

/// Storage account summary from `az storage account list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAccount {
    /// Account name
    pub name: String,
    /// Owning resource group
    #[serde(default)]
    pub resource_group: String,
    /// Region
    #[serde(default)]
    pub location: String,
    /// Account kind (StorageV2, BlobStorage, ...)
    #[serde(default)]
    pub kind: String,
    /// SKU
    #[serde(default)]
    pub sku: Option<Sku>,
}

/// Storage SKU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sku {
    /// SKU name, e.g. Standard_LRS
    pub name: String,
}

/// Blob container from `az storage container list`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Container name
    pub name: String,
    /// Container properties
    #[serde(default)]
    pub properties: ContainerProperties,
}

/// Subset of container properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProperties {
    /// Last modification time as reported by the service
    #[serde(default)]
    pub last_modified: Option<String>,
    /// Anonymous access level, if any
    #[serde(default)]
    pub public_access: Option<String>,
}

/// Account listing for output
pub struct AccountTable(pub Vec<StorageAccount>);

impl Tabular for AccountTable {
    fn columns(&self) -> Vec<String> {
        vec!["name".into(), "resource_group".into(), "location".into(), "kind".into(), "sku".into()]
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.0
            .iter()
            .map(|a| {
                vec![
                    json!(a.name),
                    json!(a.resource_group),
                    json!(a.location),
                    json!(a.kind),
                    json!(a.sku.as_ref().map(|s| s.name.as_str())),
                ]
            })
            .collect()
    }
}

/// Container listing for output
pub struct ContainerTable(pub Vec<Container>);

impl Tabular for ContainerTable {
    fn columns(&self) -> Vec<String> {
        vec!["name".into(), "last_modified".into(), "public_access".into()]
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.0
            .iter()
            .map(|c| {
                vec![
                    json!(c.name),
                    json!(c.properties.last_modified),
                    json!(c.properties.public_access),
                ]
            })
            .collect()
    }
}

/// SAS permission letters in canonical `racwdl` order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SasPermissions(String);

impl SasPermissions {
    /// Parse letters in any order; unknown letters are rejected
    pub fn parse(input: &str) -> Result<Self> {
        if let Some(bad) = input.chars().find(|c| !PERMISSION_ORDER.contains(*c)) {
            return Err(OpsError::InvalidArgument(format!(
                "unknown SAS permission '{}' (allowed: {})",
                bad, PERMISSION_ORDER
            )));
        }
        let canonical: String = PERMISSION_ORDER.chars().filter(|c| input.contains(*c)).collect();
        if canonical.is_empty() {
            return Err(OpsError::MissingParameter("--permissions".into()));
        }
        Ok(Self(canonical))
    }

    /// Letters as passed to the CLI
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether anything beyond read and list is granted
    pub fn grants_write(&self) -> bool {
        self.0.contains(['a', 'c', 'w', 'd'])
    }
}

impl fmt::Display for SasPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A container SAS to generate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SasRequest {
    /// Storage account
    pub account: String,
    /// Container
    pub container: String,
    /// Granted permissions
    pub permissions: SasPermissions,
    /// Expiry instant (UTC)
    pub expiry: DateTime<Utc>,
}

impl SasRequest {
    /// Build a request expiring `lifetime` after `now`
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        permissions: &str,
        lifetime: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let lifetime = Duration::from_std(lifetime)
            .map_err(|_| OpsError::InvalidArgument("SAS lifetime is out of range".into()))?;
        let request = Self {
            account: account.into(),
            container: container.into(),
            permissions: SasPermissions::parse(permissions)?,
            expiry: now + lifetime,
        };
        request.validate(now)?;
        Ok(request)
    }

    /// Expiry must be in the future and within the delegation key lifetime
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.expiry <= now {
            return Err(OpsError::InvalidArgument("SAS expiry must be in the future".into()));
        }
        if self.expiry > now + Duration::days(MAX_SAS_LIFETIME_DAYS) {
            return Err(OpsError::InvalidArgument(format!(
                "user delegation SAS cannot outlive {} days",
                MAX_SAS_LIFETIME_DAYS
            )));
        }
        Ok(())
    }

    /// Expiry in the format the CLI accepts
    pub fn expiry_arg(&self) -> String {
        self.expiry.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl fmt::Display for SasRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user-delegation SAS for {}/{} with '{}' until {}",
            self.account,
            self.container,
            self.permissions,
            self.expiry_arg()
        )
    }
}

/// Storage operations used by the commands
pub trait StorageApi {
    /// Accounts, optionally limited to one resource group
    fn list_accounts(&self, resource_group: Option<&str>) -> Result<Vec<StorageAccount>>;
    /// Containers of one account
    fn list_containers(&self, account: &str) -> Result<Vec<Container>>;
    /// Issue a user-delegation SAS token
    fn generate_sas(&self, request: &SasRequest) -> Result<String>;
}

/// [`StorageApi`] backed by `az storage`
pub struct AzStorageApi {
    cli: AzCli,
}

impl AzStorageApi {
    /// Wrap a CLI runner
    pub fn new(cli: AzCli) -> Self {
        Self { cli }
    }

    fn sas_args(request: &SasRequest) -> Vec<String> {
        args([
            "storage".to_string(),
            "container".to_string(),
            "generate-sas".to_string(),
            "--account-name".to_string(),
            request.account.clone(),
            "--name".to_string(),
            request.container.clone(),
            "--permissions".to_string(),
            request.permissions.to_string(),
            "--expiry".to_string(),
            request.expiry_arg(),
            "--as-user".to_string(),
            "--auth-mode".to_string(),
            "login".to_string(),
            "--https-only".to_string(),
        ])
    }
}

impl StorageApi for AzStorageApi {
    fn list_accounts(&self, resource_group: Option<&str>) -> Result<Vec<StorageAccount>> {
        let mut argv = args(["storage", "account", "list"]);
        if let Some(group) = resource_group {
            argv.extend(args(["--resource-group", group]));
        }
        self.cli.run_json(&argv)
    }

    fn list_containers(&self, account: &str) -> Result<Vec<Container>> {
        self.cli.run_json(&args([
            "storage",
            "container",
            "list",
            "--account-name",
            account,
            "--auth-mode",
            "login",
        ]))
    }

    fn generate_sas(&self, request: &SasRequest) -> Result<String> {
        let token: String = self.cli.run_json(&Self::sas_args(request))?;
        Ok(token)
    }
}

/// Confirm and issue a SAS; `Ok(None)` on a dry run
pub fn issue_sas(
    api: &dyn StorageApi,
    confirmer: &dyn Confirmer,
    request: &SasRequest,
    dry_run: bool,
) -> Result<Option<String>> {
    request.validate(Utc::now())?;

    if dry_run {
        tracing::info!("What if: generate {}", request);
        return Ok(None);
    }
    if request.permissions.grants_write() {
        tracing::warn!("SAS grants write access ('{}')", request.permissions);
    }
    confirmer.require(&format!("Generate {}?", request))?;

    let token = api.generate_sas(request)?;
    tracing::info!("Generated {}", request);
    Ok(Some(token))
}

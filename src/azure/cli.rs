//! Azure CLI integration
//!
//! All resource-management calls go through the installed `az` binary, which
//! already owns the operator's login session. Output is requested as JSON and
//! decoded into typed structs.

use crate::error::{OpsError, Result};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Azure CLI availability status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AzStatus {
    /// `az` found at this path
    Available(PathBuf),
    /// `az` is not installed or not on PATH
    NotInstalled,
}

/// Locate the Azure CLI
pub fn detect_az() -> AzStatus {
    match which::which("az") {
        Ok(path) => AzStatus::Available(path),
        Err(_) => AzStatus::NotInstalled,
    }
}

/// Runner for `az` subcommands
#[derive(Debug, Clone)]
pub struct AzCli {
    binary: PathBuf,
    subscription: Option<String>,
}

impl AzCli {
    /// Locate `az` on PATH
    pub fn new() -> Result<Self> {
        match detect_az() {
            AzStatus::Available(binary) => Ok(Self {
                binary,
                subscription: None,
            }),
            AzStatus::NotInstalled => Err(OpsError::AzCliNotFound),
        }
    }

    /// Use an explicit binary path
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            subscription: None,
        }
    }

    /// Target a specific subscription on every call
    pub fn with_subscription(mut self, subscription: Option<String>) -> Self {
        self.subscription = subscription;
        self
    }

    /// Subscription passed to every call, if any
    pub fn subscription(&self) -> Option<&str> {
        self.subscription.as_deref()
    }

    fn base_command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(ref sub) = self.subscription {
            // `az login` and `az account` do not take --subscription
            if !matches!(args.first().map(String::as_str), Some("login") | Some("account")) {
                cmd.arg("--subscription").arg(sub);
            }
        }
        cmd.arg("--output").arg("json");
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Run a command and return raw stdout
    pub fn run(&self, args: &[String]) -> Result<String> {
        let command_line = format!("az {}", args.join(" "));
        tracing::debug!("Running {}", command_line);

        let output = self
            .base_command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| OpsError::io(&self.binary, e))?;

        if !output.status.success() {
            return Err(OpsError::AzCli {
                command: command_line,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a command that inherits the terminal (interactive login)
    pub fn run_attached(&self, args: &[String]) -> Result<()> {
        let command_line = format!("az {}", args.join(" "));
        tracing::debug!("Running {} (attached)", command_line);

        let status = Command::new(&self.binary)
            .args(args)
            .status()
            .map_err(|e| OpsError::io(&self.binary, e))?;

        if !status.success() {
            return Err(OpsError::AzCli {
                command: command_line,
                status: status.code().unwrap_or(-1),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    /// Run a command and decode its JSON output
    pub fn run_json<T: DeserializeOwned>(&self, args: &[String]) -> Result<T> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout).map_err(|e| {
            OpsError::Json(format!("decoding output of 'az {}': {}", args.join(" "), e))
        })
    }
}

/// Build an owned argument vector from string slices
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Format a boolean the way `az` flags expect
pub fn az_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Last path segment of an ARM resource id
pub fn resource_name(id: &str) -> &str {
    id.trim_end_matches('/').rsplit('/').next().unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_az_agrees_with_new() {
        match detect_az() {
            AzStatus::Available(path) => {
                assert_eq!(path.file_stem().and_then(|s| s.to_str()), Some("az"));
                assert!(AzCli::new().is_ok());
            }
            AzStatus::NotInstalled => {
                assert!(matches!(AzCli::new(), Err(OpsError::AzCliNotFound)));
            }
        }
    }

    #[test]
    fn test_missing_binary_reports_path() {
        let cli = AzCli::with_binary("/nonexistent/opskit-test/az");
        match cli.run(&args(["account", "show"])) {
            Err(OpsError::Io { path, .. }) => assert_eq!(path, PathBuf::from("/nonexistent/opskit-test/az")),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_resource_name() {
        let id = "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/loadBalancers/lb/frontendIPConfigurations/fe1";
        assert_eq!(resource_name(id), "fe1");
        assert_eq!(resource_name("plain"), "plain");
    }

    #[test]
    fn test_subscription_not_added_to_account_commands() {
        let cli = AzCli::with_binary("az").with_subscription(Some("sub-1".into()));
        let cmd = cli.base_command(&args(["account", "show"]));
        let rendered: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(!rendered.contains(&"--subscription".to_string()));

        let cmd = cli.base_command(&args(["group", "show", "-n", "rg"]));
        let rendered: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(rendered.contains(&"sub-1".to_string()));
        assert_eq!(rendered.last().map(String::as_str), Some("json"));
    }

    #[test]
    fn test_failed_command_keeps_stderr() {
        let cli = AzCli::with_binary("false");
        match cli.run(&args(["group", "list"])) {
            Err(OpsError::AzCli { status, .. }) => assert_ne!(status, 0),
            Err(OpsError::Io { .. }) => {} // no `false` binary on this host
            other => panic!("unexpected: {:?}", other),
        }
    }
}

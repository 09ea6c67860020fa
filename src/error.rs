//! Error types for opskit
//!
//! Every helper in the crate returns [`Result`]; only the binary's entry
//! point turns an [`OpsError`] into a message and a process exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for opskit operations
#[derive(Error, Debug)]
pub enum OpsError {
    /// I/O error during file operations
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A command-line argument was rejected
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A required parameter was not supplied
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    /// Malformed line in an environment file
    #[error("Environment file error at line {line}: {message}")]
    EnvFile { line: usize, message: String },

    /// Tag key or value violates the resource tag rules
    #[error("Invalid tag '{key}': {reason}")]
    InvalidTag { key: String, reason: String },

    /// The Azure CLI exited with a failure status
    #[error("Azure CLI command '{command}' failed (exit {status}): {stderr}")]
    AzCli {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The Azure CLI binary could not be located
    #[error("Azure CLI ('az') not found on PATH")]
    AzCliNotFound,

    /// JSON payload could not be decoded
    #[error("JSON error: {0}")]
    Json(String),

    /// Load balancer rule does not exist
    #[error("Load balancer rule '{0}' not found")]
    RuleNotFound(String),

    /// Load balancer probe does not exist
    #[error("Health probe '{0}' not found")]
    ProbeNotFound(String),

    /// An existing rule or probe differs from the request and force was not given
    #[error("'{name}' already exists with different settings ({}); pass --force to update it", fields.join(", "))]
    RuleConflict { name: String, fields: Vec<String> },

    /// Frontend is used by an outbound rule but the inbound rule keeps SNAT enabled
    #[error("Frontend '{frontend}' is referenced by outbound rule '{outbound_rule}'; pass --disable-outbound-snat true")]
    OutboundSnatConflict {
        frontend: String,
        outbound_rule: String,
    },

    /// Probe is still referenced by load-balancing rules
    #[error("Probe '{probe}' is used by rule(s): {}", rules.join(", "))]
    ProbeInUse { probe: String, rules: Vec<String> },

    /// More than one candidate matched and no choice could be made
    #[error("Ambiguous {what}: candidates are {}", candidates.join(", "))]
    AmbiguousSelection {
        what: String,
        candidates: Vec<String>,
    },

    /// Nothing to choose from
    #[error("No {0} available")]
    NoCandidates(String),

    /// The operator declined a confirmation prompt
    #[error("Operation declined: {0}")]
    ConfirmationDeclined(String),

    /// A bearer token could not be decoded
    #[error("Token decode error: {0}")]
    TokenDecode(String),

    /// A single authentication method failed
    #[error("Authentication via {method} failed: {message}")]
    Authentication { method: String, message: String },

    /// Every authentication method was tried and none produced a usable token
    #[error("All authentication methods failed: {}", attempts.join("; "))]
    AuthenticationExhausted { attempts: Vec<String> },

    /// The service rejected the token after re-authentication
    #[error("Request to '{0}' was rejected with HTTP 401 after re-authentication")]
    Unauthorized(String),

    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Kusto returned a non-success status
    #[error("Kusto request failed with HTTP {status}: {body}")]
    KustoRequest { status: u16, body: String },

    /// An external command exited with a failure status
    #[error("Command '{command}' failed (exit {status}): {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// Some targets of a batch run failed
    #[error("{failed} of {total} target(s) failed")]
    BatchFailed { failed: usize, total: usize },

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<OpsError>,
    },
}

impl OpsError {
    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Create an authentication error for one method
    pub fn auth(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context wrappers
    pub fn root(&self) -> &OpsError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Self::ConfigError(_)
            | Self::InvalidArgument(_)
            | Self::MissingParameter(_)
            | Self::EnvFile { .. }
            | Self::InvalidTag { .. } => 2,
            Self::TokenDecode(_)
            | Self::Authentication { .. }
            | Self::AuthenticationExhausted { .. }
            | Self::Unauthorized(_) => 3,
            Self::ConfirmationDeclined(_) => 4,
            _ => 1,
        }
    }
}

/// Result type alias for opskit operations
pub type Result<T> = std::result::Result<T, OpsError>;

impl From<std::io::Error> for OpsError {
    fn from(err: std::io::Error) -> Self {
        OpsError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for OpsError {
    fn from(err: serde_json::Error) -> Self {
        OpsError::Json(err.to_string())
    }
}

impl From<reqwest::Error> for OpsError {
    fn from(err: reqwest::Error) -> Self {
        OpsError::Http(err.to_string())
    }
}

impl From<dialoguer::Error> for OpsError {
    fn from(err: dialoguer::Error) -> Self {
        match err {
            dialoguer::Error::IO(e) => OpsError::from(e),
        }
    }
}

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| OpsError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Result<()> = Err(io_err).with_path("/etc/app.env");
        match err {
            Err(OpsError::Io { path, .. }) => assert_eq!(path, PathBuf::from("/etc/app.env")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(OpsError::config("bad").exit_code(), 2);
        assert_eq!(OpsError::Unauthorized("https://x".into()).exit_code(), 3);
        assert_eq!(OpsError::ConfirmationDeclined("remove".into()).exit_code(), 4);
        assert_eq!(OpsError::RuleNotFound("web".into()).exit_code(), 1);
    }

    #[test]
    fn test_context_keeps_root_exit_code() {
        let err = OpsError::AuthenticationExhausted { attempts: vec![] }.with_context("login");
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().starts_with("login: "));
    }

    #[test]
    fn test_rule_conflict_names_fields() {
        let err = OpsError::RuleConflict {
            name: "https".into(),
            fields: vec!["frontend_port".into(), "idle_timeout_minutes".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("frontend_port"));
        assert!(msg.contains("idle_timeout_minutes"));
    }
}

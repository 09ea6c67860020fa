//! # opskit - operator toolkit for Azure and host fleets
//!
//! opskit gathers the everyday chores of an operations team into one library
//! and one binary. Every tool is a thin subcommand over a library module, so
//! the logic can be driven and tested without a cloud account or a terminal.
//!
//! ## Features
//!
//! - **Load balancer rules and probes**: idempotent add, update and remove
//!   with field-level diffs, dry runs and outbound SNAT checks
//! - **Kusto queries**: two-tier credential chains with claim validation,
//!   one forced re-login on 401, and result table clean-up
//! - **Environment files**: `.env` style loading with override control
//! - **Tags and storage**: validated tag plans, account inventory and
//!   user-delegation SAS tokens
//! - **Monitoring**: process listings, process start/exit and port watchers
//! - **Fan-out**: bounded parallel runs over many targets with progress
//!
//! ## Load balancer rules
//!
//! ```no_run
//! use opskit::azure::AzCli;
//! use opskit::azure::loadbalancer::{AzLoadBalancerApi, LbAction, LbManager, LbOptions, LbTarget, RuleSpec};
//! use opskit::select::{default_confirmer, default_selector};
//!
//! let api = AzLoadBalancerApi::new(AzCli::new().unwrap());
//! let selector = default_selector(false);
//! let confirmer = default_confirmer(true);
//! let manager = LbManager::new(&api, selector.as_ref(), confirmer.as_ref(), LbOptions::default());
//!
//! let spec = RuleSpec {
//!     name: "https".into(),
//!     idle_timeout_minutes: Some(25),
//!     ..Default::default()
//! };
//! let outcome = manager
//!     .execute(&LbTarget::new("rg-web", "lb-web"), LbAction::Update(spec))
//!     .unwrap();
//! println!("{}", outcome);
//! ```
//!
//! ## Kusto
//!
//! ```no_run
//! use opskit::kusto::{Authenticator, AzureCliCredential, KustoClient, ReqwestTransport, TokenExpectation};
//! use opskit::azure::AzCli;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let cluster = "https://help.kusto.windows.net";
//! let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(300)).unwrap());
//! let auth = Authenticator::new(cluster, TokenExpectation::default())
//!     .with_primary(Box::new(AzureCliCredential::new(AzCli::new().unwrap())));
//! let mut client = KustoClient::new(cluster, transport, auth);
//!
//! for mut table in client.execute_query("Samples", "StormEvents | take 5").unwrap() {
//!     table.remove_empty_columns();
//!     table.dedupe_column_names();
//!     println!("{} rows in {}", table.rows.len(), table.name);
//! }
//! ```
//!
//! ## Fan-out
//!
//! ```no_run
//! use opskit::batch::{BatchRunner, CommandTemplate};
//!
//! let template = CommandTemplate::new(vec!["ping".into(), "-c".into(), "1".into()]).unwrap();
//! let targets = vec!["web01".to_string(), "web02".to_string()];
//! let report = BatchRunner::new(4)
//!     .run(&targets, |t| template.execute(t), None)
//!     .unwrap();
//! println!("{} of {} failed", report.failed(), report.outcomes.len());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod azure;
pub mod batch;
pub mod config;
pub mod error;
pub mod kusto;
pub mod monitor;
pub mod output;
pub mod progress;
pub mod select;

// Re-export commonly used types
pub use config::{CliArgs, Commands};
pub use error::{OpsError, Result};
pub use output::{OutputFormat, Tabular};
pub use progress::ProgressReporter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use opskit::prelude::*;
    //! ```

    pub use crate::azure::loadbalancer::{LbAction, LbManager, LbOptions, LbOutcome, LbTarget, ProbeSpec, RuleSpec};
    pub use crate::azure::tags::{apply_tags, TagMode, TagPlan, TagScope, TagSet};
    pub use crate::azure::AzCli;
    pub use crate::batch::{BatchReport, BatchRunner, CommandTemplate};
    pub use crate::config::{load_env_file, parse_env, EnvStore, ProcessEnv};
    pub use crate::error::{OpsError, Result};
    pub use crate::kusto::{Authenticator, CredentialProvider, KustoClient, ResultTable};
    pub use crate::monitor::{PortWatcher, ProcessQuery, ProcessWatcher, SysinfoSource, TcpProbe};
    pub use crate::output::{render, OutputFormat, Tabular};
    pub use crate::progress::ProgressReporter;
    pub use crate::select::{default_confirmer, default_selector, Confirmer, SelectionStrategy};
}

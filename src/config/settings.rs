//! Command-line settings for opskit
//!
//! Global flags live on [`CliArgs`]; every operator tool is a subcommand with
//! its own argument struct. Credentials and the default cluster can come from
//! the environment (or an `--env-file`) instead of the command line.

use crate::azure::loadbalancer::{ProbeProtocol, ProbeSpec, RuleSpec, TransportProtocol};
use crate::kusto::{AZURE_CLI_CLIENT_ID, DEFAULT_AUTHORITY};
use crate::monitor::{PortTarget, ProcessSortKey};
use crate::output::OutputFormat;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// opskit - operator tooling for Azure load balancers, Kusto and fleets of hosts
#[derive(Parser, Debug, Clone)]
#[command(name = "opskit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator toolkit for Azure resources, Kusto queries and host fleets")]
#[command(long_about = r#"
opskit bundles day-to-day operator tasks behind one binary.

Examples:
  opskit lb -g rg-web -n lb-web add --name https --frontend-port 443 --backend-port 443
  opskit lb -g rg-web -n lb-web update --name https --idle-timeout 25 --dry-run
  opskit kusto --cluster https://help.kusto.windows.net -d Samples "StormEvents | take 10"
  opskit env load .env --override
  opskit tags --resource-group rg-web set env=prod owner=web-team
  opskit ps --name nginx --sort memory --top 5
  opskit watch-port db01:5432 db02:5432 --interval 10s
  opskit batch -t web01,web02 --throttle 4 -- ssh {} uptime
"#)]
pub struct CliArgs {
    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (errors only, no progress bars)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Output format for results
    #[arg(short = 'o', long, value_enum, default_value = "text", global = true)]
    pub output: OutputFormat,

    /// Log line format on stderr
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Show what would change without changing anything
    #[arg(long, visible_alias = "what-if", global = true)]
    pub dry_run: bool,

    /// Answer yes to every confirmation prompt
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Load KEY=VALUE pairs from this file into the environment first
    #[arg(long, value_name = "PATH", global = true)]
    pub env_file: Option<PathBuf>,

    /// Azure subscription for resource commands
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", global = true)]
    pub subscription: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output format
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Manage load-balancing rules and health probes
    #[command(name = "lb")]
    Lb(LbArgs),

    /// Run a Kusto query or management command
    #[command(name = "kusto")]
    Kusto(KustoArgs),

    /// Load or check environment files
    #[command(name = "env")]
    Env {
        /// Env action
        #[command(subcommand)]
        action: EnvCommand,
    },

    /// Show and change resource tags
    #[command(name = "tags")]
    Tags(TagsArgs),

    /// Storage accounts, containers and SAS tokens
    #[command(name = "storage")]
    Storage {
        /// Storage action
        #[command(subcommand)]
        action: StorageCommand,
    },

    /// List processes
    #[command(name = "ps")]
    Ps(PsArgs),

    /// Report processes starting and exiting
    #[command(name = "watch-process")]
    WatchProcess(WatchProcessArgs),

    /// Report TCP ports opening and closing
    #[command(name = "watch-port")]
    WatchPort(WatchPortArgs),

    /// Run a command against many targets in parallel
    #[command(name = "batch")]
    Batch(BatchArgs),
}

/// Load balancer selection and behaviour
#[derive(Args, Debug, Clone)]
pub struct LbArgs {
    /// Resource group of the load balancer
    #[arg(short = 'g', long)]
    pub resource_group: String,

    /// Load balancer name
    #[arg(short = 'n', long = "lb-name")]
    pub lb_name: String,

    /// Let add overwrite a differing rule or probe, and skip removal prompts
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Fail instead of disabling outbound SNAT on frontends shared with outbound rules
    #[arg(long)]
    pub no_auto_fix_snat: bool,

    /// Prompt when a frontend or pool has to be chosen
    #[arg(long)]
    pub interactive: bool,

    /// Action
    #[command(subcommand)]
    pub action: LbCommand,
}

/// Load balancer actions
#[derive(Subcommand, Debug, Clone)]
pub enum LbCommand {
    /// Create a rule (no-op when an identical rule exists)
    Add(RuleArgs),
    /// Change an existing rule
    Update(RuleArgs),
    /// Delete a rule
    Remove {
        /// Rule name
        #[arg(long)]
        name: String,
    },
    /// List rules
    List,
    /// Create a health probe
    AddProbe(ProbeArgs),
    /// Change a health probe
    UpdateProbe(ProbeArgs),
    /// Delete a health probe
    RemoveProbe {
        /// Probe name
        #[arg(long)]
        name: String,
    },
    /// List health probes
    ListProbes,
}

/// Rule attributes; anything omitted keeps its current value
#[derive(Args, Debug, Clone)]
pub struct RuleArgs {
    /// Rule name
    #[arg(long)]
    pub name: String,

    /// Frontend IP configuration name
    #[arg(long, value_name = "NAME")]
    pub frontend_ip: Option<String>,

    /// Backend pool name
    #[arg(long, value_name = "NAME")]
    pub backend_pool: Option<String>,

    /// Health probe name
    #[arg(long, value_name = "NAME")]
    pub probe: Option<String>,

    /// Transport protocol
    #[arg(long, value_enum)]
    pub protocol: Option<TransportProtocol>,

    /// Frontend port
    #[arg(long, value_name = "PORT")]
    pub frontend_port: Option<u16>,

    /// Backend port
    #[arg(long, value_name = "PORT")]
    pub backend_port: Option<u16>,

    /// Idle timeout in minutes (4-100)
    #[arg(long = "idle-timeout", value_name = "MINUTES")]
    pub idle_timeout: Option<u32>,

    /// Floating IP (direct server return)
    #[arg(long, value_name = "BOOL")]
    pub floating_ip: Option<bool>,

    /// Disable outbound SNAT for the backends
    #[arg(long, value_name = "BOOL")]
    pub disable_outbound_snat: Option<bool>,
}

impl RuleArgs {
    /// Request as the manager understands it
    pub fn to_spec(&self) -> RuleSpec {
        RuleSpec {
            name: self.name.clone(),
            frontend_ip: self.frontend_ip.clone(),
            backend_pool: self.backend_pool.clone(),
            probe: self.probe.clone(),
            protocol: self.protocol,
            frontend_port: self.frontend_port,
            backend_port: self.backend_port,
            idle_timeout_minutes: self.idle_timeout,
            floating_ip: self.floating_ip,
            disable_outbound_snat: self.disable_outbound_snat,
        }
    }
}

/// Probe attributes; anything omitted keeps its current value
#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Probe name
    #[arg(long)]
    pub name: String,

    /// Probe protocol
    #[arg(long, value_enum)]
    pub protocol: Option<ProbeProtocol>,

    /// Probed port
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds between probes
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u32>,

    /// Failed probes before a backend is taken out
    #[arg(long, value_name = "NUM")]
    pub threshold: Option<u32>,

    /// Request path for HTTP/HTTPS probes
    #[arg(long)]
    pub path: Option<String>,
}

impl ProbeArgs {
    /// Request as the manager understands it
    pub fn to_spec(&self) -> ProbeSpec {
        ProbeSpec {
            name: self.name.clone(),
            protocol: self.protocol,
            port: self.port,
            interval_seconds: self.interval,
            threshold: self.threshold,
            request_path: self.path.clone(),
        }
    }
}

/// Kusto connection, authentication and output shaping
#[derive(Args, Debug, Clone)]
pub struct KustoArgs {
    /// Cluster URL
    #[arg(long, env = "KUSTO_CLUSTER")]
    pub cluster: String,

    /// Database
    #[arg(short = 'd', long, env = "KUSTO_DATABASE")]
    pub database: String,

    /// Query or management command text
    #[arg(value_name = "QUERY", conflicts_with = "query_file")]
    pub query: Option<String>,

    /// Read the query from a file
    #[arg(long, value_name = "PATH")]
    pub query_file: Option<PathBuf>,

    /// Tenant the token must belong to
    #[arg(long, env = "AZURE_TENANT_ID")]
    pub tenant: Option<String>,

    /// Account (UPN) the token must belong to
    #[arg(long, value_name = "UPN")]
    pub account: Option<String>,

    /// Service principal application id
    #[arg(long, env = "AZURE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Service principal secret
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Client id of a user-assigned managed identity
    #[arg(long, env = "AZURE_MANAGED_IDENTITY_CLIENT_ID")]
    pub managed_identity_client_id: Option<String>,

    /// Skip the primary chain and sign in interactively
    #[arg(long)]
    pub legacy_auth: bool,

    /// Authority host
    #[arg(long, default_value = DEFAULT_AUTHORITY)]
    pub authority: String,

    /// Public client id for device code logins
    #[arg(long, default_value = AZURE_CLI_CLIENT_ID)]
    pub device_client_id: String,

    /// Account cache file (defaults to the user cache directory)
    #[arg(long, value_name = "PATH")]
    pub account_cache: Option<PathBuf>,

    /// Server-side timeout (e.g. 4m)
    #[arg(long, default_value = "4m", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Keep columns that are empty in every row
    #[arg(long)]
    pub keep_empty_columns: bool,

    /// Keep duplicate column names as returned
    #[arg(long)]
    pub no_dedupe: bool,

    /// Print every result table, not only the primary one
    #[arg(long)]
    pub all_tables: bool,
}

/// Environment file actions
#[derive(Subcommand, Debug, Clone)]
pub enum EnvCommand {
    /// Load a file into the process environment and report what was set
    Load {
        /// File to load
        file: PathBuf,
        /// Replace variables that are already set
        #[arg(long = "override")]
        override_existing: bool,
    },
    /// Parse a file and list its keys (values are never printed)
    Check {
        /// File to check
        file: PathBuf,
    },
}

/// Tag target and action
#[derive(Args, Debug, Clone)]
#[command(group(clap::ArgGroup::new("scope").required(true).args(["resource_group", "resource_id"])))]
pub struct TagsArgs {
    /// Resource group whose tags to manage
    #[arg(short = 'g', long)]
    pub resource_group: Option<String>,

    /// Full resource id whose tags to manage
    #[arg(long)]
    pub resource_id: Option<String>,

    /// Action
    #[command(subcommand)]
    pub action: TagsCommand,
}

/// Tag actions
#[derive(Subcommand, Debug, Clone)]
pub enum TagsCommand {
    /// Show current tags
    Show,
    /// Add or change tags
    Set {
        /// KEY=VALUE pairs
        #[arg(required = true, value_name = "KEY=VALUE")]
        tags: Vec<String>,
        /// Drop every tag not listed
        #[arg(long)]
        replace: bool,
    },
    /// Remove tags by key (KEY=VALUE removes only on a matching value)
    Remove {
        /// Keys to remove
        #[arg(required = true, value_name = "KEY")]
        keys: Vec<String>,
    },
}

/// Storage actions
#[derive(Subcommand, Debug, Clone)]
pub enum StorageCommand {
    /// List storage accounts
    Accounts {
        /// Limit to one resource group
        #[arg(short = 'g', long)]
        resource_group: Option<String>,
    },
    /// List containers of an account
    Containers {
        /// Storage account
        #[arg(long)]
        account: String,
    },
    /// Generate a user-delegation SAS for a container
    Sas {
        /// Storage account
        #[arg(long)]
        account: String,
        /// Container
        #[arg(long)]
        container: String,
        /// Permission letters from racwdl
        #[arg(long, default_value = "rl")]
        permissions: String,
        /// Lifetime of the token (at most 7d)
        #[arg(long, default_value = "1h", value_parser = parse_duration)]
        expiry: Duration,
    },
}

/// Process listing options
#[derive(Args, Debug, Clone)]
pub struct PsArgs {
    /// Only processes whose name or command line contains this
    #[arg(long)]
    pub name: Option<String>,

    /// Sort order
    #[arg(long, value_enum, default_value = "cpu")]
    pub sort: ProcessSortKey,

    /// Show only the first N
    #[arg(long, value_name = "N")]
    pub top: Option<usize>,
}

/// Process watch options
#[derive(Args, Debug, Clone)]
pub struct WatchProcessArgs {
    /// Only processes whose name or command line contains this
    #[arg(long)]
    pub name: Option<String>,

    /// Time between polls
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub interval: Duration,

    /// Stop after this many polls (Ctrl-C stops at any time)
    #[arg(long, value_name = "N")]
    pub count: Option<usize>,
}

/// Port watch options
#[derive(Args, Debug, Clone)]
pub struct WatchPortArgs {
    /// Targets as host:port
    #[arg(required = true, value_name = "HOST:PORT")]
    pub targets: Vec<PortTarget>,

    /// Time between polls
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub interval: Duration,

    /// Connect timeout per probe
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Stop after this many polls (Ctrl-C stops at any time)
    #[arg(long, value_name = "N")]
    pub count: Option<usize>,
}

/// Fan-out options
#[derive(Args, Debug, Clone)]
#[command(group(clap::ArgGroup::new("target_source").required(true).multiple(true).args(["targets_file", "target"])))]
pub struct BatchArgs {
    /// File with one target per line
    #[arg(long = "targets", value_name = "PATH")]
    pub targets_file: Option<PathBuf>,

    /// Targets on the command line (comma separated or repeated)
    #[arg(short = 't', long = "target", value_delimiter = ',')]
    pub target: Vec<String>,

    /// Jobs in flight at once (0 = one per CPU)
    #[arg(long, default_value = "8", value_name = "NUM")]
    pub throttle: usize,

    /// Command to run; `{}` is replaced by the target
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Find `--env-file` in raw arguments
///
/// The file has to be loaded before clap reads its environment fallbacks, so
/// this runs ahead of the real parse. Scanning stops at `--`.
pub fn env_file_from_args<I, S>(argv: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut iter = argv.into_iter();
    while let Some(arg) = iter.next() {
        let arg = arg.as_ref();
        if arg == "--" {
            break;
        }
        if arg == "--env-file" {
            return iter.next().map(|p| PathBuf::from(p.as_ref()));
        }
        if let Some(path) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

/// Parse a human duration such as `30s`, `5m` or `7d`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    humantime::parse_duration(input.trim()).map_err(|e| format!("invalid duration '{}': {}", input, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86400));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_lb_update_only_carries_given_fields() {
        let args = CliArgs::try_parse_from([
            "opskit", "lb", "-g", "rg", "-n", "lb", "update", "--name", "https", "--idle-timeout", "25", "--what-if",
        ])
        .unwrap();
        assert!(args.dry_run);
        match args.command {
            Commands::Lb(LbArgs { action: LbCommand::Update(rule), .. }) => {
                let spec = rule.to_spec();
                assert_eq!(spec.idle_timeout_minutes, Some(25));
                assert_eq!(spec.frontend_port, None);
                assert_eq!(spec.floating_ip, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_batch_trailing_command() {
        let args = CliArgs::try_parse_from([
            "opskit", "batch", "-t", "web01,web02", "--throttle", "2", "--", "ssh", "{}", "uptime",
        ])
        .unwrap();
        match args.command {
            Commands::Batch(batch) => {
                assert_eq!(batch.target, vec!["web01", "web02"]);
                assert_eq!(batch.throttle, 2);
                assert_eq!(batch.command, vec!["ssh", "{}", "uptime"]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_env_file_prescan() {
        assert_eq!(
            env_file_from_args(["opskit", "--env-file", "prod.env", "kusto"]),
            Some(PathBuf::from("prod.env"))
        );
        assert_eq!(
            env_file_from_args(["opskit", "kusto", "--env-file=.env"]),
            Some(PathBuf::from(".env"))
        );
        assert_eq!(env_file_from_args(["opskit", "batch", "-t", "a", "--", "cmd", "--env-file", "x"]), None);
    }

    #[test]
    fn test_batch_requires_targets() {
        assert!(CliArgs::try_parse_from(["opskit", "batch", "--", "true"]).is_err());
    }

    #[test]
    fn test_tags_need_a_scope() {
        assert!(CliArgs::try_parse_from(["opskit", "tags", "show"]).is_err());
        assert!(CliArgs::try_parse_from(["opskit", "tags", "-g", "rg", "set", "env=prod"]).is_ok());
    }

    #[test]
    fn test_watch_port_parses_targets() {
        let args = CliArgs::try_parse_from(["opskit", "watch-port", "db:5432", "--count", "1"]).unwrap();
        match args.command {
            Commands::WatchPort(w) => {
                assert_eq!(w.targets[0].port, 5432);
                assert_eq!(w.count, Some(1));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(CliArgs::try_parse_from(["opskit", "watch-port", "db"]).is_err());
    }
}

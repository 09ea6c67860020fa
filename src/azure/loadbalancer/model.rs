//! Load balancer resource model
//!
//! Mirrors the subset of the ARM load balancer payload the manager reads.
//! Field names follow the JSON emitted by `az network lb show`.

use crate::azure::cli::resource_name;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to another resource by ARM id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResource {
    /// Full ARM resource id
    pub id: String,
}

impl SubResource {
    /// Child resource name (last id segment)
    pub fn name(&self) -> &str {
        resource_name(&self.id)
    }
}

/// Transport protocol of a load-balancing rule
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransportProtocol {
    /// TCP
    #[default]
    #[value(name = "tcp")]
    Tcp,
    /// UDP
    #[value(name = "udp")]
    Udp,
    /// All protocols (HA ports)
    #[value(name = "all")]
    All,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "Tcp",
            Self::Udp => "Udp",
            Self::All => "All",
        })
    }
}

/// Health probe protocol
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProbeProtocol {
    /// TCP connect
    #[default]
    #[value(name = "tcp")]
    Tcp,
    /// HTTP GET on a path
    #[value(name = "http")]
    Http,
    /// HTTPS GET on a path
    #[value(name = "https")]
    Https,
}

impl ProbeProtocol {
    /// Whether probes of this kind carry a request path
    pub fn uses_path(&self) -> bool {
        !matches!(self, Self::Tcp)
    }
}

impl fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "Tcp",
            Self::Http => "Http",
            Self::Https => "Https",
        })
    }
}

/// Frontend IP configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontendIpConfiguration {
    /// Frontend name
    pub name: String,
    /// ARM id
    #[serde(default)]
    pub id: String,
    /// Private address, for internal load balancers
    #[serde(rename = "privateIPAddress", default)]
    pub private_ip_address: Option<String>,
    /// Public IP resource, for public load balancers
    #[serde(rename = "publicIPAddress", default)]
    pub public_ip_address: Option<SubResource>,
    /// Outbound rules that use this frontend
    #[serde(default)]
    pub outbound_rules: Option<Vec<SubResource>>,
}

/// Backend address pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendPool {
    /// Pool name
    pub name: String,
    /// ARM id
    #[serde(default)]
    pub id: String,
}

/// Health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// Probe name
    pub name: String,
    /// ARM id
    #[serde(default)]
    pub id: String,
    /// Probe protocol
    pub protocol: ProbeProtocol,
    /// Probed port
    pub port: u16,
    /// Seconds between probes
    #[serde(default = "default_interval")]
    pub interval_in_seconds: u32,
    /// Consecutive failures before marking a backend down
    #[serde(default = "default_threshold")]
    pub number_of_probes: u32,
    /// Path for HTTP(S) probes
    #[serde(default)]
    pub request_path: Option<String>,
}

fn default_interval() -> u32 {
    15
}

fn default_threshold() -> u32 {
    2
}

/// Load-balancing (inbound) rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancingRule {
    /// Rule name
    pub name: String,
    /// ARM id
    #[serde(default)]
    pub id: String,
    /// Transport protocol
    pub protocol: TransportProtocol,
    /// Frontend port
    pub frontend_port: u16,
    /// Backend port
    pub backend_port: u16,
    /// Idle timeout in minutes
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_in_minutes: u32,
    /// Floating IP (direct server return)
    #[serde(rename = "enableFloatingIP", default)]
    pub enable_floating_ip: bool,
    /// Disable outbound SNAT for backends of this rule
    #[serde(default)]
    pub disable_outbound_snat: bool,
    /// Frontend used by the rule
    #[serde(rename = "frontendIPConfiguration", default)]
    pub frontend_ip_configuration: Option<SubResource>,
    /// Backend pool used by the rule
    #[serde(default)]
    pub backend_address_pool: Option<SubResource>,
    /// Health probe used by the rule
    #[serde(default)]
    pub probe: Option<SubResource>,
}

fn default_idle_timeout() -> u32 {
    4
}

/// Outbound rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRule {
    /// Rule name
    pub name: String,
    /// ARM id
    #[serde(default)]
    pub id: String,
    /// Frontends used for egress
    #[serde(rename = "frontendIPConfigurations", default)]
    pub frontend_ip_configurations: Vec<SubResource>,
    /// Pool whose members egress through this rule
    #[serde(default)]
    pub backend_address_pool: Option<SubResource>,
}

/// Load balancer as returned by `az network lb show`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    /// Load balancer name
    pub name: String,
    /// ARM id
    #[serde(default)]
    pub id: String,
    /// Region
    #[serde(default)]
    pub location: Option<String>,
    /// Frontends
    #[serde(rename = "frontendIPConfigurations", default)]
    pub frontend_ip_configurations: Vec<FrontendIpConfiguration>,
    /// Backend pools
    #[serde(default)]
    pub backend_address_pools: Vec<BackendPool>,
    /// Health probes
    #[serde(default)]
    pub probes: Vec<Probe>,
    /// Inbound rules
    #[serde(default)]
    pub load_balancing_rules: Vec<LoadBalancingRule>,
    /// Outbound rules
    #[serde(default)]
    pub outbound_rules: Vec<OutboundRule>,
}

impl LoadBalancer {
    /// Find a rule by name (case-insensitive, as ARM names are)
    pub fn rule(&self, name: &str) -> Option<&LoadBalancingRule> {
        self.load_balancing_rules
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Find a probe by name
    pub fn probe(&self, name: &str) -> Option<&Probe> {
        self.probes.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Find a frontend by name
    pub fn frontend(&self, name: &str) -> Option<&FrontendIpConfiguration> {
        self.frontend_ip_configurations
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Whether a backend pool with this name exists
    pub fn has_pool(&self, name: &str) -> bool {
        self.backend_address_pools
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Names of all frontends
    pub fn frontend_names(&self) -> Vec<String> {
        self.frontend_ip_configurations.iter().map(|f| f.name.clone()).collect()
    }

    /// Names of all backend pools
    pub fn pool_names(&self) -> Vec<String> {
        self.backend_address_pools.iter().map(|p| p.name.clone()).collect()
    }

    /// First outbound rule that egresses through the given frontend
    pub fn outbound_rule_using(&self, frontend: &str) -> Option<String> {
        let direct = self.outbound_rules.iter().find(|o| {
            o.frontend_ip_configurations
                .iter()
                .any(|f| f.name().eq_ignore_ascii_case(frontend))
        });
        if let Some(rule) = direct {
            return Some(rule.name.clone());
        }

        // Older payloads only carry the back-reference on the frontend
        self.frontend(frontend)
            .and_then(|f| f.outbound_rules.as_ref())
            .and_then(|refs| refs.first())
            .map(|r| r.name().to_string())
    }

    /// Rules that reference a probe
    pub fn rules_using_probe(&self, probe: &str) -> Vec<String> {
        self.load_balancing_rules
            .iter()
            .filter(|r| {
                r.probe
                    .as_ref()
                    .map(|p| p.name().eq_ignore_ascii_case(probe))
                    .unwrap_or(false)
            })
            .map(|r| r.name.clone())
            .collect()
    }
}

/// Snapshot of a load balancer printed when an operation fails
pub struct DiagnosticDump<'a>(pub &'a LoadBalancer);

impl fmt::Display for DiagnosticDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lb = self.0;
        writeln!(f, "=== Load balancer '{}' ===", lb.name)?;

        writeln!(f, "Frontends:")?;
        for fe in &lb.frontend_ip_configurations {
            let addr = fe
                .private_ip_address
                .clone()
                .or_else(|| fe.public_ip_address.as_ref().map(|p| p.name().to_string()))
                .unwrap_or_else(|| "-".to_string());
            writeln!(f, "  {:24} {}", fe.name, addr)?;
        }

        writeln!(f, "Backend pools:")?;
        for pool in &lb.backend_address_pools {
            writeln!(f, "  {}", pool.name)?;
        }

        writeln!(f, "Probes:")?;
        for p in &lb.probes {
            writeln!(
                f,
                "  {:24} {}:{} every {}s x{} {}",
                p.name,
                p.protocol,
                p.port,
                p.interval_in_seconds,
                p.number_of_probes,
                p.request_path.as_deref().unwrap_or("")
            )?;
        }

        writeln!(f, "Rules:")?;
        for r in &lb.load_balancing_rules {
            writeln!(
                f,
                "  {:24} {} {}->{} fe={} pool={} probe={} idle={}m floatingIP={} disableSNAT={}",
                r.name,
                r.protocol,
                r.frontend_port,
                r.backend_port,
                r.frontend_ip_configuration.as_ref().map(|s| s.name()).unwrap_or("-"),
                r.backend_address_pool.as_ref().map(|s| s.name()).unwrap_or("-"),
                r.probe.as_ref().map(|s| s.name()).unwrap_or("-"),
                r.idle_timeout_in_minutes,
                r.enable_floating_ip,
                r.disable_outbound_snat
            )?;
        }

        writeln!(f, "Outbound rules:")?;
        for o in &lb.outbound_rules {
            let fes: Vec<&str> = o.frontend_ip_configurations.iter().map(|s| s.name()).collect();
            writeln!(
                f,
                "  {:24} fe=[{}] pool={}",
                o.name,
                fes.join(","),
                o.backend_address_pool.as_ref().map(|s| s.name()).unwrap_or("-")
            )?;
        }

        Ok(())
    }
}

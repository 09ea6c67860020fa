//! Provider seam for load balancer reads and writes

use super::model::LoadBalancer;
use super::request::{ProbeState, RuleState};
use crate::azure::cli::{args, az_bool, AzCli};
use crate::error::Result;

/// Load balancer addressed by resource group and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbTarget {
    /// Resource group
    pub resource_group: String,
    /// Load balancer name
    pub name: String,
}

impl LbTarget {
    /// Create a target
    pub fn new(resource_group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_group: resource_group.into(),
            name: name.into(),
        }
    }
}

/// Operations the manager needs from the cloud provider
pub trait LoadBalancerApi {
    /// Fetch the current configuration
    fn get(&self, target: &LbTarget) -> Result<LoadBalancer>;
    /// Create a load-balancing rule
    fn create_rule(&self, target: &LbTarget, rule: &RuleState) -> Result<()>;
    /// Overwrite a load-balancing rule
    fn update_rule(&self, target: &LbTarget, rule: &RuleState) -> Result<()>;
    /// Delete a load-balancing rule
    fn delete_rule(&self, target: &LbTarget, name: &str) -> Result<()>;
    /// Create a health probe
    fn create_probe(&self, target: &LbTarget, probe: &ProbeState) -> Result<()>;
    /// Overwrite a health probe
    fn update_probe(&self, target: &LbTarget, probe: &ProbeState) -> Result<()>;
    /// Delete a health probe
    fn delete_probe(&self, target: &LbTarget, name: &str) -> Result<()>;
}

/// [`LoadBalancerApi`] backed by `az network lb`
pub struct AzLoadBalancerApi {
    cli: AzCli,
}

impl AzLoadBalancerApi {
    /// Wrap a CLI runner
    pub fn new(cli: AzCli) -> Self {
        Self { cli }
    }

    fn scoped(target: &LbTarget, group: &str, verb: &str, name: &str) -> Vec<String> {
        args([
            "network",
            "lb",
            group,
            verb,
            "--resource-group",
            target.resource_group.as_str(),
            "--lb-name",
            target.name.as_str(),
            "--name",
            name,
        ])
    }

    fn rule_args(target: &LbTarget, verb: &str, rule: &RuleState) -> Vec<String> {
        let mut argv = Self::scoped(target, "rule", verb, &rule.name);
        argv.extend(args([
            "--protocol".to_string(),
            rule.protocol.to_string(),
            "--frontend-port".to_string(),
            rule.frontend_port.to_string(),
            "--backend-port".to_string(),
            rule.backend_port.to_string(),
            "--frontend-ip-name".to_string(),
            rule.frontend_ip.clone(),
            "--idle-timeout".to_string(),
            rule.idle_timeout_minutes.to_string(),
            "--floating-ip".to_string(),
            az_bool(rule.floating_ip).to_string(),
            "--disable-outbound-snat".to_string(),
            az_bool(rule.disable_outbound_snat).to_string(),
        ]));
        if let Some(ref pool) = rule.backend_pool {
            argv.extend(args(["--backend-pool-name", pool.as_str()]));
        }
        if let Some(ref probe) = rule.probe {
            argv.extend(args(["--probe-name", probe.as_str()]));
        }
        argv
    }

    fn probe_args(target: &LbTarget, verb: &str, probe: &ProbeState) -> Vec<String> {
        let mut argv = Self::scoped(target, "probe", verb, &probe.name);
        argv.extend(args([
            "--protocol".to_string(),
            probe.protocol.to_string(),
            "--port".to_string(),
            probe.port.to_string(),
            "--interval".to_string(),
            probe.interval_seconds.to_string(),
            "--number-of-probes".to_string(),
            probe.threshold.to_string(),
        ]));
        if let Some(ref path) = probe.request_path {
            argv.extend(args(["--path", path.as_str()]));
        }
        argv
    }
}

impl LoadBalancerApi for AzLoadBalancerApi {
    fn get(&self, target: &LbTarget) -> Result<LoadBalancer> {
        self.cli.run_json(&args([
            "network",
            "lb",
            "show",
            "--resource-group",
            target.resource_group.as_str(),
            "--name",
            target.name.as_str(),
        ]))
    }

    fn create_rule(&self, target: &LbTarget, rule: &RuleState) -> Result<()> {
        self.cli.run(&Self::rule_args(target, "create", rule)).map(|_| ())
    }

    fn update_rule(&self, target: &LbTarget, rule: &RuleState) -> Result<()> {
        self.cli.run(&Self::rule_args(target, "update", rule)).map(|_| ())
    }

    fn delete_rule(&self, target: &LbTarget, name: &str) -> Result<()> {
        self.cli
            .run(&Self::scoped(target, "rule", "delete", name))
            .map(|_| ())
    }

    fn create_probe(&self, target: &LbTarget, probe: &ProbeState) -> Result<()> {
        self.cli.run(&Self::probe_args(target, "create", probe)).map(|_| ())
    }

    fn update_probe(&self, target: &LbTarget, probe: &ProbeState) -> Result<()> {
        self.cli.run(&Self::probe_args(target, "update", probe)).map(|_| ())
    }

    fn delete_probe(&self, target: &LbTarget, name: &str) -> Result<()> {
        self.cli
            .run(&Self::scoped(target, "probe", "delete", name))
            .map(|_| ())
    }
}

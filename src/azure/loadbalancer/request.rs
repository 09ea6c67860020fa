//! Requested rule/probe settings and their resolution against live state

use super::model::{LoadBalancer, LoadBalancingRule, Probe, ProbeProtocol, TransportProtocol};
use crate::error::{OpsError, Result};
use crate::select::SelectionStrategy;
use serde::Serialize;
use std::fmt;

/// Allowed idle timeout range for load-balancing rules, in minutes
pub const IDLE_TIMEOUT_RANGE: std::ops::RangeInclusive<u32> = 4..=100;

const DEFAULT_IDLE_TIMEOUT: u32 = 4;
const DEFAULT_PROBE_INTERVAL: u32 = 15;
const DEFAULT_PROBE_THRESHOLD: u32 = 2;

/// Rule attributes as given by the operator; `None` means "not specified"
#[derive(Debug, Clone, Default)]
pub struct RuleSpec {
    /// Rule name
    pub name: String,
    /// Frontend IP configuration name
    pub frontend_ip: Option<String>,
    /// Backend pool name
    pub backend_pool: Option<String>,
    /// Health probe name
    pub probe: Option<String>,
    /// Transport protocol
    pub protocol: Option<TransportProtocol>,
    /// Frontend port
    pub frontend_port: Option<u16>,
    /// Backend port
    pub backend_port: Option<u16>,
    /// Idle timeout in minutes
    pub idle_timeout_minutes: Option<u32>,
    /// Floating IP
    pub floating_ip: Option<bool>,
    /// Disable outbound SNAT
    pub disable_outbound_snat: Option<bool>,
}

/// Probe attributes as given by the operator
#[derive(Debug, Clone, Default)]
pub struct ProbeSpec {
    /// Probe name
    pub name: String,
    /// Probe protocol
    pub protocol: Option<ProbeProtocol>,
    /// Probed port
    pub port: Option<u16>,
    /// Seconds between probes
    pub interval_seconds: Option<u32>,
    /// Failures before a backend is marked down
    pub threshold: Option<u32>,
    /// HTTP(S) request path
    pub request_path: Option<String>,
}

/// Fully resolved rule, either current or desired
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleState {
    pub name: String,
    pub frontend_ip: String,
    pub backend_pool: Option<String>,
    pub probe: Option<String>,
    pub protocol: TransportProtocol,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub idle_timeout_minutes: u32,
    pub floating_ip: bool,
    pub disable_outbound_snat: bool,
}

impl RuleState {
    /// View of a live rule
    pub fn from_rule(rule: &LoadBalancingRule) -> Self {
        Self {
            name: rule.name.clone(),
            frontend_ip: rule
                .frontend_ip_configuration
                .as_ref()
                .map(|s| s.name().to_string())
                .unwrap_or_default(),
            backend_pool: rule.backend_address_pool.as_ref().map(|s| s.name().to_string()),
            probe: rule.probe.as_ref().map(|s| s.name().to_string()),
            protocol: rule.protocol,
            frontend_port: rule.frontend_port,
            backend_port: rule.backend_port,
            idle_timeout_minutes: rule.idle_timeout_in_minutes,
            floating_ip: rule.enable_floating_ip,
            disable_outbound_snat: rule.disable_outbound_snat,
        }
    }
}

/// Fully resolved probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeState {
    pub name: String,
    pub protocol: ProbeProtocol,
    pub port: u16,
    pub interval_seconds: u32,
    pub threshold: u32,
    pub request_path: Option<String>,
}

impl ProbeState {
    /// View of a live probe
    pub fn from_probe(probe: &Probe) -> Self {
        Self {
            name: probe.name.clone(),
            protocol: probe.protocol,
            port: probe.port,
            interval_seconds: probe.interval_in_seconds,
            threshold: probe.number_of_probes,
            request_path: probe.request_path.clone(),
        }
    }
}

/// One differing attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    /// Attribute name
    pub field: &'static str,
    /// Current value
    pub current: String,
    /// Requested value
    pub requested: String,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.field, self.current, self.requested)
    }
}

fn show<T: fmt::Display>(value: &T) -> String {
    value.to_string()
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "(none)".to_string())
}

macro_rules! push_diff {
    ($changes:ident, $field:literal, $cur:expr, $req:expr, $fmt:expr) => {
        if $cur != $req {
            $changes.push(FieldChange {
                field: $field,
                current: $fmt(&$cur),
                requested: $fmt(&$req),
            });
        }
    };
}

/// Field-by-field differences between two rule states
pub fn diff_rule(current: &RuleState, desired: &RuleState) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    push_diff!(changes, "frontend_ip", current.frontend_ip, desired.frontend_ip, show);
    push_diff!(changes, "backend_pool", current.backend_pool, desired.backend_pool, opt);
    push_diff!(changes, "probe", current.probe, desired.probe, opt);
    push_diff!(changes, "protocol", current.protocol, desired.protocol, show);
    push_diff!(changes, "frontend_port", current.frontend_port, desired.frontend_port, show);
    push_diff!(changes, "backend_port", current.backend_port, desired.backend_port, show);
    push_diff!(changes, "idle_timeout_minutes", current.idle_timeout_minutes, desired.idle_timeout_minutes, show);
    push_diff!(changes, "floating_ip", current.floating_ip, desired.floating_ip, show);
    push_diff!(changes, "disable_outbound_snat", current.disable_outbound_snat, desired.disable_outbound_snat, show);
    changes
}

/// Field-by-field differences between two probe states
pub fn diff_probe(current: &ProbeState, desired: &ProbeState) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    push_diff!(changes, "protocol", current.protocol, desired.protocol, show);
    push_diff!(changes, "port", current.port, desired.port, show);
    push_diff!(changes, "interval_seconds", current.interval_seconds, desired.interval_seconds, show);
    push_diff!(changes, "threshold", current.threshold, desired.threshold, show);
    push_diff!(changes, "request_path", current.request_path, desired.request_path, opt);
    changes
}

impl RuleSpec {
    /// Merge the request over `existing` (or defaults for a new rule)
    pub fn resolve(
        &self,
        lb: &LoadBalancer,
        existing: Option<&RuleState>,
        selector: &dyn SelectionStrategy,
    ) -> Result<RuleState> {
        let state = match existing {
            Some(cur) => RuleState {
                name: cur.name.clone(),
                frontend_ip: self.frontend_ip.clone().unwrap_or_else(|| cur.frontend_ip.clone()),
                backend_pool: self.backend_pool.clone().or_else(|| cur.backend_pool.clone()),
                probe: self.probe.clone().or_else(|| cur.probe.clone()),
                protocol: self.protocol.unwrap_or(cur.protocol),
                frontend_port: self.frontend_port.unwrap_or(cur.frontend_port),
                backend_port: self.backend_port.unwrap_or(cur.backend_port),
                idle_timeout_minutes: self.idle_timeout_minutes.unwrap_or(cur.idle_timeout_minutes),
                floating_ip: self.floating_ip.unwrap_or(cur.floating_ip),
                disable_outbound_snat: self
                    .disable_outbound_snat
                    .unwrap_or(cur.disable_outbound_snat),
            },
            None => {
                let frontend_port = self
                    .frontend_port
                    .ok_or_else(|| OpsError::MissingParameter("--frontend-port".into()))?;
                let backend_port = self
                    .backend_port
                    .ok_or_else(|| OpsError::MissingParameter("--backend-port".into()))?;

                let frontend_ip = match &self.frontend_ip {
                    Some(name) => name.clone(),
                    None => {
                        let names = lb.frontend_names();
                        names[selector.select("frontend IP configuration", &names)?].clone()
                    }
                };
                let backend_pool = match &self.backend_pool {
                    Some(name) => Some(name.clone()),
                    None => {
                        let names = lb.pool_names();
                        Some(names[selector.select("backend pool", &names)?].clone())
                    }
                };

                RuleState {
                    name: self.name.clone(),
                    frontend_ip,
                    backend_pool,
                    probe: self.probe.clone(),
                    protocol: self.protocol.unwrap_or_default(),
                    frontend_port,
                    backend_port,
                    idle_timeout_minutes: self.idle_timeout_minutes.unwrap_or(DEFAULT_IDLE_TIMEOUT),
                    floating_ip: self.floating_ip.unwrap_or(false),
                    disable_outbound_snat: self.disable_outbound_snat.unwrap_or(false),
                }
            }
        };

        validate_rule(lb, &state)?;
        Ok(state)
    }
}

fn validate_rule(lb: &LoadBalancer, rule: &RuleState) -> Result<()> {
    if lb.frontend(&rule.frontend_ip).is_none() {
        return Err(OpsError::InvalidArgument(format!(
            "frontend '{}' does not exist on '{}' (available: {})",
            rule.frontend_ip,
            lb.name,
            lb.frontend_names().join(", ")
        )));
    }
    if let Some(ref pool) = rule.backend_pool {
        if !lb.has_pool(pool) {
            return Err(OpsError::InvalidArgument(format!(
                "backend pool '{}' does not exist on '{}'",
                pool, lb.name
            )));
        }
    }
    if let Some(ref probe) = rule.probe {
        if lb.probe(probe).is_none() {
            return Err(OpsError::ProbeNotFound(probe.clone()));
        }
    }
    if !IDLE_TIMEOUT_RANGE.contains(&rule.idle_timeout_minutes) {
        return Err(OpsError::InvalidArgument(format!(
            "idle timeout must be between {} and {} minutes",
            IDLE_TIMEOUT_RANGE.start(),
            IDLE_TIMEOUT_RANGE.end()
        )));
    }
    let zero_ports = rule.frontend_port == 0 || rule.backend_port == 0;
    if zero_ports && rule.protocol != TransportProtocol::All {
        return Err(OpsError::InvalidArgument(
            "port 0 is only valid for HA-ports rules (protocol all)".into(),
        ));
    }
    Ok(())
}

impl ProbeSpec {
    /// Merge the request over `existing` (or defaults for a new probe)
    pub fn resolve(&self, existing: Option<&ProbeState>) -> Result<ProbeState> {
        let (protocol, port, interval, threshold, prev_path) = match existing {
            Some(cur) => (
                self.protocol.unwrap_or(cur.protocol),
                self.port.unwrap_or(cur.port),
                self.interval_seconds.unwrap_or(cur.interval_seconds),
                self.threshold.unwrap_or(cur.threshold),
                cur.request_path.clone(),
            ),
            None => (
                self.protocol.unwrap_or_default(),
                self.port
                    .ok_or_else(|| OpsError::MissingParameter("--port".into()))?,
                self.interval_seconds.unwrap_or(DEFAULT_PROBE_INTERVAL),
                self.threshold.unwrap_or(DEFAULT_PROBE_THRESHOLD),
                None,
            ),
        };

        let request_path = if protocol.uses_path() {
            let path = self
                .request_path
                .clone()
                .or(prev_path)
                .ok_or_else(|| OpsError::MissingParameter("--path (required for HTTP/HTTPS probes)".into()))?;
            if !path.starts_with('/') {
                return Err(OpsError::InvalidArgument(format!(
                    "probe path '{}' must start with '/'",
                    path
                )));
            }
            Some(path)
        } else {
            if self.request_path.is_some() {
                tracing::warn!("Ignoring --path for TCP probe '{}'", self.name);
            }
            None
        };

        if port == 0 {
            return Err(OpsError::InvalidArgument("probe port must be 1-65535".into()));
        }
        if interval < 5 {
            return Err(OpsError::InvalidArgument("probe interval must be at least 5 seconds".into()));
        }
        if threshold == 0 {
            return Err(OpsError::InvalidArgument("probe threshold must be at least 1".into()));
        }

        Ok(ProbeState {
            name: existing.map(|c| c.name.clone()).unwrap_or_else(|| self.name.clone()),
            protocol,
            port,
            interval_seconds: interval,
            threshold,
            request_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::model::{BackendPool, FrontendIpConfiguration};
    use super::*;
    use crate::select::{FirstCandidate, RequireUnique};

    fn lb() -> LoadBalancer {
        LoadBalancer {
            name: "lb".into(),
            id: "/lb".into(),
            location: None,
            frontend_ip_configurations: vec![FrontendIpConfiguration {
                name: "fe".into(),
                id: "/lb/frontendIPConfigurations/fe".into(),
                private_ip_address: Some("10.0.0.4".into()),
                public_ip_address: None,
                outbound_rules: None,
            }],
            backend_address_pools: vec![
                BackendPool { name: "pool-a".into(), id: "/lb/backendAddressPools/pool-a".into() },
                BackendPool { name: "pool-b".into(), id: "/lb/backendAddressPools/pool-b".into() },
            ],
            probes: vec![],
            load_balancing_rules: vec![],
            outbound_rules: vec![],
        }
    }

    fn https_state() -> RuleState {
        RuleState {
            name: "https".into(),
            frontend_ip: "fe".into(),
            backend_pool: Some("pool-a".into()),
            probe: None,
            protocol: TransportProtocol::Tcp,
            frontend_port: 443,
            backend_port: 443,
            idle_timeout_minutes: 4,
            floating_ip: false,
            disable_outbound_snat: false,
        }
    }

    #[test]
    fn test_new_rule_requires_ports() {
        let spec = RuleSpec { name: "r".into(), ..Default::default() };
        let err = spec.resolve(&lb(), None, &FirstCandidate).unwrap_err();
        assert!(matches!(err, OpsError::MissingParameter(_)));
    }

    #[test]
    fn test_new_rule_selects_pool_through_strategy() {
        let spec = RuleSpec {
            name: "r".into(),
            frontend_port: Some(80),
            backend_port: Some(8080),
            ..Default::default()
        };
        // two pools, so RequireUnique refuses to guess
        assert!(spec.resolve(&lb(), None, &RequireUnique).is_err());

        let state = spec.resolve(&lb(), None, &FirstCandidate).unwrap();
        assert_eq!(state.frontend_ip, "fe");
        assert_eq!(state.backend_pool.as_deref(), Some("pool-a"));
        assert_eq!(state.idle_timeout_minutes, 4);
        assert_eq!(state.protocol, TransportProtocol::Tcp);
    }

    #[test]
    fn test_update_preserves_unspecified_fields() {
        let spec = RuleSpec {
            name: "https".into(),
            idle_timeout_minutes: Some(25),
            ..Default::default()
        };
        let resolved = spec.resolve(&lb(), Some(&https_state()), &RequireUnique).unwrap();
        assert_eq!(resolved.frontend_port, 443);
        assert_eq!(resolved.backend_port, 443);
        assert_eq!(resolved.idle_timeout_minutes, 25);

        let changes = diff_rule(&https_state(), &resolved);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "idle_timeout_minutes");
        assert_eq!(changes[0].to_string(), "idle_timeout_minutes: 4 -> 25");
    }

    #[test]
    fn test_validation() {
        let mut spec = RuleSpec {
            name: "r".into(),
            frontend_port: Some(80),
            backend_port: Some(80),
            backend_pool: Some("pool-a".into()),
            idle_timeout_minutes: Some(2),
            ..Default::default()
        };
        assert!(spec.resolve(&lb(), None, &RequireUnique).is_err());

        spec.idle_timeout_minutes = None;
        spec.frontend_ip = Some("missing".into());
        assert!(spec.resolve(&lb(), None, &RequireUnique).is_err());

        spec.frontend_ip = None;
        spec.frontend_port = Some(0);
        assert!(spec.resolve(&lb(), None, &RequireUnique).is_err());
        spec.protocol = Some(TransportProtocol::All);
        spec.backend_port = Some(0);
        assert!(spec.resolve(&lb(), None, &RequireUnique).is_ok());
    }

    #[test]
    fn test_probe_resolution() {
        let spec = ProbeSpec {
            name: "hp".into(),
            protocol: Some(ProbeProtocol::Http),
            port: Some(80),
            ..Default::default()
        };
        assert!(matches!(spec.resolve(None), Err(OpsError::MissingParameter(_))));

        let spec = ProbeSpec { request_path: Some("/healthz".into()), ..spec };
        let created = spec.resolve(None).unwrap();
        assert_eq!(created.interval_seconds, 15);
        assert_eq!(created.threshold, 2);

        // switching to TCP drops the path
        let to_tcp = ProbeSpec {
            name: "hp".into(),
            protocol: Some(ProbeProtocol::Tcp),
            ..Default::default()
        };
        let updated = to_tcp.resolve(Some(&created)).unwrap();
        assert_eq!(updated.request_path, None);
        assert_eq!(updated.port, 80);
        let fields: Vec<&str> = diff_probe(&created, &updated).iter().map(|c| c.field).collect();
        assert_eq!(fields, vec!["protocol", "request_path"]);
    }
}

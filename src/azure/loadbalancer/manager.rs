//! Idempotent rule and probe management
//!
//! Every action starts from a fresh read of the load balancer. Adds compare
//! the request with what is already there and only write when something
//! actually changes; dry runs stop right before the write.

use super::api::{LbTarget, LoadBalancerApi};
use super::model::{DiagnosticDump, LoadBalancer};
use super::request::{diff_probe, diff_rule, FieldChange, ProbeSpec, ProbeState, RuleSpec, RuleState};
use crate::error::{OpsError, Result};
use crate::output::Tabular;
use crate::select::{Confirmer, SelectionStrategy};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

/// What the operator asked for
#[derive(Debug, Clone)]
pub enum LbAction {
    /// Create a rule, or no-op when an identical one exists
    Add(RuleSpec),
    /// Change an existing rule
    Update(RuleSpec),
    /// Delete a rule
    Remove(String),
    /// Show all rules
    List,
    /// Create a probe, or no-op when an identical one exists
    AddProbe(ProbeSpec),
    /// Change an existing probe
    UpdateProbe(ProbeSpec),
    /// Delete a probe
    RemoveProbe(String),
    /// Show all probes
    ListProbes,
}

/// Kind of child resource an outcome refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Load-balancing rule
    Rule,
    /// Health probe
    Probe,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rule => "rule",
            Self::Probe => "probe",
        })
    }
}

/// Result of an action; `applied` is false for dry runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LbOutcome {
    /// Nothing to do
    NoOp { kind: ResourceKind, name: String },
    /// A new rule or probe
    Created { kind: ResourceKind, name: String, applied: bool },
    /// Changed attributes
    Updated {
        kind: ResourceKind,
        name: String,
        changes: Vec<FieldChange>,
        applied: bool,
    },
    /// Deleted
    Removed { kind: ResourceKind, name: String, applied: bool },
    /// Current rules
    Rules { rules: Vec<RuleState> },
    /// Current probes
    Probes { probes: Vec<ProbeState> },
}

impl LbOutcome {
    /// True when nothing was or would be written
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp { .. })
    }
}

impl fmt::Display for LbOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = |applied: bool| if applied { "" } else { "What if: " };
        match self {
            Self::NoOp { kind, name } => write!(f, "No changes: {} '{}' already matches", kind, name),
            Self::Created { kind, name, applied } => {
                write!(f, "{}Create {} '{}'", prefix(*applied), kind, name)
            }
            Self::Updated { kind, name, changes, applied } => {
                write!(f, "{}Update {} '{}'", prefix(*applied), kind, name)?;
                for change in changes {
                    write!(f, "\n  {}", change)?;
                }
                Ok(())
            }
            Self::Removed { kind, name, applied } => {
                write!(f, "{}Remove {} '{}'", prefix(*applied), kind, name)
            }
            Self::Rules { rules } => write!(f, "{} rule(s)", rules.len()),
            Self::Probes { probes } => write!(f, "{} probe(s)", probes.len()),
        }
    }
}

/// Rule listing for output
pub struct RuleTable<'a>(pub &'a [RuleState]);

impl Tabular for RuleTable<'_> {
    fn columns(&self) -> Vec<String> {
        [
            "name",
            "frontend_ip",
            "backend_pool",
            "probe",
            "protocol",
            "frontend_port",
            "backend_port",
            "idle_timeout",
            "floating_ip",
            "disable_outbound_snat",
        ]
        .iter()
        .map(|c| c.to_string())
        .collect()
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.0
            .iter()
            .map(|r| {
                vec![
                    json!(r.name),
                    json!(r.frontend_ip),
                    json!(r.backend_pool),
                    json!(r.probe),
                    json!(r.protocol),
                    json!(r.frontend_port),
                    json!(r.backend_port),
                    json!(r.idle_timeout_minutes),
                    json!(r.floating_ip),
                    json!(r.disable_outbound_snat),
                ]
            })
            .collect()
    }
}

/// Probe listing for output
pub struct ProbeTable<'a>(pub &'a [ProbeState]);

impl Tabular for ProbeTable<'_> {
    fn columns(&self) -> Vec<String> {
        ["name", "protocol", "port", "interval", "threshold", "path"]
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.0
            .iter()
            .map(|p| {
                vec![
                    json!(p.name),
                    json!(p.protocol),
                    json!(p.port),
                    json!(p.interval_seconds),
                    json!(p.threshold),
                    json!(p.request_path),
                ]
            })
            .collect()
    }
}

/// Behaviour switches
#[derive(Debug, Clone, Copy)]
pub struct LbOptions {
    /// Compute and report, never write
    pub dry_run: bool,
    /// Let Add overwrite a differing rule; skip removal prompts
    pub force: bool,
    /// Turn on "disable outbound SNAT" when an outbound rule shares the frontend
    pub auto_fix_snat: bool,
}

impl Default for LbOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            auto_fix_snat: true,
        }
    }
}

/// Applies [`LbAction`]s to one load balancer
pub struct LbManager<'a> {
    api: &'a dyn LoadBalancerApi,
    selector: &'a dyn SelectionStrategy,
    confirmer: &'a dyn Confirmer,
    options: LbOptions,
}

impl<'a> LbManager<'a> {
    /// Create a manager
    pub fn new(
        api: &'a dyn LoadBalancerApi,
        selector: &'a dyn SelectionStrategy,
        confirmer: &'a dyn Confirmer,
        options: LbOptions,
    ) -> Self {
        Self {
            api,
            selector,
            confirmer,
            options,
        }
    }

    /// Run one action; on failure the load balancer state is dumped to the log
    pub fn execute(&self, target: &LbTarget, action: LbAction) -> Result<LbOutcome> {
        let lb = self.api.get(target).map_err(|e| {
            e.with_context(format!(
                "reading load balancer '{}' in '{}'",
                target.name, target.resource_group
            ))
        })?;

        let result = match action {
            LbAction::Add(spec) => self.add_rule(target, &lb, &spec),
            LbAction::Update(spec) => self.update_rule(target, &lb, &spec),
            LbAction::Remove(name) => self.remove_rule(target, &lb, &name),
            LbAction::List => Ok(LbOutcome::Rules {
                rules: lb.load_balancing_rules.iter().map(RuleState::from_rule).collect(),
            }),
            LbAction::AddProbe(spec) => self.add_probe(target, &lb, &spec),
            LbAction::UpdateProbe(spec) => self.update_probe(target, &lb, &spec),
            LbAction::RemoveProbe(name) => self.remove_probe(target, &lb, &name),
            LbAction::ListProbes => Ok(LbOutcome::Probes {
                probes: lb.probes.iter().map(ProbeState::from_probe).collect(),
            }),
        };

        if let Err(ref e) = result {
            tracing::error!("{}", e);
            tracing::error!("Current configuration:\n{}", DiagnosticDump(&lb));
        }
        result
    }

    fn add_rule(&self, target: &LbTarget, lb: &LoadBalancer, spec: &RuleSpec) -> Result<LbOutcome> {
        let Some(existing) = lb.rule(&spec.name).map(RuleState::from_rule) else {
            let mut desired = spec.resolve(lb, None, self.selector)?;
            self.apply_snat_policy(lb, &mut desired, spec.disable_outbound_snat)?;

            if !self.options.dry_run {
                self.api.create_rule(target, &desired)?;
                tracing::info!("Created rule '{}' on '{}'", desired.name, lb.name);
            }
            return Ok(LbOutcome::Created {
                kind: ResourceKind::Rule,
                name: desired.name,
                applied: !self.options.dry_run,
            });
        };

        // an identical request never writes, whatever the SNAT policy says
        let desired = spec.resolve(lb, Some(&existing), self.selector)?;
        let changes = diff_rule(&existing, &desired);

        if changes.is_empty() {
            tracing::info!("Rule '{}' already matches, nothing to do", existing.name);
            return Ok(LbOutcome::NoOp {
                kind: ResourceKind::Rule,
                name: existing.name,
            });
        }
        if !self.options.force {
            return Err(OpsError::RuleConflict {
                name: existing.name,
                fields: changes.iter().map(ToString::to_string).collect(),
            });
        }

        tracing::warn!("Rule '{}' differs, updating because --force was given", existing.name);
        self.update_rule(target, lb, spec)
    }

    fn update_rule(&self, target: &LbTarget, lb: &LoadBalancer, spec: &RuleSpec) -> Result<LbOutcome> {
        let existing = lb
            .rule(&spec.name)
            .map(RuleState::from_rule)
            .ok_or_else(|| OpsError::RuleNotFound(spec.name.clone()))?;

        let mut desired = spec.resolve(lb, Some(&existing), self.selector)?;
        if diff_rule(&existing, &desired).is_empty() {
            return Ok(LbOutcome::NoOp {
                kind: ResourceKind::Rule,
                name: existing.name,
            });
        }
        self.apply_snat_policy(lb, &mut desired, spec.disable_outbound_snat)?;
        let changes = diff_rule(&existing, &desired);

        if !self.options.dry_run {
            self.api.update_rule(target, &desired)?;
            tracing::info!("Updated rule '{}' ({} change(s))", desired.name, changes.len());
        }
        Ok(LbOutcome::Updated {
            kind: ResourceKind::Rule,
            name: desired.name,
            changes,
            applied: !self.options.dry_run,
        })
    }

    fn remove_rule(&self, target: &LbTarget, lb: &LoadBalancer, name: &str) -> Result<LbOutcome> {
        let Some(rule) = lb.rule(name) else {
            tracing::warn!("Rule '{}' does not exist on '{}'", name, lb.name);
            return Ok(LbOutcome::NoOp {
                kind: ResourceKind::Rule,
                name: name.to_string(),
            });
        };

        if !self.options.dry_run {
            if !self.options.force {
                self.confirmer
                    .require(&format!("Remove rule '{}' from '{}'?", rule.name, lb.name))?;
            }
            self.api.delete_rule(target, &rule.name)?;
            tracing::info!("Removed rule '{}'", rule.name);
        }
        Ok(LbOutcome::Removed {
            kind: ResourceKind::Rule,
            name: rule.name.clone(),
            applied: !self.options.dry_run,
        })
    }

    fn add_probe(&self, target: &LbTarget, lb: &LoadBalancer, spec: &ProbeSpec) -> Result<LbOutcome> {
        let Some(existing) = lb.probe(&spec.name).map(ProbeState::from_probe) else {
            let desired = spec.resolve(None)?;
            if !self.options.dry_run {
                self.api.create_probe(target, &desired)?;
                tracing::info!("Created probe '{}' on '{}'", desired.name, lb.name);
            }
            return Ok(LbOutcome::Created {
                kind: ResourceKind::Probe,
                name: desired.name,
                applied: !self.options.dry_run,
            });
        };

        let desired = spec.resolve(Some(&existing))?;
        let changes = diff_probe(&existing, &desired);
        if changes.is_empty() {
            return Ok(LbOutcome::NoOp {
                kind: ResourceKind::Probe,
                name: existing.name,
            });
        }
        if !self.options.force {
            return Err(OpsError::RuleConflict {
                name: existing.name,
                fields: changes.iter().map(ToString::to_string).collect(),
            });
        }

        tracing::warn!("Probe '{}' differs, updating because --force was given", existing.name);
        self.update_probe(target, lb, spec)
    }

    fn update_probe(&self, target: &LbTarget, lb: &LoadBalancer, spec: &ProbeSpec) -> Result<LbOutcome> {
        let existing = lb
            .probe(&spec.name)
            .map(ProbeState::from_probe)
            .ok_or_else(|| OpsError::ProbeNotFound(spec.name.clone()))?;

        let desired = spec.resolve(Some(&existing))?;
        let changes = diff_probe(&existing, &desired);
        if changes.is_empty() {
            return Ok(LbOutcome::NoOp {
                kind: ResourceKind::Probe,
                name: existing.name,
            });
        }

        if !self.options.dry_run {
            self.api.update_probe(target, &desired)?;
            tracing::info!("Updated probe '{}' ({} change(s))", desired.name, changes.len());
        }
        Ok(LbOutcome::Updated {
            kind: ResourceKind::Probe,
            name: desired.name,
            changes,
            applied: !self.options.dry_run,
        })
    }

    fn remove_probe(&self, target: &LbTarget, lb: &LoadBalancer, name: &str) -> Result<LbOutcome> {
        let Some(probe) = lb.probe(name) else {
            tracing::warn!("Probe '{}' does not exist on '{}'", name, lb.name);
            return Ok(LbOutcome::NoOp {
                kind: ResourceKind::Probe,
                name: name.to_string(),
            });
        };

        let users = lb.rules_using_probe(&probe.name);
        if !users.is_empty() {
            return Err(OpsError::ProbeInUse {
                probe: probe.name.clone(),
                rules: users,
            });
        }

        if !self.options.dry_run {
            if !self.options.force {
                self.confirmer
                    .require(&format!("Remove probe '{}' from '{}'?", probe.name, lb.name))?;
            }
            self.api.delete_probe(target, &probe.name)?;
            tracing::info!("Removed probe '{}'", probe.name);
        }
        Ok(LbOutcome::Removed {
            kind: ResourceKind::Probe,
            name: probe.name.clone(),
            applied: !self.options.dry_run,
        })
    }

    /// A frontend shared with an outbound rule needs SNAT disabled on inbound rules
    fn apply_snat_policy(
        &self,
        lb: &LoadBalancer,
        desired: &mut RuleState,
        explicit: Option<bool>,
    ) -> Result<()> {
        if desired.disable_outbound_snat {
            return Ok(());
        }
        let Some(outbound_rule) = lb.outbound_rule_using(&desired.frontend_ip) else {
            return Ok(());
        };

        if explicit.is_none() && self.options.auto_fix_snat {
            tracing::warn!(
                "Frontend '{}' is used by outbound rule '{}', setting disable_outbound_snat on '{}'",
                desired.frontend_ip,
                outbound_rule,
                desired.name
            );
            desired.disable_outbound_snat = true;
            return Ok(());
        }

        Err(OpsError::OutboundSnatConflict {
            frontend: desired.frontend_ip.clone(),
            outbound_rule,
        })
    }
}

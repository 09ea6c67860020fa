//! Load balancer rule and probe management
//!
//! - [`model`]: the payload returned by `az network lb show`
//! - [`request`]: operator requests, resolution and field diffs
//! - [`api`]: provider seam plus the `az`-backed implementation
//! - [`manager`]: idempotent add/update/remove with dry-run support

pub mod api;
pub mod manager;
pub mod model;
pub mod request;

pub use api::{AzLoadBalancerApi, LbTarget, LoadBalancerApi};
pub use manager::{LbAction, LbManager, LbOptions, LbOutcome, ProbeTable, ResourceKind, RuleTable};
pub use model::{DiagnosticDump, LoadBalancer, ProbeProtocol, TransportProtocol};
pub use request::{FieldChange, ProbeSpec, ProbeState, RuleSpec, RuleState};

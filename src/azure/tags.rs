//! Resource tag management
//!
//! Tags are validated once, when they enter the program, and then travel as a
//! [`TagSet`]. Changes are planned against the live tags before anything is
//! written, so dry runs and confirmations can show exactly what will happen.

use crate::azure::cli::{args, AzCli};
use crate::error::{OpsError, Result};
use crate::output::Tabular;
use crate::select::Confirmer;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Maximum number of tags on one resource
pub const MAX_TAGS: usize = 50;
/// Maximum tag key length
pub const MAX_KEY_LEN: usize = 512;
/// Maximum tag value length
pub const MAX_VALUE_LEN: usize = 256;
/// Characters Azure rejects in tag keys
pub const FORBIDDEN_KEY_CHARS: [char; 7] = ['<', '>', '%', '&', '\\', '?', '/'];

/// Validated tag mapping, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert one tag
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate_tag(&key, &value)?;
        if !self.0.contains_key(&key) && self.0.len() >= MAX_TAGS {
            return Err(OpsError::InvalidTag {
                key,
                reason: format!("a resource can carry at most {} tags", MAX_TAGS),
            });
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Parse `key=value` pairs from the command line
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for pair in pairs {
            let (key, value) = parse_tag(pair.as_ref())?;
            set.insert(key, value)?;
        }
        Ok(set)
    }

    /// Validate an existing mapping
    pub fn from_map(map: BTreeMap<String, String>) -> Result<Self> {
        let mut set = Self::new();
        for (key, value) in map {
            set.insert(key, value)?;
        }
        Ok(set)
    }

    /// Value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate tags in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// `key=value` arguments as `az tag update --tags` expects them
    pub fn to_args(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

impl Tabular for TagSet {
    fn columns(&self) -> Vec<String> {
        vec!["key".into(), "value".into()]
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.0.iter().map(|(k, v)| vec![json!(k), json!(v)]).collect()
    }
}

/// Check one key/value pair against the resource tag rules
pub fn validate_tag(key: &str, value: &str) -> Result<()> {
    let invalid = |reason: String| OpsError::InvalidTag {
        key: key.to_string(),
        reason,
    };

    let key_len = key.chars().count();
    if key_len == 0 || key_len > MAX_KEY_LEN {
        return Err(invalid(format!("key must be 1-{} characters", MAX_KEY_LEN)));
    }
    if let Some(c) = key.chars().find(|c| FORBIDDEN_KEY_CHARS.contains(c)) {
        return Err(invalid(format!("key may not contain '{}'", c)));
    }
    if value.chars().count() > MAX_VALUE_LEN {
        return Err(invalid(format!("value exceeds {} characters", MAX_VALUE_LEN)));
    }
    Ok(())
}

/// Split `key=value`; a bare `key` yields an empty value
pub fn parse_tag(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) => Ok((key.trim().to_string(), value.trim().to_string())),
        None => Ok((pair.trim().to_string(), String::new())),
    }
}

/// How requested tags combine with the current ones
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagMode {
    /// Add or overwrite the given tags, keep the rest
    Merge,
    /// Make the resource carry exactly the given tags
    Replace,
    /// Remove the given keys
    Delete,
}

impl TagMode {
    /// Operation name `az tag update` expects
    pub fn az_operation(&self) -> &'static str {
        match self {
            Self::Merge => "Merge",
            Self::Replace => "Replace",
            Self::Delete => "Delete",
        }
    }
}

/// Planned change of one tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "lowercase")]
pub enum TagChange {
    /// New key
    Add { key: String, value: String },
    /// Existing key, new value
    Update { key: String, from: String, to: String },
    /// Key goes away
    Remove { key: String, value: String },
}

/// Difference between the live tags and the requested outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagPlan {
    /// Changes in key order
    pub changes: Vec<TagChange>,
}

impl TagPlan {
    /// Plan `mode` with `requested` over `current`
    pub fn compute(current: &BTreeMap<String, String>, requested: &TagSet, mode: TagMode) -> Result<Self> {
        let mut changes = Vec::new();

        match mode {
            TagMode::Merge | TagMode::Replace => {
                for (key, value) in requested.iter() {
                    match current.get(key) {
                        None => changes.push(TagChange::Add {
                            key: key.clone(),
                            value: value.clone(),
                        }),
                        Some(old) if old != value => changes.push(TagChange::Update {
                            key: key.clone(),
                            from: old.clone(),
                            to: value.clone(),
                        }),
                        Some(_) => {}
                    }
                }
                if mode == TagMode::Replace {
                    for (key, value) in current {
                        if requested.get(key).is_none() {
                            changes.push(TagChange::Remove {
                                key: key.clone(),
                                value: value.clone(),
                            });
                        }
                    }
                }
            }
            TagMode::Delete => {
                for (key, value) in requested.iter() {
                    let Some(old) = current.get(key) else { continue };
                    if !value.is_empty() && value != old {
                        tracing::warn!("Keeping tag '{}': current value '{}' does not match '{}'", key, old, value);
                        continue;
                    }
                    changes.push(TagChange::Remove {
                        key: key.clone(),
                        value: old.clone(),
                    });
                }
            }
        }

        let plan = Self { changes };
        let resulting = plan.apply_to(current).len();
        if resulting > MAX_TAGS {
            return Err(OpsError::InvalidTag {
                key: "*".into(),
                reason: format!("result would carry {} tags, the limit is {}", resulting, MAX_TAGS),
            });
        }
        Ok(plan)
    }

    /// Nothing would change
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Any tag would be removed or overwritten
    pub fn is_destructive(&self) -> bool {
        self.changes
            .iter()
            .any(|c| !matches!(c, TagChange::Add { .. }))
    }

    /// Tags after the plan is applied
    pub fn apply_to(&self, current: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut next = current.clone();
        for change in &self.changes {
            match change {
                TagChange::Add { key, value } => {
                    next.insert(key.clone(), value.clone());
                }
                TagChange::Update { key, to, .. } => {
                    next.insert(key.clone(), to.clone());
                }
                TagChange::Remove { key, .. } => {
                    next.remove(key);
                }
            }
        }
        next
    }
}

impl Tabular for TagPlan {
    fn columns(&self) -> Vec<String> {
        vec!["change".into(), "key".into(), "from".into(), "to".into()]
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.changes
            .iter()
            .map(|c| match c {
                TagChange::Add { key, value } => vec![json!("add"), json!(key), Value::Null, json!(value)],
                TagChange::Update { key, from, to } => vec![json!("update"), json!(key), json!(from), json!(to)],
                TagChange::Remove { key, value } => vec![json!("remove"), json!(key), json!(value), Value::Null],
            })
            .collect()
    }
}

/// What carries the tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagScope {
    /// A resource group by name
    ResourceGroup(String),
    /// Any resource by ARM id
    Resource(String),
}

/// Reads and writes tags
pub trait TagsApi {
    /// ARM id and current tags of the scope
    fn current(&self, scope: &TagScope) -> Result<(String, BTreeMap<String, String>)>;
    /// Apply `tags` with `mode` to a resource id
    fn update(&self, resource_id: &str, mode: TagMode, tags: &TagSet) -> Result<()>;
}

#[derive(Deserialize)]
struct GroupShow {
    id: String,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
struct TagResource {
    #[serde(default)]
    properties: TagProperties,
}

#[derive(Deserialize, Default)]
struct TagProperties {
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
}

/// [`TagsApi`] backed by `az group show` and `az tag`
pub struct AzTagsApi {
    cli: AzCli,
}

impl AzTagsApi {
    /// Wrap a CLI runner
    pub fn new(cli: AzCli) -> Self {
        Self { cli }
    }
}

impl TagsApi for AzTagsApi {
    fn current(&self, scope: &TagScope) -> Result<(String, BTreeMap<String, String>)> {
        match scope {
            TagScope::ResourceGroup(name) => {
                let group: GroupShow = self.cli.run_json(&args(["group", "show", "--name", name.as_str()]))?;
                Ok((group.id, group.tags.unwrap_or_default()))
            }
            TagScope::Resource(id) => {
                let res: TagResource = self.cli.run_json(&args(["tag", "list", "--resource-id", id.as_str()]))?;
                Ok((id.clone(), res.properties.tags.unwrap_or_default()))
            }
        }
    }

    fn update(&self, resource_id: &str, mode: TagMode, tags: &TagSet) -> Result<()> {
        let mut argv = args([
            "tag",
            "update",
            "--resource-id",
            resource_id,
            "--operation",
            mode.az_operation(),
            "--tags",
        ]);
        argv.extend(tags.to_args());
        self.cli.run(&argv).map(|_| ())
    }
}

/// Plan, confirm and apply a tag change; returns the plan that was (or would be) applied
pub fn apply_tags(
    api: &dyn TagsApi,
    confirmer: &dyn Confirmer,
    scope: &TagScope,
    requested: &TagSet,
    mode: TagMode,
    dry_run: bool,
) -> Result<TagPlan> {
    let (resource_id, current) = api.current(scope)?;
    let plan = TagPlan::compute(&current, requested, mode)?;

    if plan.is_empty() {
        tracing::info!("Tags on '{}' already match", resource_id);
        return Ok(plan);
    }
    if dry_run {
        tracing::info!("What if: {} tag change(s) on '{}'", plan.changes.len(), resource_id);
        return Ok(plan);
    }
    if plan.is_destructive() {
        confirmer.require(&format!(
            "Apply {} tag change(s) to '{}', overwriting or removing existing tags?",
            plan.changes.len(),
            resource_id
        ))?;
    }

    api.update(&resource_id, mode, requested)?;
    tracing::info!("Applied {} tag change(s) to '{}'", plan.changes.len(), resource_id);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::{AssumeNo, AssumeYes};
    use proptest::prelude::*;
    use std::cell::{Cell, RefCell};

    fn current() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("env".to_string(), "prod".to_string()),
            ("owner".to_string(), "team-a".to_string()),
        ])
    }

    #[test]
    fn test_validation_rules() {
        assert!(validate_tag("cost-center", "42").is_ok());
        assert!(validate_tag("", "x").is_err());
        assert!(validate_tag("a/b", "x").is_err());
        assert!(validate_tag("a%b", "x").is_err());
        assert!(validate_tag(&"k".repeat(513), "x").is_err());
        assert!(validate_tag("k", &"v".repeat(257)).is_err());
        assert!(validate_tag("k", &"v".repeat(256)).is_ok());
    }

    #[test]
    fn test_tag_limit() {
        let mut set = TagSet::new();
        for i in 0..MAX_TAGS {
            set.insert(format!("k{}", i), "v").unwrap();
        }
        assert!(set.insert("one-more", "v").is_err());
        // overwriting an existing key is not an addition
        assert!(set.insert("k0", "w").is_ok());
    }

    #[test]
    fn test_parse_pairs() {
        let set = TagSet::from_pairs(["env = dev", "team=a=b", "flag"]).unwrap();
        assert_eq!(set.get("env"), Some("dev"));
        assert_eq!(set.get("team"), Some("a=b"));
        assert_eq!(set.get("flag"), Some(""));
    }

    #[test]
    fn test_merge_plan() {
        let requested = TagSet::from_pairs(["env=dev", "app=web", "owner=team-a"]).unwrap();
        let plan = TagPlan::compute(&current(), &requested, TagMode::Merge).unwrap();
        assert_eq!(
            plan.changes,
            vec![
                TagChange::Add { key: "app".into(), value: "web".into() },
                TagChange::Update { key: "env".into(), from: "prod".into(), to: "dev".into() },
            ]
        );
        assert!(plan.is_destructive());
    }

    #[test]
    fn test_replace_and_delete_plans() {
        let requested = TagSet::from_pairs(["env=prod"]).unwrap();
        let plan = TagPlan::compute(&current(), &requested, TagMode::Replace).unwrap();
        assert_eq!(plan.changes, vec![TagChange::Remove { key: "owner".into(), value: "team-a".into() }]);

        let requested = TagSet::from_pairs(["owner", "env=staging", "missing"]).unwrap();
        let plan = TagPlan::compute(&current(), &requested, TagMode::Delete).unwrap();
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.apply_to(&current()).len(), 1);
    }

    struct FakeTags {
        tags: RefCell<BTreeMap<String, String>>,
        updates: Cell<usize>,
    }

    impl TagsApi for FakeTags {
        fn current(&self, _scope: &TagScope) -> Result<(String, BTreeMap<String, String>)> {
            Ok(("/subscriptions/s/resourceGroups/rg".into(), self.tags.borrow().clone()))
        }

        fn update(&self, _id: &str, mode: TagMode, tags: &TagSet) -> Result<()> {
            self.updates.set(self.updates.get() + 1);
            let next = TagPlan::compute(&self.tags.borrow(), tags, mode)?.apply_to(&self.tags.borrow());
            *self.tags.borrow_mut() = next;
            Ok(())
        }
    }

    #[test]
    fn test_apply_respects_dry_run_and_confirmation() {
        let api = FakeTags {
            tags: RefCell::new(current()),
            updates: Cell::new(0),
        };
        let scope = TagScope::ResourceGroup("rg".into());
        let requested = TagSet::from_pairs(["env=dev"]).unwrap();

        apply_tags(&api, &AssumeYes, &scope, &requested, TagMode::Merge, true).unwrap();
        assert_eq!(api.updates.get(), 0);

        let err = apply_tags(&api, &AssumeNo, &scope, &requested, TagMode::Merge, false).unwrap_err();
        assert!(matches!(err, OpsError::ConfirmationDeclined(_)));
        assert_eq!(api.updates.get(), 0);

        // pure additions need no confirmation
        let additive = TagSet::from_pairs(["app=web"]).unwrap();
        apply_tags(&api, &AssumeNo, &scope, &additive, TagMode::Merge, false).unwrap();
        assert_eq!(api.tags.borrow().get("app").map(String::as_str), Some("web"));

        let plan = apply_tags(&api, &AssumeYes, &scope, &additive, TagMode::Merge, false).unwrap();
        assert!(plan.is_empty());
        assert_eq!(api.updates.get(), 1);
    }

    proptest! {
        #[test]
        fn prop_replace_yields_requested(keys in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..10)) {
            let requested = TagSet::from_map(keys.clone()).unwrap();
            let plan = TagPlan::compute(&current(), &requested, TagMode::Replace).unwrap();
            prop_assert_eq!(plan.apply_to(&current()), keys);
        }
    }
}

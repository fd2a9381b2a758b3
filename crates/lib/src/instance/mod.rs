//! Instance resolution
//!
//! Produces the set of hosts a run provisions. Hosts are discovered through
//! an [`InstanceSource`] and filtered to those that are running, have an
//! address, carry the marker tag and sit inside the selected scope.
//!
//! When the marker query returns nothing the resolver can fall back to every
//! running instance in scope. The fallback is logged at WARN and reported in
//! [`Resolution::fallback_used`] so it is never silent.

pub mod errors;
pub mod inventory;
pub mod terraform;

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use errors::ResolutionError;
pub use inventory::StaticInventory;
pub use terraform::TerraformOutputs;

/// Default marker tag selecting hosts for provisioning.
pub const DEFAULT_MARKER: &str = "ssh-provisioning=enabled";

/// Lifecycle state reported by the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute host that may receive user accounts and keys.
///
/// Entries without a `state` are treated as running: inventories usually
/// list only live resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    /// Reachable address (prefer private).
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub state: InstanceState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Region or environment the instance belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Instance {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            state: InstanceState::Running,
            tags: BTreeMap::new(),
            scope: None,
            instance_type: None,
            name: None,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_state(mut self, state: InstanceState) -> Self {
        self.state = state;
        self
    }

    /// Running and addressable.
    pub fn is_eligible(&self) -> bool {
        self.state == InstanceState::Running && !self.address.trim().is_empty()
    }

    pub fn in_scope(&self, scope: Option<&str>) -> bool {
        match scope {
            None => true,
            Some(scope) => self.scope.as_deref() == Some(scope),
        }
    }
}

/// Tag predicate: `key=value`, or a bare `key` matching any value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: Option<String>,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match (tags.get(&self.key), &self.value) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl Default for TagFilter {
    fn default() -> Self {
        TagFilter::new("ssh-provisioning", Some("enabled".to_string()))
    }
}

impl FromStr for TagFilter {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ResolutionError::InvalidMarker {
            marker: s.to_string(),
        };
        let (key, value) = match s.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
            None => (s.trim(), None),
        };
        if key.is_empty() {
            return Err(invalid());
        }
        Ok(TagFilter::new(key, value))
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value),
            None => f.write_str(&self.key),
        }
    }
}

/// Enumerates instances from some infrastructure description.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Running instances, optionally restricted to those matching `filter`.
    async fn list_running_instances(
        &self,
        filter: Option<&TagFilter>,
    ) -> Result<Vec<Instance>, ResolutionError>;
}

/// Outcome of [`InstanceResolver::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Eligible instances, sorted and de-duplicated by id.
    pub instances: Vec<Instance>,
    /// True when the marker query was empty and every running instance in
    /// scope was used instead.
    pub fallback_used: bool,
}

/// Selects target hosts from an [`InstanceSource`].
#[derive(Clone)]
pub struct InstanceResolver {
    source: Arc<dyn InstanceSource>,
    marker: TagFilter,
    scope: Option<String>,
    allow_fallback: bool,
}

impl fmt::Debug for InstanceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceResolver")
            .field("source", &self.source.name())
            .field("marker", &self.marker)
            .field("scope", &self.scope)
            .field("allow_fallback", &self.allow_fallback)
            .finish()
    }
}

impl InstanceResolver {
    pub fn new(source: Arc<dyn InstanceSource>) -> Self {
        Self {
            source,
            marker: TagFilter::default(),
            scope: None,
            allow_fallback: true,
        }
    }

    pub fn with_marker(mut self, marker: TagFilter) -> Self {
        self.marker = marker;
        self
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_fallback(mut self, allow_fallback: bool) -> Self {
        self.allow_fallback = allow_fallback;
        self
    }

    #[tracing::instrument(
        name = "resolve_instances",
        skip(self),
        fields(source = self.source.name(), marker = %self.marker, scope = ?self.scope)
    )]
    pub async fn resolve(&self) -> Result<Resolution, ResolutionError> {
        let scope = self.scope.as_deref();

        let tagged = self
            .source
            .list_running_instances(Some(&self.marker))
            .await?;
        let primary = self.select(tagged, scope);
        if !primary.is_empty() {
            tracing::info!(instances = primary.len(), "resolved tagged instances");
            return Ok(Resolution {
                instances: primary,
                fallback_used: false,
            });
        }

        if !self.allow_fallback {
            return Err(self.no_instances());
        }

        let all = self.source.list_running_instances(None).await?;
        let fallback = self.select(all, scope);
        if fallback.is_empty() {
            return Err(self.no_instances());
        }

        tracing::warn!(
            fallback = true,
            instances = fallback.len(),
            "no instances carry the marker tag; provisioning every running instance in scope"
        );
        Ok(Resolution {
            instances: fallback,
            fallback_used: true,
        })
    }

    fn select(&self, instances: Vec<Instance>, scope: Option<&str>) -> Vec<Instance> {
        let mut selected: BTreeMap<String, Instance> = BTreeMap::new();
        for instance in instances {
            if !instance.is_eligible() {
                tracing::debug!(instance = %instance.id, state = %instance.state, "skipping ineligible instance");
                continue;
            }
            if !instance.in_scope(scope) {
                continue;
            }
            selected.entry(instance.id.clone()).or_insert(instance);
        }
        selected.into_values().collect()
    }

    fn no_instances(&self) -> ResolutionError {
        ResolutionError::NoEligibleInstances {
            marker: self.marker.to_string(),
            scope: self.scope.clone().unwrap_or_else(|| "*".to_string()),
        }
    }
}

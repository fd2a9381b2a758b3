//! Static inventory file.
//!
//! ```toml
//! [[instances]]
//! id = "i-0abc"
//! address = "10.0.1.12"
//! scope = "us-east-1"
//! tags = { ssh-provisioning = "enabled" }
//! ```
//!
//! The JSON form is `{ "instances": [ ... ] }` with the same fields.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Instance, InstanceSource, InstanceState, ResolutionError, TagFilter};

#[derive(Debug, Deserialize)]
struct InventoryDocument {
    #[serde(default)]
    instances: Vec<Instance>,
}

/// Fixed list of instances, typically loaded from a file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    instances: Vec<Instance>,
}

impl StaticInventory {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self { instances }
    }

    #[tracing::instrument(name = "inventory_load", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, ResolutionError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ResolutionError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

        let parse_error = |reason: String| ResolutionError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let document: InventoryDocument = match extension.as_str() {
            "json" => serde_json::from_str(&contents).map_err(|e| parse_error(e.to_string()))?,
            "toml" => toml::from_str(&contents).map_err(|e| parse_error(e.to_string()))?,
            other => {
                return Err(ResolutionError::UnsupportedFormat {
                    extension: other.to_string(),
                });
            }
        };

        tracing::debug!(instances = document.instances.len(), "loaded inventory");
        Ok(Self::new(document.instances))
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }
}

#[async_trait]
impl InstanceSource for StaticInventory {
    fn name(&self) -> &'static str {
        "inventory"
    }

    async fn list_running_instances(
        &self,
        filter: Option<&TagFilter>,
    ) -> Result<Vec<Instance>, ResolutionError> {
        Ok(self
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .filter(|i| filter.is_none_or(|f| f.matches(&i.tags)))
            .cloned()
            .collect())
    }
}

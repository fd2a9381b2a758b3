//! Instances from `terraform output -json`.
//!
//! Expects an output named `instance_details` whose value is a map of
//! instance records:
//!
//! ```json
//! {
//!   "instance_details": {
//!     "sensitive": false,
//!     "value": {
//!       "web-1": {
//!         "instance_id": "i-0abc",
//!         "private_ip": "10.0.1.12",
//!         "public_ip": "54.1.2.3",
//!         "instance_type": "t3.medium",
//!         "region": "us-east-1",
//!         "tags": { "ssh-provisioning": "enabled" }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! The address prefers the private IP. `region` becomes the instance scope.
//! Records without a `state` are running, since Terraform only reports live
//! resources.
//!
//! Outputs are read and parsed once per source; later listings (such as the
//! untagged fallback) filter the cached records.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use super::{Instance, InstanceSource, InstanceState, ResolutionError, TagFilter};

/// Name of the Terraform output holding instance records.
pub const INSTANCE_OUTPUT: &str = "instance_details";

const TERRAFORM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct TerraformInstance {
    #[serde(alias = "id")]
    instance_id: String,
    #[serde(default)]
    private_ip: Option<String>,
    #[serde(default)]
    public_ip: Option<String>,
    #[serde(default)]
    instance_type: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    state: Option<InstanceState>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

impl TerraformInstance {
    fn into_instance(self, name: String) -> Instance {
        let address = [self.private_ip, self.public_ip]
            .into_iter()
            .flatten()
            .map(|ip| ip.trim().to_string())
            .find(|ip| !ip.is_empty())
            .unwrap_or_default();

        Instance {
            id: self.instance_id,
            address,
            state: self.state.unwrap_or(InstanceState::Running),
            tags: self.tags,
            scope: self.region,
            instance_type: self.instance_type,
            name: Some(name),
        }
    }
}

/// Where the Terraform outputs come from.
#[derive(Debug, Clone)]
enum OutputsLocation {
    /// A saved `terraform output -json` document.
    File(PathBuf),
    /// A Terraform working directory; `terraform output -json` is run there.
    Directory(PathBuf),
}

/// [`InstanceSource`] backed by Terraform outputs.
#[derive(Debug, Clone)]
pub struct TerraformOutputs {
    location: OutputsLocation,
    instances: OnceCell<Vec<Instance>>,
}

impl TerraformOutputs {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: OutputsLocation::File(path.into()),
            instances: OnceCell::new(),
        }
    }

    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            location: OutputsLocation::Directory(dir.into()),
            instances: OnceCell::new(),
        }
    }

    /// Every record in the outputs, read on first use.
    async fn instances(&self) -> Result<&[Instance], ResolutionError> {
        let instances = self
            .instances
            .get_or_try_init(|| async { parse_outputs(&self.read_outputs().await?) })
            .await?;
        Ok(instances)
    }

    async fn read_outputs(&self) -> Result<String, ResolutionError> {
        match &self.location {
            OutputsLocation::File(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| ResolutionError::Read {
                        path: path.clone(),
                        source,
                    })
            }
            OutputsLocation::Directory(dir) => run_terraform_output(dir).await,
        }
    }
}

#[async_trait]
impl InstanceSource for TerraformOutputs {
    fn name(&self) -> &'static str {
        "terraform"
    }

    async fn list_running_instances(
        &self,
        filter: Option<&TagFilter>,
    ) -> Result<Vec<Instance>, ResolutionError> {
        Ok(self
            .instances()
            .await?
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .filter(|i| filter.is_none_or(|f| f.matches(&i.tags)))
            .cloned()
            .collect())
    }
}

/// Parse a `terraform output -json` document into instances.
pub fn parse_outputs(raw: &str) -> Result<Vec<Instance>, ResolutionError> {
    let parse_error = |reason: String| ResolutionError::Parse {
        path: PathBuf::from("<terraform output>"),
        reason,
    };

    let outputs: Value = serde_json::from_str(raw).map_err(|e| parse_error(e.to_string()))?;
    let output = outputs
        .get(INSTANCE_OUTPUT)
        .ok_or_else(|| ResolutionError::MissingOutput {
            output: INSTANCE_OUTPUT.to_string(),
        })?;

    // `terraform output -json` wraps each output as {sensitive, type, value};
    // accept the bare value too.
    let value = output.get("value").unwrap_or(output);
    let records: BTreeMap<String, TerraformInstance> =
        serde_json::from_value(value.clone()).map_err(|e| parse_error(e.to_string()))?;

    Ok(records
        .into_iter()
        .map(|(name, record)| record.into_instance(name))
        .collect())
}

#[tracing::instrument(name = "terraform_output", skip_all, fields(dir = %dir.display()))]
async fn run_terraform_output(dir: &Path) -> Result<String, ResolutionError> {
    let mut command = tokio::process::Command::new("terraform");
    command
        .args(["output", "-json"])
        .current_dir(dir)
        .kill_on_drop(true);

    let output = tokio::time::timeout(TERRAFORM_TIMEOUT, command.output())
        .await
        .map_err(|_| ResolutionError::Timeout {
            seconds: TERRAFORM_TIMEOUT.as_secs(),
        })?
        .map_err(|e| ResolutionError::Terraform {
            reason: format!("failed to run terraform: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ResolutionError::Terraform {
            reason: format!("exit status {}: {}", output.status, stderr.trim()),
        });
    }

    String::from_utf8(output.stdout).map_err(|e| ResolutionError::Terraform {
        reason: format!("output is not UTF-8: {e}"),
    })
}

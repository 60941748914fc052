//! Startup manifest: the resources the controller should know about.
//!
//! ```json
//! {
//!   "models": [{ "name": "iris", "reporters": ["mlserver-0", "mlserver-1"] }],
//!   "pipelines": [{ "name": "iris-pipeline", "reporters": ["dataflow-0"] }],
//!   "experiments": ["iris-ab"],
//!   "servers": ["mlserver"]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use mlplane_events::ResourceKind;
use mlplane_id::{ReporterId, ResourceName};
use serde::Deserialize;

use crate::retry_poller::StaticPlacement;

/// A resource with the reporters its operations run on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacedResource {
    pub name: ResourceName,
    pub reporters: Vec<ReporterId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub models: Vec<PlacedResource>,

    #[serde(default)]
    pub pipelines: Vec<PlacedResource>,

    #[serde(default)]
    pub experiments: Vec<ResourceName>,

    #[serde(default)]
    pub servers: Vec<ResourceName>,
}

impl Manifest {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("invalid manifest")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_json(&bytes)
    }

    /// Reporter placement for models and pipelines.
    pub fn placement(&self) -> StaticPlacement {
        let models = self.models.iter().map(|r| (ResourceKind::Model, r));
        let pipelines = self.pipelines.iter().map(|r| (ResourceKind::Pipeline, r));

        models
            .chain(pipelines)
            .fold(StaticPlacement::new(), |placement, (kind, resource)| {
                placement.with_resource(kind, resource.name.clone(), resource.reporters.clone())
            })
    }

    /// Every reporter named anywhere in the manifest.
    pub fn reporters(&self) -> BTreeSet<ReporterId> {
        self.models
            .iter()
            .chain(&self.pipelines)
            .flat_map(|resource| resource.reporters.iter().cloned())
            .collect()
    }
}

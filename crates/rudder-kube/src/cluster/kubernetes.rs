//! `kube`-backed cluster client
//!
//! Resources are handled as `DynamicObject`s resolved through API discovery,
//! applied with server-side apply, and deleted with background propagation.

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PropagationPolicy},
    core::{GroupVersionKind, TypeMeta},
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ClusterClient, ResourcePhase};
use crate::config::EngineConfig;
use crate::error::{KubeError, Result};

/// Annotation bumped on the pod template to trigger a rolling restart
const RESTARTED_AT_ANNOTATION: &str = "rudder.io/restartedAt";

/// A document resolved against discovery
struct Resolved {
    obj: DynamicObject,
    gvk: GroupVersionKind,
    api_resource: ApiResource,
    capabilities: ApiCapabilities,
}

impl Resolved {
    fn name(&self) -> Result<&str> {
        self.obj.metadata.name.as_deref().ok_or_else(|| {
            KubeError::InvalidManifest(format!("{} is missing metadata.name", self.gvk.kind))
        })
    }

    fn display_name(&self) -> String {
        let name = self.obj.metadata.name.as_deref().unwrap_or("unnamed");
        match &self.obj.metadata.namespace {
            Some(ns) => format!("{}/{}/{}", ns, self.gvk.kind, name),
            None => format!("{}/{}", self.gvk.kind, name),
        }
    }
}

/// [`ClusterClient`] talking to a real API server
pub struct KubeClusterClient {
    client: Client,
    discovery: RwLock<Discovery>,
    field_manager: String,
}

impl KubeClusterClient {
    /// Connect using the ambient kubeconfig / in-cluster config
    pub async fn try_default(config: &EngineConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Self::new(client, config).await
    }

    pub async fn new(client: Client, config: &EngineConfig) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self {
            client,
            discovery: RwLock::new(discovery),
            field_manager: config.field_manager.clone(),
        })
    }

    /// Re-run API discovery (after CRDs were installed)
    pub async fn refresh_discovery(&self) -> Result<()> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        *self.discovery.write().await = discovery;
        Ok(())
    }

    async fn resolve(&self, namespace: &str, resource: &str) -> Result<Resolved> {
        let mut obj: DynamicObject = serde_yaml::from_str(resource)?;
        let type_meta = obj.types.as_ref().ok_or_else(|| {
            KubeError::InvalidManifest("resource missing apiVersion or kind".to_string())
        })?;
        let gvk = gvk_from_type_meta(type_meta);

        let (api_resource, capabilities) = self
            .discovery
            .read()
            .await
            .resolve_gvk(&gvk)
            .ok_or_else(|| {
                KubeError::InvalidManifest(format!(
                    "unknown resource type: {}/{}",
                    type_meta.api_version, type_meta.kind
                ))
            })?;

        if capabilities.scope == Scope::Namespaced && obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some(namespace.to_string());
        }

        Ok(Resolved {
            obj,
            gvk,
            api_resource,
            capabilities,
        })
    }

    fn api_for(&self, resource: &Resolved) -> Api<DynamicObject> {
        match (&resource.capabilities.scope, &resource.obj.metadata.namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource.api_resource)
            }
            _ => Api::all_with(self.client.clone(), &resource.api_resource),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply(&self, namespace: &str, resource: &str) -> Result<()> {
        let resolved = self.resolve(namespace, resource).await?;
        let name = resolved.name()?;

        let mut params = PatchParams::apply(&self.field_manager);
        params.force = true;

        self.api_for(&resolved)
            .patch(name, &params, &Patch::Apply(&resolved.obj))
            .await
            .map_err(|e| KubeError::ApplyFailed {
                message: format!("{}: {}", resolved.display_name(), e),
            })?;
        debug!(resource = %resolved.display_name(), "applied");
        Ok(())
    }

    async fn delete(&self, namespace: &str, resource: &str) -> Result<()> {
        let resolved = self.resolve(namespace, resource).await?;
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };

        match self.api_for(&resolved).delete(resolved.name()?, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_phase(
        &self,
        namespace: &str,
        resource: &str,
        timeout: Duration,
    ) -> Result<ResourcePhase> {
        let resolved = self.resolve(namespace, resource).await?;
        let api = self.api_for(&resolved);

        let live = tokio::time::timeout(timeout, api.get_opt(resolved.name()?))
            .await
            .map_err(|_| {
                KubeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out reading {}", resolved.display_name()),
                ))
            })??
            .ok_or_else(|| KubeError::ResourceNotFound {
                resource: resolved.display_name(),
            })?;

        Ok(phase_of(&resolved.gvk.kind, live.metadata.generation, &live.data))
    }

    async fn restart(&self, namespace: &str, resource: &str) -> Result<()> {
        let resolved = self.resolve(namespace, resource).await?;
        if !matches!(
            resolved.gvk.kind.as_str(),
            "Deployment" | "StatefulSet" | "DaemonSet"
        ) {
            return Ok(());
        }

        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": {
                RESTARTED_AT_ANNOTATION: chrono::Utc::now().to_rfc3339()
            }}}}
        });
        self.api_for(&resolved)
            .patch(resolved.name()?, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Derive a phase from a live object's `spec`/`status`
///
/// Kinds with no notion of completion report `Succeeded` once they exist.
fn phase_of(kind: &str, generation: Option<i64>, data: &JsonValue) -> ResourcePhase {
    let status = &data["status"];
    let int = |v: &JsonValue| v.as_i64().unwrap_or(0);

    match kind {
        "Pod" => match status["phase"].as_str() {
            Some("Pending") => ResourcePhase::Pending,
            Some("Running") => ResourcePhase::Running,
            Some("Succeeded") => ResourcePhase::Succeeded,
            Some("Failed") => ResourcePhase::Failed,
            _ => ResourcePhase::Unknown,
        },
        "Job" => {
            let failed = status["conditions"].as_array().is_some_and(|conds| {
                conds
                    .iter()
                    .any(|c| c["type"] == "Failed" && c["status"] == "True")
            });
            if int(&status["succeeded"]) > 0 {
                ResourcePhase::Succeeded
            } else if failed {
                ResourcePhase::Failed
            } else if int(&status["active"]) > 0 {
                ResourcePhase::Running
            } else {
                ResourcePhase::Pending
            }
        }
        "Deployment" | "StatefulSet" | "ReplicaSet" => {
            let observed = status["observedGeneration"].as_i64().unwrap_or(0);
            let desired = data["spec"]["replicas"].as_i64().unwrap_or(1);
            let ready = int(&status["readyReplicas"]);
            if observed >= generation.unwrap_or(0) && ready >= desired {
                ResourcePhase::Running
            } else {
                ResourcePhase::Pending
            }
        }
        "DaemonSet" => {
            let desired = int(&status["desiredNumberScheduled"]);
            if int(&status["numberReady"]) >= desired {
                ResourcePhase::Running
            } else {
                ResourcePhase::Pending
            }
        }
        _ => ResourcePhase::Succeeded,
    }
}

/// Split `apiVersion` into group and version
///
/// - "apps/v1" -> group="apps", version="v1"
/// - "v1" -> group="", version="v1" (core API)
fn gvk_from_type_meta(tm: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match tm.api_version.rsplit_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), tm.api_version.clone()),
    };

    GroupVersionKind {
        group,
        version,
        kind: tm.kind.clone(),
    }
}

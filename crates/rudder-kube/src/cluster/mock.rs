//! In-memory cluster for tests
//!
//! Tracks live resources by (kind, namespace, name), records every call, and
//! lets tests script phases and inject failures per resource name.

use async_trait::async_trait;
use rudder_core::{ResourceHead, ResourceKey};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ClusterClient, ResourcePhase};
use crate::error::{KubeError, Result};

/// A call received by [`MockClusterClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    Apply(ResourceKey),
    Delete(ResourceKey),
    GetPhase(ResourceKey),
    Restart(ResourceKey),
}

impl ClusterCall {
    pub fn key(&self) -> &ResourceKey {
        match self {
            Self::Apply(k) | Self::Delete(k) | Self::GetPhase(k) | Self::Restart(k) => k,
        }
    }
}

struct MockState {
    live: BTreeMap<ResourceKey, String>,
    /// Scripted phases per resource name; the last one sticks
    phases: HashMap<String, VecDeque<ResourcePhase>>,
    poll_errors: HashMap<String, usize>,
    failing_applies: HashSet<String>,
    failing_deletes: HashSet<String>,
    default_phase: ResourcePhase,
    calls: Vec<ClusterCall>,
}

/// In-memory [`ClusterClient`]
#[derive(Clone)]
pub struct MockClusterClient {
    state: Arc<Mutex<MockState>>,
    latency: Duration,
}

impl Default for MockClusterClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClusterClient {
    /// Every resource reports `Succeeded` unless scripted otherwise
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                live: BTreeMap::new(),
                phases: HashMap::new(),
                poll_errors: HashMap::new(),
                failing_applies: HashSet::new(),
                failing_deletes: HashSet::new(),
                default_phase: ResourcePhase::Succeeded,
                calls: Vec::new(),
            })),
            latency: Duration::ZERO,
        }
    }

    /// Phase reported by resources without a script
    pub fn with_default_phase(self, phase: ResourcePhase) -> Self {
        self.state().default_phase = phase;
        self
    }

    /// Report `phase` for every resource named `name`
    pub fn with_phase(self, name: &str, phase: ResourcePhase) -> Self {
        self.set_phase(name, phase);
        self
    }

    /// Report `phases` in order on successive polls, then keep the last
    pub fn with_phases(
        self,
        name: &str,
        phases: impl IntoIterator<Item = ResourcePhase>,
    ) -> Self {
        self.state()
            .phases
            .insert(name.to_string(), phases.into_iter().collect());
        self
    }

    /// Fail the first `count` polls of `name`
    pub fn with_poll_errors(self, name: &str, count: usize) -> Self {
        self.state().poll_errors.insert(name.to_string(), count);
        self
    }

    /// Reject every apply of a resource named `name`
    pub fn with_failing_apply(self, name: &str) -> Self {
        self.set_apply_failure(name, true);
        self
    }

    /// Reject every delete of a resource named `name`
    pub fn with_failing_delete(self, name: &str) -> Self {
        self.state().failing_deletes.insert(name.to_string());
        self
    }

    /// Delay every apply, to widen race windows
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_phase(&self, name: &str, phase: ResourcePhase) {
        self.state()
            .phases
            .insert(name.to_string(), VecDeque::from([phase]));
    }

    pub fn set_apply_failure(&self, name: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_applies.insert(name.to_string());
        } else {
            state.failing_applies.remove(name);
        }
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Names of applied resources, in apply order
    pub fn applied_names(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                ClusterCall::Apply(k) => Some(k.name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of deleted resources, in delete order
    pub fn deleted_names(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                ClusterCall::Delete(k) => Some(k.name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_resources(&self) -> Vec<ResourceKey> {
        self.state().live.keys().cloned().collect()
    }

    pub fn is_live(&self, kind: &str, name: &str) -> bool {
        self.state()
            .live
            .keys()
            .any(|k| k.kind == kind && k.name == name)
    }

    /// Live document of a resource
    pub fn live_document(&self, kind: &str, name: &str) -> Option<String> {
        self.state()
            .live
            .iter()
            .find(|(k, _)| k.kind == kind && k.name == name)
            .map(|(_, doc)| doc.clone())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn resource_key(namespace: &str, resource: &str) -> Result<ResourceKey> {
    Ok(ResourceHead::parse(resource)?.key(namespace))
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn apply(&self, namespace: &str, resource: &str) -> Result<()> {
        let key = resource_key(namespace, resource)?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state();
        state.calls.push(ClusterCall::Apply(key.clone()));
        if state.failing_applies.contains(&key.name) {
            return Err(KubeError::ApplyFailed {
                message: format!("{}: admission webhook denied the request", key),
            });
        }
        state.live.insert(key, resource.to_string());
        Ok(())
    }

    async fn delete(&self, namespace: &str, resource: &str) -> Result<()> {
        let key = resource_key(namespace, resource)?;
        let mut state = self.state();
        state.calls.push(ClusterCall::Delete(key.clone()));
        if state.failing_deletes.contains(&key.name) {
            return Err(KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("{} is forbidden", key),
                reason: "Forbidden".to_string(),
                code: 403,
            })));
        }
        state.live.remove(&key);
        Ok(())
    }

    async fn get_phase(
        &self,
        namespace: &str,
        resource: &str,
        _timeout: Duration,
    ) -> Result<ResourcePhase> {
        let key = resource_key(namespace, resource)?;
        let mut state = self.state();
        state.calls.push(ClusterCall::GetPhase(key.clone()));

        if let Some(remaining) = state.poll_errors.get_mut(&key.name)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(KubeError::Io(std::io::Error::other("connection reset by peer")));
        }

        if !state.live.contains_key(&key) {
            return Err(KubeError::ResourceNotFound {
                resource: key.to_string(),
            });
        }

        let default_phase = state.default_phase;
        Ok(match state.phases.get_mut(&key.name) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(default_phase),
            Some(script) => script.front().copied().unwrap_or(default_phase),
            None => default_phase,
        })
    }

    async fn restart(&self, namespace: &str, resource: &str) -> Result<()> {
        let key = resource_key(namespace, resource)?;
        self.state().calls.push(ClusterCall::Restart(key));
        Ok(())
    }
}

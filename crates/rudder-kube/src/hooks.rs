//! Lifecycle hooks
//!
//! A hook is a manifest document annotated with `helm.sh/hook` (or
//! `rudder.io/hook`). Hooks are split out of the rendered manifest, stored
//! on the revision, and run by [`HookExecutor`] at their lifecycle events:
//! one at a time, lowest weight first, each awaited to completion before the
//! next starts.

use chrono::{DateTime, Utc};
use rudder_core::{Document, join_manifests, parse_documents};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterClient, ResourcePhase, WaitOutcome, wait_for_phase};
use crate::config::PollConfig;
use crate::error::{KubeError, Result};
use crate::release::StoredRelease;

pub const HOOK_ANNOTATION: &str = "rudder.io/hook";
pub const HELM_HOOK_ANNOTATION: &str = "helm.sh/hook";
pub const HOOK_WEIGHT_ANNOTATION: &str = "rudder.io/hook-weight";
pub const HELM_HOOK_WEIGHT_ANNOTATION: &str = "helm.sh/hook-weight";
pub const HOOK_DELETE_POLICY_ANNOTATION: &str = "rudder.io/hook-delete-policy";
pub const HELM_HOOK_DELETE_POLICY_ANNOTATION: &str = "helm.sh/hook-delete-policy";

/// Lifecycle event a hook can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEvent {
    PreInstall,
    PostInstall,
    PreDelete,
    PostDelete,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    /// Run on demand by the test runner
    ReleaseTest,
}

impl HookEvent {
    /// Parse an annotation value
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "pre-install" => Some(Self::PreInstall),
            "post-install" => Some(Self::PostInstall),
            "pre-delete" => Some(Self::PreDelete),
            "post-delete" => Some(Self::PostDelete),
            "pre-upgrade" => Some(Self::PreUpgrade),
            "post-upgrade" => Some(Self::PostUpgrade),
            "pre-rollback" => Some(Self::PreRollback),
            "post-rollback" => Some(Self::PostRollback),
            "test" | "test-success" | "release-test" => Some(Self::ReleaseTest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
            Self::PreDelete => "pre-delete",
            Self::PostDelete => "post-delete",
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
            Self::PreRollback => "pre-rollback",
            Self::PostRollback => "post-rollback",
            Self::ReleaseTest => "test",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When to delete a hook's resource
///
/// A hook carries any combination of policies; with none the resource is
/// left in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookDeletePolicy {
    /// Delete the previous resource before creating it again
    BeforeHookCreation,
    /// Delete after the hook succeeded
    HookSucceeded,
    /// Delete after the hook failed or timed out
    HookFailed,
}

impl HookDeletePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "before-hook-creation" => Some(Self::BeforeHookCreation),
            "hook-succeeded" => Some(Self::HookSucceeded),
            "hook-failed" => Some(Self::HookFailed),
            _ => None,
        }
    }
}

/// Outcome of a hook's latest execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRun {
    pub started_at: DateTime<Utc>,
    /// Unset when the hook timed out
    pub completed_at: Option<DateTime<Utc>>,
    pub phase: ResourcePhase,
}

/// Hook definition, as stored on a revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// `metadata.name` of the hook resource
    pub name: String,

    /// Kind of the hook resource
    pub kind: String,

    /// The hook resource (single YAML document)
    pub manifest: String,

    /// Ordering (lower runs first)
    #[serde(default)]
    pub weight: i32,

    pub events: Vec<HookEvent>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete_policies: Vec<HookDeletePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<HookRun>,
}

impl Hook {
    pub fn runs_on(&self, event: HookEvent) -> bool {
        self.events.contains(&event)
    }

    pub fn has_delete_policy(&self, policy: HookDeletePolicy) -> bool {
        self.delete_policies.contains(&policy)
    }

    /// Build a hook from an annotated document, `None` if it isn't a hook
    pub fn from_document(doc: &Document) -> Option<Self> {
        let head = &doc.head;
        let events = head
            .annotation(HOOK_ANNOTATION)
            .or_else(|| head.annotation(HELM_HOOK_ANNOTATION))?;

        let weight = head
            .annotation(HOOK_WEIGHT_ANNOTATION)
            .or_else(|| head.annotation(HELM_HOOK_WEIGHT_ANNOTATION))
            .and_then(|w| w.trim().parse().ok())
            .unwrap_or(0);

        let mut delete_policies: Vec<HookDeletePolicy> = head
            .annotation(HOOK_DELETE_POLICY_ANNOTATION)
            .or_else(|| head.annotation(HELM_HOOK_DELETE_POLICY_ANNOTATION))
            .map(|p| p.split(',').filter_map(HookDeletePolicy::parse).collect())
            .unwrap_or_default();
        delete_policies.dedup();

        Some(Self {
            name: head.metadata.name.clone(),
            kind: head.kind.clone(),
            manifest: doc.content.clone(),
            weight,
            events: events.split(',').filter_map(HookEvent::parse).collect(),
            delete_policies,
            last_run: None,
        })
    }
}

/// Split a rendered manifest into managed resources and hooks
///
/// Returns the manifest without hook documents, and the hooks in manifest
/// order.
pub fn split_hooks(rendered: &str) -> Result<(String, Vec<Hook>)> {
    let mut managed = Vec::new();
    let mut hooks = Vec::new();

    for doc in parse_documents(rendered)? {
        match Hook::from_document(&doc) {
            Some(hook) => hooks.push(hook),
            None => managed.push(doc.content),
        }
    }

    Ok((join_manifests(managed), hooks))
}

/// Result of one hook execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub name: String,
    pub event: HookEvent,
    pub phase: ResourcePhase,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl HookResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at.signed_duration_since(self.started_at)
    }
}

/// Runs the hooks of a revision against the cluster
pub struct HookExecutor {
    /// Results of executed hooks, in execution order
    pub results: Vec<HookResult>,
    client: Arc<dyn ClusterClient>,
    poll: PollConfig,
    namespace: String,
}

impl HookExecutor {
    pub fn new(client: Arc<dyn ClusterClient>, poll: PollConfig, namespace: &str) -> Self {
        Self {
            results: Vec::new(),
            client,
            poll,
            namespace: namespace.to_string(),
        }
    }

    /// Run every hook of `release` attached to `event`
    ///
    /// Each hook gets its own `timeout`. The first failing hook aborts the
    /// batch; `last_run` is recorded on every hook that was started.
    #[instrument(skip_all, fields(release = %release.name, version = release.version, %event))]
    pub async fn execute(
        &mut self,
        release: &mut StoredRelease,
        event: HookEvent,
        timeout: Duration,
    ) -> Result<()> {
        let mut order: Vec<usize> = (0..release.hooks.len())
            .filter(|&i| release.hooks[i].runs_on(event))
            .collect();
        // Stable: equal weights keep manifest order
        order.sort_by_key(|&i| release.hooks[i].weight);

        if order.is_empty() {
            debug!("no hooks for event");
            return Ok(());
        }
        info!(count = order.len(), "running hooks");

        for i in order {
            let (run, outcome) = self.run_hook(&release.hooks[i], event, timeout).await;
            release.hooks[i].last_run = Some(run.clone());
            self.results.push(HookResult {
                name: release.hooks[i].name.clone(),
                event,
                phase: run.phase,
                error: outcome.as_ref().err().map(ToString::to_string),
                started_at: run.started_at,
                completed_at: run.completed_at.unwrap_or_else(Utc::now),
            });
            outcome?;
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        hook: &Hook,
        event: HookEvent,
        timeout: Duration,
    ) -> (HookRun, Result<()>) {
        let started_at = Utc::now();
        let ns = self.namespace.as_str();
        debug!(hook = %hook.name, weight = hook.weight, "running hook");

        if hook.has_delete_policy(HookDeletePolicy::BeforeHookCreation)
            && let Err(e) = self.client.delete(ns, &hook.manifest).await
        {
            warn!(hook = %hook.name, error = %e, "failed to delete previous hook resource");
        }

        if let Err(e) = self.client.apply(ns, &hook.manifest).await {
            let run = HookRun {
                started_at,
                completed_at: Some(Utc::now()),
                phase: ResourcePhase::Failed,
            };
            let err = KubeError::HookFailed {
                hook_name: hook.name.clone(),
                event: event.to_string(),
                message: format!("failed to create hook resource: {}", e),
            };
            return (run, Err(err));
        }

        let outcome = wait_for_phase(
            self.client.as_ref(),
            ns,
            &hook.manifest,
            timeout,
            &self.poll,
            |p| p.is_terminal(),
        )
        .await;

        let (run, result) = match outcome {
            WaitOutcome::Reached(ResourcePhase::Succeeded) => (
                HookRun {
                    started_at,
                    completed_at: Some(Utc::now()),
                    phase: ResourcePhase::Succeeded,
                },
                Ok(()),
            ),
            WaitOutcome::Reached(phase) => (
                HookRun {
                    started_at,
                    completed_at: Some(Utc::now()),
                    phase,
                },
                Err(KubeError::HookFailed {
                    hook_name: hook.name.clone(),
                    event: event.to_string(),
                    message: format!("{} {} reported phase {}", hook.kind, hook.name, phase),
                }),
            ),
            WaitOutcome::TimedOut { last_phase, .. } => (
                HookRun {
                    started_at,
                    completed_at: None,
                    phase: last_phase.unwrap_or_default(),
                },
                Err(KubeError::HookTimeout {
                    hook_name: hook.name.clone(),
                    event: event.to_string(),
                    timeout,
                }),
            ),
        };

        let cleanup = if result.is_ok() {
            hook.has_delete_policy(HookDeletePolicy::HookSucceeded)
        } else {
            hook.has_delete_policy(HookDeletePolicy::HookFailed)
        };
        if cleanup && let Err(e) = self.client.delete(ns, &hook.manifest).await {
            warn!(hook = %hook.name, error = %e, "failed to clean up hook resource");
        }

        (run, result)
    }

    pub fn results_for(&self, event: HookEvent) -> Vec<&HookResult> {
        self.results.iter().filter(|r| r.event == event).collect()
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| !r.success())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::{ClusterCall, MockClusterClient};
    use crate::release::tests::test_release;

    pub(crate) fn test_hook(name: &str, events: Vec<HookEvent>, weight: i32) -> Hook {
        Hook {
            name: name.to_string(),
            kind: "Job".to_string(),
            manifest: format!("apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: {}", name),
            weight,
            events,
            delete_policies: Vec::new(),
            last_run: None,
        }
    }

    fn executor(client: &MockClusterClient) -> HookExecutor {
        HookExecutor::new(
            Arc::new(client.clone()),
            PollConfig::fixed(Duration::from_millis(5)),
            "default",
        )
    }

    #[test]
    fn test_parse_events() {
        assert_eq!(HookEvent::parse(" pre-upgrade"), Some(HookEvent::PreUpgrade));
        assert_eq!(HookEvent::parse("test-success"), Some(HookEvent::ReleaseTest));
        assert_eq!(HookEvent::parse("during-install"), None);
        assert_eq!(HookEvent::PostRollback.to_string(), "post-rollback");
    }

    #[test]
    fn test_split_hooks() {
        let rendered = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: config
---
apiVersion: batch/v1
kind: Job
metadata:
  name: db-migrate
  annotations:
    helm.sh/hook: pre-install,pre-upgrade
    helm.sh/hook-weight: "-5"
    helm.sh/hook-delete-policy: before-hook-creation,hook-succeeded
---
apiVersion: v1
kind: Pod
metadata:
  name: smoke
  annotations:
    rudder.io/hook: test
"#;
        let (manifest, hooks) = split_hooks(rendered).unwrap();

        assert!(manifest.contains("name: config"));
        assert!(!manifest.contains("db-migrate"));
        assert_eq!(hooks.len(), 2);

        let migrate = &hooks[0];
        assert_eq!(migrate.name, "db-migrate");
        assert_eq!(migrate.kind, "Job");
        assert_eq!(migrate.weight, -5);
        assert_eq!(migrate.events, vec![HookEvent::PreInstall, HookEvent::PreUpgrade]);
        assert_eq!(
            migrate.delete_policies,
            vec![HookDeletePolicy::BeforeHookCreation, HookDeletePolicy::HookSucceeded]
        );

        assert_eq!(hooks[1].events, vec![HookEvent::ReleaseTest]);
        assert!(hooks[1].delete_policies.is_empty());
    }

    #[test]
    fn test_split_without_hooks() {
        let (manifest, hooks) = split_hooks("kind: ConfigMap\nmetadata:\n  name: a").unwrap();
        assert!(hooks.is_empty());
        assert_eq!(manifest, "kind: ConfigMap\nmetadata:\n  name: a");
    }

    #[tokio::test]
    async fn test_executes_by_weight_with_stable_ties() {
        let client = MockClusterClient::new();
        let mut release = test_release("app", 1);
        release.hooks = vec![
            test_hook("c", vec![HookEvent::PreInstall], 5),
            test_hook("a", vec![HookEvent::PreInstall], -1),
            test_hook("b1", vec![HookEvent::PreInstall], 5),
            test_hook("other", vec![HookEvent::PostInstall], -10),
            test_hook("b2", vec![HookEvent::PreInstall], 5),
        ];

        let mut exec = executor(&client);
        exec.execute(&mut release, HookEvent::PreInstall, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(client.applied_names(), vec!["a", "c", "b1", "b2"]);
        assert!(release.hooks[3].last_run.is_none());
        let run = release.hooks[0].last_run.as_ref().unwrap();
        assert_eq!(run.phase, ResourcePhase::Succeeded);
        assert!(run.completed_at.is_some());
        assert_eq!(exec.results_for(HookEvent::PreInstall).len(), 4);
        assert!(!exec.has_failures());
    }

    #[tokio::test]
    async fn test_failed_hook_aborts_batch() {
        let client = MockClusterClient::new().with_phase("first", ResourcePhase::Failed);
        let mut release = test_release("app", 1);
        release.hooks = vec![
            test_hook("first", vec![HookEvent::PreUpgrade], 0),
            test_hook("second", vec![HookEvent::PreUpgrade], 1),
        ];

        let mut exec = executor(&client);
        let err = exec
            .execute(&mut release, HookEvent::PreUpgrade, Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, KubeError::HookFailed { ref hook_name, .. } if hook_name == "first"));
        assert_eq!(client.applied_names(), vec!["first"]);
        assert_eq!(
            release.hooks[0].last_run.as_ref().map(|r| r.phase),
            Some(ResourcePhase::Failed)
        );
        assert!(release.hooks[1].last_run.is_none());
        assert!(exec.has_failures());
    }

    #[tokio::test]
    async fn test_timeout() {
        let client = MockClusterClient::new().with_phase("slow", ResourcePhase::Running);
        let mut release = test_release("app", 1);
        release.hooks = vec![test_hook("slow", vec![HookEvent::PostInstall], 0)];

        let err = executor(&client)
            .execute(&mut release, HookEvent::PostInstall, Duration::from_millis(40))
            .await
            .unwrap_err();

        assert!(matches!(err, KubeError::HookTimeout { .. }));
        let run = release.hooks[0].last_run.as_ref().unwrap();
        assert_eq!(run.phase, ResourcePhase::Running);
        assert!(run.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_create_error_is_hook_failure() {
        let client = MockClusterClient::new().with_failing_apply("broken");
        let mut release = test_release("app", 1);
        release.hooks = vec![test_hook("broken", vec![HookEvent::PreDelete], 0)];

        let err = executor(&client)
            .execute(&mut release, HookEvent::PreDelete, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to create hook resource"));
    }

    #[tokio::test]
    async fn test_delete_policies() {
        let client = MockClusterClient::new().with_phase("fails", ResourcePhase::Failed);
        let mut release = test_release("app", 1);

        let mut before = test_hook("recreated", vec![HookEvent::PreInstall], 0);
        before.delete_policies = vec![HookDeletePolicy::BeforeHookCreation];
        let mut on_success = test_hook("cleaned", vec![HookEvent::PreInstall], 1);
        on_success.delete_policies = vec![HookDeletePolicy::HookSucceeded];
        let mut on_failure = test_hook("fails", vec![HookEvent::PreInstall], 2);
        on_failure.delete_policies = vec![HookDeletePolicy::HookFailed];
        release.hooks = vec![before, on_success, on_failure];

        let result = executor(&client)
            .execute(&mut release, HookEvent::PreInstall, Duration::from_secs(1))
            .await;
        assert!(result.is_err());

        let calls = client.calls();
        let first = calls.first().unwrap();
        assert!(matches!(first, ClusterCall::Delete(k) if k.name == "recreated"));

        // Kept: before-hook-creation only deletes ahead of creation
        assert!(client.is_live("Job", "recreated"));
        assert!(!client.is_live("Job", "cleaned"));
        assert!(!client.is_live("Job", "fails"));
    }

    #[tokio::test]
    async fn test_combined_delete_policies() {
        let client = MockClusterClient::new();
        let mut release = test_release("app", 1);
        let mut migrate = test_hook("migrate", vec![HookEvent::PreUpgrade], 0);
        migrate.delete_policies = vec![
            HookDeletePolicy::BeforeHookCreation,
            HookDeletePolicy::HookSucceeded,
        ];
        release.hooks = vec![migrate];

        executor(&client)
            .execute(&mut release, HookEvent::PreUpgrade, Duration::from_secs(1))
            .await
            .unwrap();

        let kinds: Vec<&'static str> = client
            .calls()
            .iter()
            .filter_map(|c| match c {
                ClusterCall::Apply(_) => Some("apply"),
                ClusterCall::Delete(_) => Some("delete"),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec!["delete", "apply", "delete"]);
        assert!(!client.is_live("Job", "migrate"));
    }

    #[tokio::test]
    async fn test_no_matching_hooks() {
        let client = MockClusterClient::new();
        let mut release = test_release("app", 1);
        release.hooks = vec![test_hook("t", vec![HookEvent::ReleaseTest], 0)];

        executor(&client)
            .execute(&mut release, HookEvent::PreRollback, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(client.calls().is_empty());
    }
}

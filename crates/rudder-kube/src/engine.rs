//! Release lifecycle engine
//!
//! Install, upgrade and uninstall as state-machine-driven workflows over a
//! [`StorageDriver`], a [`ClusterClient`] and a [`Renderer`]. Every workflow
//! follows the same shape: compute the next revision, persist it `pending-*`,
//! run hooks and cluster side effects, then commit `deployed` or `failed`.
//!
//! The engine keeps no in-memory lock. Two operations racing on one release
//! are serialized by the store: a new revision goes through the atomic
//! `create` (the loser gets `RevisionExists`), and every status change of an
//! existing revision goes through `update_if`, so a workflow holding a stale
//! copy gets `StatusConflict` instead of overwriting the winner's outcome.

use rudder_core::{Chart, Document, Renderer, ResourceKey, Values, parse_documents};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::actions::{InstallOptions, UninstallOptions, UpgradeOptions};
use crate::cluster::{ClusterClient, ResourcePhase, WaitOutcome, wait_for_phase};
use crate::config::EngineConfig;
use crate::error::{KubeError, Result};
use crate::hooks::{HookEvent, HookExecutor, split_hooks};
use crate::release::{ReleaseStatus, StoredRelease};
use crate::storage::StorageDriver;

pub const RESOURCE_POLICY_ANNOTATION: &str = "rudder.io/resource-policy";
pub const HELM_RESOURCE_POLICY_ANNOTATION: &str = "helm.sh/resource-policy";

/// Drives releases through their lifecycle
///
/// Cheap to clone; clones share the store, cluster client and renderer, so
/// each workflow can run in its own task.
#[derive(Clone)]
pub struct LifecycleEngine {
    storage: Arc<dyn StorageDriver>,
    cluster: Arc<dyn ClusterClient>,
    renderer: Arc<dyn Renderer>,
    config: Arc<EngineConfig>,
}

/// How a new manifest replaces the previous one on the cluster
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReconcileOptions {
    pub prune: bool,
    pub force: bool,
    pub recreate_pods: bool,
}

impl LifecycleEngine {
    pub fn new(
        storage: impl StorageDriver + 'static,
        cluster: impl ClusterClient + 'static,
        renderer: impl Renderer + 'static,
        config: EngineConfig,
    ) -> Self {
        Self::from_shared(
            Arc::new(storage),
            Arc::new(cluster),
            Arc::new(renderer),
            config,
        )
    }

    pub fn from_shared(
        storage: Arc<dyn StorageDriver>,
        cluster: Arc<dyn ClusterClient>,
        renderer: Arc<dyn Renderer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            cluster,
            renderer,
            config: Arc::new(config),
        }
    }

    pub fn storage(&self) -> &dyn StorageDriver {
        self.storage.as_ref()
    }

    pub fn cluster(&self) -> &dyn ClusterClient {
        self.cluster.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========== Install ==========

    /// Install a chart as a new release
    #[instrument(skip_all, fields(release = %options.name, namespace = %options.namespace))]
    pub async fn install(
        &self,
        chart: &Chart,
        config: Values,
        options: &InstallOptions,
    ) -> Result<StoredRelease> {
        let (name, namespace) = (options.name.as_str(), options.namespace.as_str());

        let mut histories: BTreeMap<String, Vec<StoredRelease>> = BTreeMap::new();
        for release in self.storage.list(None, Some(name)).await? {
            histories
                .entry(release.namespace.clone())
                .or_default()
                .push(release);
        }

        let mut version = 1;
        for (ns, history) in &mut histories {
            history.sort_by_key(|r| r.version);
            let Some(head) = history.last() else {
                continue;
            };
            if ns == namespace {
                ensure_idle(head)?;
                // Reinstalling continues the numbering of the old history
                version = head.version + 1;
            }
            if holds_name(history, namespace) {
                return Err(KubeError::ReleaseAlreadyExists {
                    name: name.to_string(),
                    namespace: ns.clone(),
                });
            }
        }

        let rendered = self.renderer.render(chart, &config)?;
        let (manifest, hooks) = split_hooks(&rendered)?;

        let mut release = StoredRelease::for_install(
            name.to_string(),
            namespace.to_string(),
            version,
            chart.metadata.clone(),
            config,
            manifest,
        );
        release.hooks = hooks;
        release
            .labels
            .extend(options.labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        if options.dry_run {
            return Ok(release);
        }

        self.storage.create(&release).await?;
        info!(version, "install started");

        let timeout = self.config.timeout_or_default(options.timeout);
        let outcome = self.run_install(&mut release, options, timeout).await;
        let description = options.description.as_deref().unwrap_or("Install complete");
        self.commit(release, outcome, description, None).await
    }

    async fn run_install(
        &self,
        release: &mut StoredRelease,
        options: &InstallOptions,
        timeout: Duration,
    ) -> Result<()> {
        let mut hooks = self.hook_executor(release);
        if !options.disable_hooks {
            hooks.execute(release, HookEvent::PreInstall, timeout).await?;
        }

        for doc in parse_documents(&release.manifest)? {
            self.cluster.apply(&release.namespace, &doc.content).await?;
        }

        if options.wait {
            self.wait_until_ready(&release.namespace, &release.manifest, timeout)
                .await?;
        }

        if !options.disable_hooks {
            hooks.execute(release, HookEvent::PostInstall, timeout).await?;
        }
        Ok(())
    }

    // ========== Upgrade ==========

    /// Upgrade the deployed revision of a release
    ///
    /// On failure the new revision is `failed` and the previously deployed
    /// revision stays `deployed`.
    #[instrument(skip_all, fields(release = %options.name, namespace = %options.namespace))]
    pub async fn upgrade(
        &self,
        chart: &Chart,
        config: Values,
        options: &UpgradeOptions,
    ) -> Result<StoredRelease> {
        let history = self
            .storage
            .history(&options.namespace, &options.name)
            .await?;
        let head = head_of(&history, &options.name, &options.namespace)?;
        ensure_idle(head)?;

        let deployed = history
            .iter()
            .rev()
            .find(|r| r.is_deployed())
            .cloned()
            .ok_or_else(|| KubeError::ReleaseNotFound {
                name: options.name.clone(),
                namespace: options.namespace.clone(),
            })?;

        let config = if options.reuse_values {
            let mut merged = deployed.config.clone();
            merged.merge(&config);
            merged
        } else {
            config
        };

        let rendered = self.renderer.render(chart, &config)?;
        let (manifest, hooks) = split_hooks(&rendered)?;

        let mut release =
            StoredRelease::for_upgrade(head, chart.metadata.clone(), config, manifest);
        release.hooks = hooks;

        if options.dry_run {
            return Ok(release);
        }

        self.storage.create(&release).await?;
        info!(
            version = release.version,
            from = deployed.version,
            "upgrade started"
        );

        let timeout = self.config.timeout_or_default(options.timeout);
        let outcome = self
            .run_upgrade(&mut release, &deployed, options, timeout)
            .await;
        let description = options.description.as_deref().unwrap_or("Upgrade complete");
        self.commit(release, outcome, description, Some(deployed))
            .await
    }

    async fn run_upgrade(
        &self,
        release: &mut StoredRelease,
        previous: &StoredRelease,
        options: &UpgradeOptions,
        timeout: Duration,
    ) -> Result<()> {
        let mut hooks = self.hook_executor(release);
        if !options.disable_hooks {
            hooks.execute(release, HookEvent::PreUpgrade, timeout).await?;
        }

        let reconcile = ReconcileOptions {
            prune: options.prune,
            force: options.force,
            recreate_pods: options.recreate_pods,
        };
        self.reconcile(
            &release.namespace,
            &previous.manifest,
            &release.manifest,
            reconcile,
        )
        .await?;

        if options.wait {
            self.wait_until_ready(&release.namespace, &release.manifest, timeout)
                .await?;
        }

        if !options.disable_hooks {
            hooks.execute(release, HookEvent::PostUpgrade, timeout).await?;
        }
        Ok(())
    }

    // ========== Uninstall ==========

    /// Uninstall the head revision of a release
    ///
    /// The head must be `deployed` or `failed`. When a failed upgrade left an
    /// older revision `deployed`, its resources are removed as well and it is
    /// superseded. Resources that fail to delete are reported but don't keep
    /// the head from being marked `deleted`.
    #[instrument(skip_all, fields(release = %options.name, namespace = %options.namespace))]
    pub async fn uninstall(&self, options: &UninstallOptions) -> Result<StoredRelease> {
        let history = self
            .storage
            .history(&options.namespace, &options.name)
            .await?;
        let head = head_of(&history, &options.name, &options.namespace)?;
        ensure_idle(head)?;
        if !matches!(head.status, ReleaseStatus::Deployed | ReleaseStatus::Failed) {
            return Err(KubeError::ReleaseNotFound {
                name: options.name.clone(),
                namespace: options.namespace.clone(),
            });
        }
        let deployed = history
            .iter()
            .rev()
            .find(|r| r.is_deployed() && r.version != head.version)
            .cloned();

        let claimed = head.clone();
        let mut release = head.clone();
        release.mark_uninstalling();
        self.storage.update_if(&release, claimed.status).await?;
        info!(version = release.version, "uninstall started");

        let timeout = self.config.timeout_or_default(options.timeout);
        let mut hooks = self.hook_executor(&release);

        if !options.disable_hooks
            && let Err(e) = hooks.execute(&mut release, HookEvent::PreDelete, timeout).await
        {
            // Keep the hook outcome and hand the revision back
            release.restore_from(&claimed);
            self.storage
                .update_if(&release, ReleaseStatus::PendingUninstall)
                .await?;
            return Err(e);
        }

        let mut docs = parse_documents(&release.manifest)?;
        if let Some(previous) = &deployed {
            let current: HashSet<ResourceKey> = docs
                .iter()
                .map(|d| d.head.key(&release.namespace))
                .collect();
            docs.extend(
                parse_documents(&previous.manifest)?
                    .into_iter()
                    .filter(|d| !current.contains(&d.head.key(&release.namespace))),
            );
        }
        let failures = self.delete_resources(&release.namespace, docs).await;

        let post_delete = if options.disable_hooks {
            Ok(())
        } else {
            hooks
                .execute(&mut release, HookEvent::PostDelete, timeout)
                .await
        };

        let description = if failures.is_empty() {
            options
                .description
                .clone()
                .unwrap_or_else(|| "Uninstallation complete".to_string())
        } else {
            format!("Uninstallation completed with errors: {}", failures.join("; "))
        };
        release.mark_deleted(description);
        self.storage
            .update_if(&release, ReleaseStatus::PendingUninstall)
            .await?;
        if let Some(mut previous) = deployed {
            previous.mark_superseded();
            self.storage
                .update_if(&previous, ReleaseStatus::Deployed)
                .await?;
        }
        info!(version = release.version, "release uninstalled");

        if !options.keep_history {
            let purged = self
                .storage
                .delete_all(&release.namespace, &release.name)
                .await?;
            info!(revisions = purged.len(), "release history purged");
        }

        if !failures.is_empty() {
            return Err(KubeError::PartialDelete { failures });
        }
        post_delete?;
        Ok(release)
    }

    /// Delete resources in reverse order
    ///
    /// Returns a description of each resource that couldn't be deleted.
    async fn delete_resources(&self, namespace: &str, docs: Vec<Document>) -> Vec<String> {
        let mut failures = Vec::new();
        for doc in docs.into_iter().rev() {
            let key = doc.head.key(namespace);
            if is_kept(&doc) {
                info!(resource = %key, "keeping resource (resource-policy: keep)");
                continue;
            }
            if let Err(e) = self.cluster.delete(namespace, &doc.content).await {
                warn!(resource = %key, error = %e, "failed to delete resource");
                failures.push(format!("{}: {}", key, e));
            }
        }
        failures
    }

    // ========== Query Operations ==========

    /// Mark a release stuck in a pending state as failed
    #[instrument(skip(self))]
    pub async fn recover(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        let mut release = self.storage.last(namespace, name).await?;

        if !release.status.is_pending() {
            return Err(KubeError::NotPending {
                name: name.to_string(),
                status: release.status.to_string(),
            });
        }

        let pending = release.status;
        release.mark_failed("Manually recovered from stuck state");
        self.storage.update_if(&release, pending).await?;
        warn!(version = release.version, "pending revision marked failed");
        Ok(release)
    }

    /// All revisions of a release, oldest first
    pub async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        self.storage.history(namespace, name).await
    }

    /// The head revision of a release
    pub async fn status(&self, namespace: &str, name: &str) -> Result<StoredRelease> {
        self.storage.last(namespace, name).await
    }

    /// One specific revision
    pub async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        self.storage.get(namespace, name, version).await
    }

    /// Head revision of every release, sorted by namespace then name
    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<StoredRelease>> {
        let mut heads: BTreeMap<(String, String), StoredRelease> = BTreeMap::new();
        for release in self.storage.list(namespace, None).await? {
            let key = (release.namespace.clone(), release.name.clone());
            if heads.get(&key).is_none_or(|h| h.version < release.version) {
                heads.insert(key, release);
            }
        }
        Ok(heads.into_values().collect())
    }

    /// Wait until every resource of a revision is ready
    pub async fn wait(&self, release: &StoredRelease, timeout: Option<Duration>) -> Result<()> {
        let timeout = self.config.timeout_or_default(timeout);
        self.wait_until_ready(&release.namespace, &release.manifest, timeout)
            .await
    }

    // ========== Internal Helpers ==========

    pub(crate) fn hook_executor(&self, release: &StoredRelease) -> HookExecutor {
        HookExecutor::new(
            self.cluster.clone(),
            self.config.poll.clone(),
            &release.namespace,
        )
    }

    /// Commit the outcome of a workflow
    ///
    /// On success `previous` is superseded and `release` becomes the deployed
    /// revision. On failure `release` is marked failed and returned inside
    /// the error. Superseding fails with `StatusConflict` when `previous` is
    /// no longer deployed (another operation got to it first); that turns the
    /// commit into a failure.
    pub(crate) async fn commit(
        &self,
        mut release: StoredRelease,
        outcome: Result<()>,
        description: &str,
        previous: Option<StoredRelease>,
    ) -> Result<StoredRelease> {
        let pending = release.status;
        let outcome = match (outcome, previous) {
            (Ok(()), Some(mut previous)) => {
                previous.mark_superseded();
                self.storage
                    .update_if(&previous, ReleaseStatus::Deployed)
                    .await
            }
            (outcome, _) => outcome,
        };

        match outcome {
            Ok(()) => {
                release.mark_deployed(description);
                self.storage.update_if(&release, pending).await?;
                info!(version = release.version, "release deployed");
                Ok(release)
            }
            Err(e) => {
                warn!(version = release.version, error = %e, "operation failed");
                release.mark_failed(e.to_string());
                if let Err(store_err) = self.storage.update_if(&release, pending).await {
                    warn!(error = %store_err, "failed to record failed revision");
                }
                Err(KubeError::release_failed(release, e))
            }
        }
    }

    /// Bring the cluster from `previous` to `next`
    pub(crate) async fn reconcile(
        &self,
        namespace: &str,
        previous: &str,
        next: &str,
        options: ReconcileOptions,
    ) -> Result<()> {
        let next_docs = parse_documents(next)?;

        for doc in &next_docs {
            if options.force {
                self.cluster.delete(namespace, &doc.content).await?;
            }
            self.cluster.apply(namespace, &doc.content).await?;
        }

        if options.prune {
            let wanted: HashSet<ResourceKey> =
                next_docs.iter().map(|d| d.head.key(namespace)).collect();
            let stale = parse_documents(previous)?
                .into_iter()
                .filter(|d| !wanted.contains(&d.head.key(namespace)));

            let mut failures = Vec::new();
            for doc in stale {
                let key = doc.head.key(namespace);
                if is_kept(&doc) {
                    info!(resource = %key, "keeping dropped resource (resource-policy: keep)");
                    continue;
                }
                info!(resource = %key, "pruning resource dropped from manifest");
                if let Err(e) = self.cluster.delete(namespace, &doc.content).await {
                    failures.push(format!("{}: {}", key, e));
                }
            }
            if !failures.is_empty() {
                return Err(KubeError::PartialDelete { failures });
            }
        }

        if options.recreate_pods {
            for doc in &next_docs {
                self.cluster.restart(namespace, &doc.content).await?;
            }
        }
        Ok(())
    }

    /// Wait for every document of `manifest` to report ready, within one
    /// overall deadline
    pub(crate) async fn wait_until_ready(
        &self,
        namespace: &str,
        manifest: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;

        for doc in parse_documents(manifest)? {
            let key = doc.head.key(namespace);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = wait_for_phase(
                self.cluster.as_ref(),
                namespace,
                &doc.content,
                remaining,
                &self.config.poll,
                |p| {
                    matches!(
                        p,
                        ResourcePhase::Running | ResourcePhase::Succeeded | ResourcePhase::Failed
                    )
                },
            )
            .await;

            match outcome {
                WaitOutcome::Reached(ResourcePhase::Failed) => {
                    return Err(KubeError::NotReady {
                        resource: key.to_string(),
                        message: "resource failed".to_string(),
                    });
                }
                WaitOutcome::Reached(_) => {}
                WaitOutcome::TimedOut {
                    last_phase,
                    last_error,
                } => {
                    let message = match (last_phase, last_error) {
                        (_, Some(err)) => format!("timed out after {:?}: {}", timeout, err),
                        (Some(phase), None) => {
                            format!("timed out after {:?} (phase: {})", timeout, phase)
                        }
                        (None, None) => format!("timed out after {:?}", timeout),
                    };
                    return Err(KubeError::NotReady {
                        resource: key.to_string(),
                        message,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Head of a non-empty history
pub(crate) fn head_of<'a>(
    history: &'a [StoredRelease],
    name: &str,
    namespace: &str,
) -> Result<&'a StoredRelease> {
    history.last().ok_or_else(|| KubeError::ReleaseNotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
    })
}

/// Refuse to start while another operation holds the head
pub(crate) fn ensure_idle(head: &StoredRelease) -> Result<()> {
    if head.status.is_pending() {
        return Err(KubeError::OperationInProgress {
            name: head.name.clone(),
            status: head.status.to_string(),
        });
    }
    Ok(())
}

/// Whether a history still holds its release name against a new install
///
/// An uninstalled history is free. A history whose head failed and that has
/// nothing deployed is free for an install into its own namespace, which
/// takes it over.
fn holds_name(history: &[StoredRelease], namespace: &str) -> bool {
    let Some(head) = history.last() else {
        return false;
    };
    match head.status {
        ReleaseStatus::Deleted => false,
        ReleaseStatus::Failed => {
            head.namespace != namespace || history.iter().any(|r| r.is_deployed())
        }
        _ => true,
    }
}

/// Resources annotated `resource-policy: keep` outlive their release
fn is_kept(doc: &Document) -> bool {
    doc.head
        .annotation(RESOURCE_POLICY_ANNOTATION)
        .or_else(|| doc.head.annotation(HELM_RESOURCE_POLICY_ANNOTATION))
        .is_some_and(|p| p.trim() == "keep")
}

//! Rollback workflow
//!
//! A rollback never rewrites history: it appends a new revision whose
//! manifest, config, chart and hooks are copied from an older one, and
//! re-applies it the way an upgrade would. Nothing is rendered.
//!
//! Unlike upgrade, the deployed revision is superseded as soon as the
//! rollback revision is persisted, so a failed rollback leaves no revision
//! `deployed`.

use std::time::Duration;
use tracing::{info, instrument};

use crate::actions::RollbackOptions;
use crate::engine::{LifecycleEngine, ReconcileOptions, ensure_idle, head_of};
use crate::error::{KubeError, Result};
use crate::hooks::HookEvent;
use crate::release::{ReleaseStatus, StoredRelease};

impl LifecycleEngine {
    /// Roll a release back to an earlier revision
    ///
    /// `options.revision == 0` selects the newest non-deleted revision older
    /// than the deployed one.
    #[instrument(skip_all, fields(release = %options.name, namespace = %options.namespace, target = options.revision))]
    pub async fn rollback(&self, options: &RollbackOptions) -> Result<StoredRelease> {
        let history = self
            .storage()
            .history(&options.namespace, &options.name)
            .await?;
        let head = head_of(&history, &options.name, &options.namespace)?;
        ensure_idle(head)?;

        let target = select_target(&history, options.revision)?;
        let previous = history.iter().rev().find(|r| r.is_deployed()).cloned();

        let mut release = StoredRelease::for_rollback(head, target);
        self.storage().create(&release).await?;
        info!(
            version = release.version,
            target = target.version,
            "rollback started"
        );

        let timeout = self.config().timeout_or_default(options.timeout);
        let current_manifest = previous
            .as_ref()
            .map_or(head.manifest.as_str(), |p| p.manifest.as_str());

        let outcome = match previous.clone() {
            Some(mut prev) => {
                prev.mark_superseded();
                self.storage()
                    .update_if(&prev, ReleaseStatus::Deployed)
                    .await
            }
            None => Ok(()),
        };
        let outcome = match outcome {
            Ok(()) => {
                self.run_rollback(&mut release, current_manifest, options, timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        let description = options
            .description
            .clone()
            .unwrap_or_else(|| format!("Rollback to {}", target.version));
        self.commit(release, outcome, &description, None).await
    }

    async fn run_rollback(
        &self,
        release: &mut StoredRelease,
        current_manifest: &str,
        options: &RollbackOptions,
        timeout: Duration,
    ) -> Result<()> {
        let mut hooks = self.hook_executor(release);
        if !options.disable_hooks {
            hooks.execute(release, HookEvent::PreRollback, timeout).await?;
        }

        let reconcile = ReconcileOptions {
            prune: true,
            force: options.force,
            recreate_pods: options.recreate_pods,
        };
        self.reconcile(
            &release.namespace,
            current_manifest,
            &release.manifest,
            reconcile,
        )
        .await?;

        if options.wait {
            self.wait_until_ready(&release.namespace, &release.manifest, timeout)
                .await?;
        }

        if !options.disable_hooks {
            hooks.execute(release, HookEvent::PostRollback, timeout).await?;
        }
        Ok(())
    }
}

/// Pick the revision to roll back to
///
/// An explicit version must exist and be older than the head. Otherwise the
/// reference is the deployed revision (the head if none is deployed) and the
/// newest non-deleted revision older than it is chosen.
pub fn select_target(history: &[StoredRelease], requested: u32) -> Result<&StoredRelease> {
    let Some(head) = history.last() else {
        return Err(KubeError::Storage("empty release history".to_string()));
    };

    if requested > 0 {
        if requested >= head.version {
            return Err(KubeError::InvalidTarget {
                name: head.name.clone(),
                version: requested,
                reason: format!("must be older than the current revision {}", head.version),
            });
        }
        return history
            .iter()
            .find(|r| r.version == requested)
            .ok_or_else(|| KubeError::InvalidTarget {
                name: head.name.clone(),
                version: requested,
                reason: "revision does not exist".to_string(),
            });
    }

    let reference = history
        .iter()
        .rev()
        .find(|r| r.is_deployed())
        .unwrap_or(head)
        .version;

    history
        .iter()
        .rev()
        .find(|r| r.version < reference && r.status != ReleaseStatus::Deleted)
        .ok_or_else(|| KubeError::NoPriorRevision {
            name: head.name.clone(),
        })
}

//! Release revisions and their status state machine

use chrono::{DateTime, Utc};
use rudder_core::{ChartMetadata, Values};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::hooks::Hook;

/// One versioned snapshot of a release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRelease {
    /// Release name
    pub name: String,

    /// Kubernetes namespace
    pub namespace: String,

    /// Revision number (1-indexed, never reused)
    pub version: u32,

    pub status: ReleaseStatus,

    /// Human-readable outcome of the operation that produced this revision
    #[serde(default)]
    pub description: String,

    /// Chart the manifest was rendered from
    pub chart: ChartMetadata,

    /// Config supplied by the caller
    #[serde(default)]
    pub config: Values,

    /// Rendered manifest (managed resources, hooks excluded)
    pub manifest: String,

    /// Hooks of this revision, in manifest order
    #[serde(default)]
    pub hooks: Vec<Hook>,

    /// Custom labels for filtering/querying
    #[serde(default)]
    pub labels: HashMap<String, String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Notes rendered for the user (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl StoredRelease {
    /// Create a pending revision for installation
    pub fn for_install(
        name: String,
        namespace: String,
        version: u32,
        chart: ChartMetadata,
        config: Values,
        manifest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            namespace,
            version,
            status: ReleaseStatus::PendingInstall,
            description: "Initial install underway".to_string(),
            chart,
            config,
            manifest,
            hooks: Vec::new(),
            labels: HashMap::new(),
            created_at: now,
            updated_at: now,
            notes: None,
        }
    }

    /// Create the next pending revision on top of `head`
    pub fn for_upgrade(
        head: &StoredRelease,
        chart: ChartMetadata,
        config: Values,
        manifest: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: head.name.clone(),
            namespace: head.namespace.clone(),
            version: head.version + 1,
            status: ReleaseStatus::PendingUpgrade,
            description: "Preparing upgrade".to_string(),
            chart,
            config,
            manifest,
            hooks: Vec::new(),
            labels: head.labels.clone(),
            created_at: now,
            updated_at: now,
            notes: None,
        }
    }

    /// Create the next pending revision as a verbatim copy of `target`
    ///
    /// Hooks are copied without their last-run records.
    pub fn for_rollback(head: &StoredRelease, target: &StoredRelease) -> Self {
        let now = Utc::now();
        Self {
            name: head.name.clone(),
            namespace: head.namespace.clone(),
            version: head.version + 1,
            status: ReleaseStatus::PendingRollback,
            description: format!("Rolling back to {}", target.version),
            chart: target.chart.clone(),
            config: target.config.clone(),
            manifest: target.manifest.clone(),
            hooks: target
                .hooks
                .iter()
                .cloned()
                .map(|mut h| {
                    h.last_run = None;
                    h
                })
                .collect(),
            labels: target.labels.clone(),
            created_at: now,
            updated_at: now,
            notes: target.notes.clone(),
        }
    }

    /// Storage key for this revision
    pub fn storage_key(&self) -> String {
        storage_key(&self.name, self.version)
    }

    pub fn is_deployed(&self) -> bool {
        self.status == ReleaseStatus::Deployed
    }

    pub fn mark_deployed(&mut self, description: impl Into<String>) {
        self.transition(ReleaseStatus::Deployed, description.into());
    }

    pub fn mark_failed(&mut self, description: impl Into<String>) {
        self.transition(ReleaseStatus::Failed, description.into());
    }

    /// Mark as replaced by a newer revision, keeping the description
    pub fn mark_superseded(&mut self) {
        let description = std::mem::take(&mut self.description);
        self.transition(ReleaseStatus::Superseded, description);
    }

    /// Claim the revision for an uninstall in progress
    pub fn mark_uninstalling(&mut self) {
        self.transition(
            ReleaseStatus::PendingUninstall,
            "Deletion in progress".to_string(),
        );
    }

    /// Give up an uninstall claim, returning to the status and description
    /// the revision had when it was claimed
    pub fn restore_from(&mut self, claimed: &StoredRelease) {
        self.transition(claimed.status, claimed.description.clone());
    }

    pub fn mark_deleted(&mut self, description: impl Into<String>) {
        self.transition(ReleaseStatus::Deleted, description.into());
    }

    fn transition(&mut self, status: ReleaseStatus, description: String) {
        debug_assert!(
            self.status.can_transition_to(status),
            "illegal transition {} -> {}",
            self.status,
            status
        );
        self.status = status;
        self.description = description;
        self.updated_at = Utc::now();
    }
}

/// Storage key for a release name and version
pub fn storage_key(name: &str, version: u32) -> String {
    format!("rudder.release.v1.{}.v{}", name, version)
}

/// Revision status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    #[default]
    Unknown,
    /// The current live revision
    Deployed,
    /// Replaced by a newer revision
    Superseded,
    /// The operation that produced this revision failed
    Failed,
    /// Removed by uninstall
    Deleted,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    PendingUninstall,
}

impl ReleaseStatus {
    /// Check if this is a pending (in-flight) state
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall
                | Self::PendingUpgrade
                | Self::PendingRollback
                | Self::PendingUninstall
        )
    }

    /// Allowed status moves of a revision
    ///
    /// A pending revision resolves exactly once; afterwards only
    /// `deployed -> superseded` and uninstall are allowed. Uninstall claims a
    /// `deployed` or `failed` revision and ends in `deleted`, or hands the
    /// revision back when it aborts (or `failed` when recovered).
    pub fn can_transition_to(&self, next: ReleaseStatus) -> bool {
        use ReleaseStatus::*;
        match (self, next) {
            (PendingInstall | PendingUpgrade | PendingRollback, Deployed | Failed) => true,
            (Deployed, Superseded) => true,
            (Deployed | Failed, PendingUninstall) => true,
            (PendingUninstall, Deleted | Deployed | Failed) => true,
            (Unknown, _) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
            Self::PendingUninstall => "pending-uninstall",
        }
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cluster::ResourcePhase;
    use crate::hooks::{HookEvent, HookRun};

    pub(crate) fn test_chart() -> ChartMetadata {
        ChartMetadata::parse("test-chart", "1.0.0").unwrap()
    }

    /// A deployed revision with a one-ConfigMap manifest
    pub(crate) fn test_release(name: &str, version: u32) -> StoredRelease {
        let mut release = StoredRelease::for_install(
            name.to_string(),
            "default".to_string(),
            version,
            test_chart(),
            Values::new(),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm".to_string(),
        );
        release.status = ReleaseStatus::Deployed;
        release
    }

    #[test]
    fn test_storage_key() {
        let release = test_release("myapp", 1);
        assert_eq!(release.storage_key(), "rudder.release.v1.myapp.v1");
    }

    #[test]
    fn test_pending_states() {
        assert!(!ReleaseStatus::Deployed.is_pending());
        assert!(ReleaseStatus::PendingInstall.is_pending());
        assert!(ReleaseStatus::PendingRollback.is_pending());
        assert!(ReleaseStatus::PendingUninstall.is_pending());
    }

    #[test]
    fn test_transitions() {
        use ReleaseStatus::*;
        assert!(PendingUpgrade.can_transition_to(Deployed));
        assert!(PendingUpgrade.can_transition_to(Failed));
        assert!(Deployed.can_transition_to(Superseded));
        assert!(Failed.can_transition_to(PendingUninstall));
        assert!(PendingUninstall.can_transition_to(Deleted));
        assert!(PendingUninstall.can_transition_to(Deployed));

        assert!(!Deployed.can_transition_to(Deleted));
        assert!(!Superseded.can_transition_to(PendingUninstall));

        assert!(!Failed.can_transition_to(Deployed));
        assert!(!Superseded.can_transition_to(Deployed));
        assert!(!Deployed.can_transition_to(Failed));
        assert!(!Deleted.can_transition_to(Deployed));
    }

    #[test]
    fn test_mark_superseded_keeps_description() {
        let mut release = test_release("app", 1);
        release.description = "Install complete".to_string();
        release.mark_superseded();
        assert_eq!(release.status, ReleaseStatus::Superseded);
        assert_eq!(release.description, "Install complete");
    }

    #[test]
    fn test_uninstall_claim_and_restore() {
        let mut release = test_release("app", 2);
        release.description = "Upgrade complete".to_string();
        let claimed = release.clone();

        release.mark_uninstalling();
        assert_eq!(release.status, ReleaseStatus::PendingUninstall);
        assert_eq!(release.status.to_string(), "pending-uninstall");

        release.restore_from(&claimed);
        assert_eq!(release.status, ReleaseStatus::Deployed);
        assert_eq!(release.description, "Upgrade complete");
    }

    #[test]
    fn test_for_upgrade_increments_version() {
        let head = test_release("app", 4);
        let next = StoredRelease::for_upgrade(
            &head,
            test_chart(),
            Values::new(),
            "kind: ConfigMap".to_string(),
        );
        assert_eq!(next.version, 5);
        assert_eq!(next.status, ReleaseStatus::PendingUpgrade);
        assert_eq!(next.namespace, head.namespace);
    }

    #[test]
    fn test_for_rollback_copies_target_and_clears_hook_runs() {
        let head = test_release("app", 3);
        let mut target = test_release("app", 1);
        target.manifest = "kind: Secret".to_string();
        target.config = Values(serde_json::json!({"replicas": 2}));
        let mut hook = crate::hooks::tests::test_hook("migrate", vec![HookEvent::PreRollback], 0);
        hook.last_run = Some(HookRun {
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            phase: ResourcePhase::Succeeded,
        });
        target.hooks.push(hook);

        let next = StoredRelease::for_rollback(&head, &target);
        assert_eq!(next.version, 4);
        assert_eq!(next.status, ReleaseStatus::PendingRollback);
        assert_eq!(next.manifest, "kind: Secret");
        assert_eq!(next.config, target.config);
        assert_eq!(next.hooks.len(), 1);
        assert!(next.hooks[0].last_run.is_none());
    }

    #[test]
    fn test_serialization_layout() {
        let release = test_release("app", 1);
        let json = serde_json::to_value(&release).unwrap();
        assert_eq!(json["status"], "deployed");
        assert_eq!(json["chart"]["name"], "test-chart");
        assert!(json.get("createdAt").is_some());

        let back: StoredRelease = serde_json::from_value(json).unwrap();
        assert_eq!(back, release);
    }
}

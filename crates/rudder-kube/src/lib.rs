//! Rudder Kube - release lifecycle engine
//!
//! This crate provides:
//! - **Storage Drivers**: ordered revision history in Kubernetes Secrets, on local disk, or in memory
//! - **Lifecycle Engine**: install, upgrade and uninstall driven by a revision state machine
//! - **Rollback**: re-apply an older revision as a new one
//! - **Hooks**: lifecycle hooks run in weight order with completion polling and delete policies
//! - **Test Runner**: run a release's test hooks and stream their results
//! - **Cluster Client**: the seam to the cluster, backed by `kube` or an in-memory mock

pub mod actions;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod release;
pub mod rollback;
pub mod storage;
pub mod testing;

pub use actions::{InstallOptions, RollbackOptions, TestOptions, UninstallOptions, UpgradeOptions};
pub use cluster::{
    ClusterCall, ClusterClient, KubeClusterClient, MockClusterClient, ResourcePhase, WaitOutcome,
    wait_for_phase,
};
pub use config::{EngineConfig, PollConfig};
pub use engine::LifecycleEngine;
pub use error::{KubeError, Result};
pub use hooks::{
    Hook, HookDeletePolicy, HookEvent, HookExecutor, HookResult, HookRun, split_hooks,
};
pub use release::{ReleaseStatus, StoredRelease};
pub use rollback::select_target;
pub use storage::{
    CompressionMethod, FileDriver, MemoryDriver, OperationCounts, SecretsDriver, StorageConfig,
    StorageDriver,
};
pub use testing::{TestRun, TestRunEvent, TestRunStatus, TestSuite};

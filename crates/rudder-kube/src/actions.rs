//! Action options for install, upgrade, uninstall, rollback and test operations

use std::collections::HashMap;
use std::time::Duration;

/// Options for install operation
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Skip pre/post-install hooks
    pub disable_hooks: bool,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Timeout for hooks and wait (engine default when unset)
    pub timeout: Option<Duration>,

    /// Compute the revision without persisting or applying it
    pub dry_run: bool,

    /// Custom labels to add to the release
    pub labels: HashMap<String, String>,

    /// Description for this release
    pub description: Option<String>,
}

impl InstallOptions {
    /// Create default install options with name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Enable waiting for resources
    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn without_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }

    /// Enable dry-run mode
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Options for upgrade operation
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Skip pre/post-upgrade hooks
    pub disable_hooks: bool,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Timeout for hooks and wait
    pub timeout: Option<Duration>,

    /// Compute the revision without persisting or applying it
    pub dry_run: bool,

    /// Merge the new config over the deployed revision's config
    pub reuse_values: bool,

    /// Force resource updates through delete/recreate
    pub force: bool,

    /// Restart workloads after applying
    pub recreate_pods: bool,

    /// Delete resources dropped from the manifest (default: true)
    pub prune: bool,

    /// Description for this revision
    pub description: Option<String>,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: String::new(),
            disable_hooks: false,
            wait: false,
            timeout: None,
            dry_run: false,
            reuse_values: false,
            force: false,
            recreate_pods: false,
            prune: true,
            description: None,
        }
    }
}

impl UpgradeOptions {
    /// Create default upgrade options
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn without_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }

    /// Enable force mode
    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn reuse_values(mut self) -> Self {
        self.reuse_values = true;
        self
    }

    /// Leave resources dropped from the manifest in place
    pub fn without_prune(mut self) -> Self {
        self.prune = false;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Options for uninstall operation
#[derive(Debug, Clone)]
pub struct UninstallOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Timeout for hooks
    pub timeout: Option<Duration>,

    /// Keep release history (default: true)
    pub keep_history: bool,

    /// Skip pre/post-delete hooks
    pub disable_hooks: bool,

    /// Description for the uninstall
    pub description: Option<String>,
}

impl Default for UninstallOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: String::new(),
            timeout: None,
            keep_history: true,
            disable_hooks: false,
            description: None,
        }
    }
}

impl UninstallOptions {
    /// Create default uninstall options
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Delete every revision once the release is uninstalled
    pub fn purge(mut self) -> Self {
        self.keep_history = false;
        self
    }

    pub fn without_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }
}

/// Options for rollback operation
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Release name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Target revision (0 = previous)
    pub revision: u32,

    /// Wait for resources to be ready
    pub wait: bool,

    /// Timeout for hooks and wait
    pub timeout: Option<Duration>,

    /// Force rollback through delete/recreate
    pub force: bool,

    /// Skip pre/post-rollback hooks
    pub disable_hooks: bool,

    /// Restart workloads after applying
    pub recreate_pods: bool,

    /// Description for this rollback
    pub description: Option<String>,
}

impl RollbackOptions {
    /// Create default rollback options
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Set target revision
    pub fn to_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Enable force mode
    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Wait for rollback
    pub fn with_wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn without_hooks(mut self) -> Self {
        self.disable_hooks = true;
        self
    }
}

/// Options for a test suite run
#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub name: String,
    pub namespace: String,
    /// Per-test timeout
    pub timeout: Option<Duration>,
}

impl TestOptions {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

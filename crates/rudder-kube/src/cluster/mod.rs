//! Cluster client seam
//!
//! The engine never talks to the API server directly. Everything it needs
//! from the cluster goes through [`ClusterClient`]: apply a document, delete
//! it, and observe its phase. [`KubeClusterClient`] implements this with
//! `kube`; [`MockClusterClient`] keeps resources in memory for tests.

mod kubernetes;
mod mock;

pub use kubernetes::KubeClusterClient;
pub use mock::{ClusterCall, MockClusterClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PollConfig;
use crate::error::Result;

/// Coarse lifecycle phase of a live resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourcePhase {
    #[default]
    Unknown,
    Pending,
    /// Running, or ready for long-lived workloads
    Running,
    Succeeded,
    Failed,
}

impl ResourcePhase {
    /// Completed, one way or the other
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations the engine performs against the cluster
///
/// `resource` is always a single YAML document. Namespaced resources that
/// don't name a namespace land in `namespace`.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create or update a resource
    async fn apply(&self, namespace: &str, resource: &str) -> Result<()>;

    /// Delete a resource; deleting an absent resource succeeds
    async fn delete(&self, namespace: &str, resource: &str) -> Result<()>;

    /// Observe the resource's current phase
    async fn get_phase(
        &self,
        namespace: &str,
        resource: &str,
        timeout: Duration,
    ) -> Result<ResourcePhase>;

    /// Restart the pods of a workload
    async fn restart(&self, _namespace: &str, _resource: &str) -> Result<()> {
        Ok(())
    }
}

/// How a completion wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The resource reached a phase accepted by the caller
    Reached(ResourcePhase),
    /// The deadline passed first
    TimedOut {
        last_phase: Option<ResourcePhase>,
        last_error: Option<String>,
    },
}

/// Poll `get_phase` with bounded backoff until `done` accepts a phase or
/// `timeout` elapses.
///
/// Poll errors are treated as transient: logged and retried.
pub async fn wait_for_phase<C, F>(
    client: &C,
    namespace: &str,
    resource: &str,
    timeout: Duration,
    poll: &PollConfig,
    done: F,
) -> WaitOutcome
where
    C: ClusterClient + ?Sized,
    F: Fn(ResourcePhase) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut backoff = poll.backoff();
    let mut last_phase = None;
    let mut last_error = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return WaitOutcome::TimedOut {
                last_phase,
                last_error,
            };
        }

        match tokio::time::timeout(remaining, client.get_phase(namespace, resource, remaining))
            .await
        {
            Ok(Ok(phase)) => {
                debug!(%phase, "polled resource phase");
                if done(phase) {
                    return WaitOutcome::Reached(phase);
                }
                last_phase = Some(phase);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "transient error while polling resource phase");
                last_error = Some(e.to_string());
            }
            Err(_) => continue,
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(backoff.next_delay().min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: probe";

    fn fast_poll() -> PollConfig {
        PollConfig::fixed(Duration::from_millis(5))
    }

    #[test]
    fn test_terminal_phases() {
        assert!(ResourcePhase::Succeeded.is_terminal());
        assert!(ResourcePhase::Failed.is_terminal());
        assert!(!ResourcePhase::Running.is_terminal());
        assert!(!ResourcePhase::Unknown.is_terminal());
    }

    #[tokio::test]
    async fn test_wait_reaches_phase_after_pending() {
        let client = MockClusterClient::new().with_phases(
            "probe",
            [ResourcePhase::Pending, ResourcePhase::Running, ResourcePhase::Succeeded],
        );
        client.apply("default", JOB).await.unwrap();

        let outcome = wait_for_phase(
            &client,
            "default",
            JOB,
            Duration::from_secs(2),
            &fast_poll(),
            |p| p.is_terminal(),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Reached(ResourcePhase::Succeeded));
    }

    #[tokio::test]
    async fn test_wait_retries_transient_errors() {
        let client = MockClusterClient::new()
            .with_phase("probe", ResourcePhase::Succeeded)
            .with_poll_errors("probe", 2);
        client.apply("default", JOB).await.unwrap();

        let outcome = wait_for_phase(
            &client,
            "default",
            JOB,
            Duration::from_secs(2),
            &fast_poll(),
            |p| p.is_terminal(),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Reached(ResourcePhase::Succeeded));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let client = MockClusterClient::new().with_phase("probe", ResourcePhase::Running);
        client.apply("default", JOB).await.unwrap();

        let outcome = wait_for_phase(
            &client,
            "default",
            JOB,
            Duration::from_millis(50),
            &fast_poll(),
            |p| p.is_terminal(),
        )
        .await;
        assert_eq!(
            outcome,
            WaitOutcome::TimedOut {
                last_phase: Some(ResourcePhase::Running),
                last_error: None,
            }
        );
    }
}

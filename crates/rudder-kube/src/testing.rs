//! Release test runner
//!
//! Runs the `test` hooks of a deployed revision as probes. Progress is
//! streamed over a channel as it happens; the suite result always contains
//! every test that ran, in hook order. The release itself is never modified.

use chrono::{DateTime, Utc};
use rudder_core::{ResourceHead, split_manifests};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::actions::TestOptions;
use crate::cluster::{ResourcePhase, WaitOutcome, wait_for_phase};
use crate::engine::LifecycleEngine;
use crate::error::{KubeError, Result};
use crate::hooks::HookEvent;

/// Buffered events between the runner and a slow consumer
const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestRunStatus {
    /// The probe's outcome couldn't be observed (timeout, poll errors)
    #[default]
    Unknown,
    Success,
    Failure,
    Running,
}

impl std::fmt::Display for TestRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Outcome of one test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    /// `metadata.name` of the test resource
    pub name: String,
    pub status: TestRunStatus,
    pub info: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Progress notification sent while a suite runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRunEvent {
    pub name: String,
    pub status: TestRunStatus,
    pub message: String,
}

/// Results of a test suite run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuite {
    pub release: String,
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Vec<TestRun>,
}

impl TestSuite {
    pub fn passed(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == TestRunStatus::Success)
    }

    pub fn count(&self, status: TestRunStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

impl LifecycleEngine {
    /// Run the test hooks of the deployed revision
    ///
    /// Events are best-effort: a dropped receiver doesn't stop the suite.
    #[instrument(skip_all, fields(release = %options.name, namespace = %options.namespace))]
    pub async fn run_tests(
        &self,
        options: &TestOptions,
        events: mpsc::Sender<TestRunEvent>,
    ) -> Result<TestSuite> {
        let release = self
            .storage()
            .deployed(&options.namespace, &options.name)
            .await?;

        let tests: Vec<_> = release
            .hooks
            .iter()
            .filter(|h| h.runs_on(HookEvent::ReleaseTest))
            .collect();
        if tests.is_empty() {
            return Err(KubeError::NoTestsFound {
                name: options.name.clone(),
            });
        }

        let timeout = self.config().timeout_or_default(options.timeout);
        let mut suite = TestSuite {
            release: release.name.clone(),
            version: release.version,
            started_at: Utc::now(),
            completed_at: None,
            results: Vec::new(),
        };
        info!(version = release.version, hooks = tests.len(), "running tests");

        for hook in tests {
            for doc in split_manifests(&hook.manifest) {
                let name = ResourceHead::parse(&doc)
                    .map(|h| h.metadata.name)
                    .ok()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| hook.name.clone());
                let run = self
                    .run_test(&release.namespace, &name, &doc, timeout, &events)
                    .await;
                suite.results.push(run);
            }
        }

        suite.completed_at = Some(Utc::now());
        info!(
            passed = suite.count(TestRunStatus::Success),
            failed = suite.count(TestRunStatus::Failure),
            unknown = suite.count(TestRunStatus::Unknown),
            "tests finished"
        );
        Ok(suite)
    }

    /// Run the suite in a background task
    pub fn spawn_tests(
        &self,
        options: TestOptions,
    ) -> (mpsc::Receiver<TestRunEvent>, JoinHandle<Result<TestSuite>>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_tests(&options, tx).await });
        (rx, handle)
    }

    async fn run_test(
        &self,
        namespace: &str,
        name: &str,
        resource: &str,
        timeout: Duration,
        events: &mpsc::Sender<TestRunEvent>,
    ) -> TestRun {
        let started_at = Utc::now();
        notify(events, name, TestRunStatus::Running, format!("running test {}", name)).await;

        let (status, info) = match self.cluster().apply(namespace, resource).await {
            Err(e) => (
                TestRunStatus::Failure,
                format!("failed to create test {}: {}", name, e),
            ),
            Ok(()) => {
                let outcome = wait_for_phase(
                    self.cluster(),
                    namespace,
                    resource,
                    timeout,
                    &self.config().poll,
                    |p| p.is_terminal(),
                )
                .await;
                match outcome {
                    WaitOutcome::Reached(ResourcePhase::Succeeded) => {
                        (TestRunStatus::Success, format!("test {} passed", name))
                    }
                    WaitOutcome::Reached(ResourcePhase::Failed) => {
                        (TestRunStatus::Failure, format!("test {} failed", name))
                    }
                    WaitOutcome::Reached(phase) => (
                        TestRunStatus::Unknown,
                        format!("test {} ended in phase {}", name, phase),
                    ),
                    WaitOutcome::TimedOut { last_error, .. } => {
                        let mut info =
                            format!("test {} did not complete within {:?}", name, timeout);
                        if let Some(err) = last_error {
                            info.push_str(&format!(": {}", err));
                        }
                        (TestRunStatus::Unknown, info)
                    }
                }
            }
        };

        notify(events, name, status, info.clone()).await;
        TestRun {
            name: name.to_string(),
            status,
            info,
            started_at,
            completed_at: Some(Utc::now()),
        }
    }
}

async fn notify(
    events: &mpsc::Sender<TestRunEvent>,
    name: &str,
    status: TestRunStatus,
    message: String,
) {
    let event = TestRunEvent {
        name: name.to_string(),
        status,
        message,
    };
    if events.send(event).await.is_err() {
        debug!("test event receiver dropped");
    }
}

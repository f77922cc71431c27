//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "05-coordinator"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Concurrent scenario dispatch and run-level reporting."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! Scenarios run as independent tasks bounded by a semaphore. A failing
//! scenario never stops its siblings, and every scenario yields exactly one
//! outcome in the report, in the order it was submitted.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ConfigValidationError;
use crate::identity::{self, Identity};
use crate::lifecycle::{ErrorKind, LifecycleOrchestrator, ScenarioOutcome};
use crate::scenario::ScenarioDefinition;

type BuildFn = dyn Fn(&Identity) -> Result<ScenarioDefinition, ConfigValidationError> + Send + Sync;

/// Scenario recipe: allocates a fresh identity per run and builds the
/// definition around it.
#[derive(Clone)]
pub struct ScenarioTemplate {
    name: String,
    prefix: String,
    build: Arc<BuildFn>,
}

impl ScenarioTemplate {
    pub fn new<F>(name: impl Into<String>, prefix: impl Into<String>, build: F) -> Self
    where
        F: Fn(&Identity) -> Result<ScenarioDefinition, ConfigValidationError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            build: Arc::new(build),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Allocate an identity and build the definition.
    pub fn instantiate(&self) -> Result<ScenarioDefinition, ScenarioOutcome> {
        let identity = identity::allocate(&self.prefix).map_err(|err| {
            ScenarioOutcome::rejected(&self.name, None, ErrorKind::Identity, err.to_string())
        })?;
        (self.build)(&identity).map_err(|err| {
            ScenarioOutcome::rejected(
                &self.name,
                Some(identity.as_str()),
                ErrorKind::Config,
                err.to_string(),
            )
        })
    }
}

impl fmt::Debug for ScenarioTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioTemplate")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

enum Job {
    Template(ScenarioTemplate),
    Definition(ScenarioDefinition),
}

impl Job {
    fn name(&self) -> &str {
        match self {
            Job::Template(template) => template.name(),
            Job::Definition(definition) => definition.name(),
        }
    }
}

/// Aggregate result of one harness invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scenarios: Vec<ScenarioOutcome>,
    pub passed: bool,
}

impl RunReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>, scenarios: Vec<ScenarioOutcome>) -> Self {
        let passed = !scenarios.is_empty() && scenarios.iter().all(ScenarioOutcome::passed);
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scenarios,
            passed,
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.scenarios.iter().filter(|outcome| !outcome.passed())
    }

    /// Scenarios whose cleanup did not complete.
    pub fn leaked(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.scenarios.iter().filter(|outcome| outcome.leaked)
    }

    pub fn outcome(&self, scenario: &str) -> Option<&ScenarioOutcome> {
        self.scenarios.iter().find(|outcome| outcome.scenario == scenario)
    }
}

/// Fans scenarios out over the orchestrator with bounded parallelism.
#[derive(Clone)]
pub struct TestRunCoordinator {
    orchestrator: Arc<LifecycleOrchestrator>,
    max_parallel: usize,
}

impl TestRunCoordinator {
    pub fn new(orchestrator: LifecycleOrchestrator, max_parallel: usize) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn orchestrator(&self) -> &LifecycleOrchestrator {
        &self.orchestrator
    }

    pub async fn run(&self, templates: Vec<ScenarioTemplate>) -> RunReport {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_with_cancel(templates, cancel_rx).await
    }

    /// Run pre-built definitions, skipping identity allocation.
    pub async fn run_definitions(&self, definitions: Vec<ScenarioDefinition>) -> RunReport {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.dispatch(definitions.into_iter().map(Job::Definition).collect(), cancel_rx)
            .await
    }

    /// Run templates; raising `cancel` moves every in-flight scenario to cleanup.
    pub async fn run_with_cancel(
        &self,
        templates: Vec<ScenarioTemplate>,
        cancel: watch::Receiver<bool>,
    ) -> RunReport {
        self.dispatch(templates.into_iter().map(Job::Template).collect(), cancel)
            .await
    }

    /// Run templates, cancelling on Ctrl-C so provisioned services still get destroyed.
    pub async fn run_until_interrupted(&self, templates: Vec<ScenarioTemplate>) -> RunReport {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let listener = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling scenarios and destroying resources");
                let _ = cancel_tx.send(true);
            }
        });
        let report = self.run_with_cancel(templates, cancel_rx).await;
        listener.abort();
        report
    }

    async fn dispatch(&self, jobs: Vec<Job>, cancel: watch::Receiver<bool>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = jobs.len();
        info!(
            %run_id,
            scenarios = total,
            max_parallel = self.max_parallel,
            "starting acceptance run"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let (tx, mut rx) = mpsc::channel::<(usize, ScenarioOutcome)>(total.max(1));
        let mut handles = Vec::with_capacity(total);
        let names: Vec<String> = jobs.iter().map(|job| job.name().to_owned()).collect();

        for (index, job) in jobs.into_iter().enumerate() {
            let orchestrator = Arc::clone(&self.orchestrator);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let definition = match job {
                    Job::Definition(definition) => Ok(definition),
                    Job::Template(template) => template.instantiate(),
                };
                let outcome = match definition {
                    Ok(definition) => orchestrator.run_with_cancel(definition, cancel).await,
                    Err(rejected) => rejected,
                };
                let _ = tx.send((index, outcome)).await;
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<ScenarioOutcome>> = vec![None; total];
        while let Some((index, outcome)) = rx.recv().await {
            slots[index] = Some(outcome);
        }
        for (index, handle) in handles.into_iter().enumerate() {
            if let Err(err) = handle.await {
                warn!(scenario = %names[index], error = %err, "scenario task ended abnormally");
                if slots[index].is_none() {
                    slots[index] = Some(ScenarioOutcome::abandoned(
                        &names[index],
                        format!("scenario task ended abnormally: {err}"),
                    ));
                }
            }
        }

        let scenarios = slots
            .into_iter()
            .zip(&names)
            .map(|(slot, name)| {
                slot.unwrap_or_else(|| {
                    ScenarioOutcome::abandoned(name, "scenario produced no outcome")
                })
            })
            .collect();
        let report = RunReport::new(run_id, started_at, scenarios);
        info!(
            %run_id,
            passed = report.passed,
            failed = report.failed().count(),
            leaked = report.leaked().count(),
            "acceptance run finished"
        );
        report
    }
}

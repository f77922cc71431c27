//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "05-lifecycle"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Apply, validate, destroy state machine with guaranteed cleanup."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! The orchestrator drives one scenario through `Pending → Applying →
//! Applied → Validating → Validated|Failed → Destroying → Destroyed`.
//!
//! Cleanup is owned by a [`CleanupGuard`] armed the moment a handle exists.
//! The normal path releases it explicitly; if the scenario future is dropped
//! or unwinds first, the guard's `Drop` spawns a best-effort destroy and marks
//! the scenario `AbandonedPartial` in the log.
//!
//! A timeout or cancellation during apply raises the apply's stop signal and
//! waits a bounded grace period for the backend to record what it created.
//! After cleanup the provider is asked whether the service still exists; a
//! service that survives is reported as a leak.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use apim_common::TimeoutConfig;
use apim_logging::{
    log_lifecycle_event, scenario_info, scenario_warn, LifecycleOutcome, LogContext,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{info_span, Instrument};

use crate::backend::{
    AppliedResource, ApplyRequest, ProvisionedResourceHandle, ProvisioningBackend, StopSignal,
};
use crate::error::{ApplyError, DestroyError, Violation};
use crate::outputs::{self, OutputSet};
use crate::scenario::ScenarioDefinition;
use crate::state::{read_with_retry, ReadPolicy, StateReader};

/// Position of a scenario in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Applying,
    Applied,
    Validating,
    Validated,
    Failed,
    Destroying,
    Destroyed,
    /// Configuration rejected; nothing was provisioned.
    Rejected,
    /// Interrupted between apply and destroy; needs out-of-band reconciliation.
    AbandonedPartial,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Applying => "applying",
            LifecycleState::Applied => "applied",
            LifecycleState::Validating => "validating",
            LifecycleState::Validated => "validated",
            LifecycleState::Failed => "failed",
            LifecycleState::Destroying => "destroying",
            LifecycleState::Destroyed => "destroyed",
            LifecycleState::Rejected => "rejected",
            LifecycleState::AbandonedPartial => "abandoned_partial",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a non-violation error attached to an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Identity,
    Config,
    Apply,
    Timeout,
    Cancelled,
    /// Cleanup failed; resources may have leaked.
    Destroy,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Final record of one scenario: terminal state plus every violation and
/// error encountered along the way.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: String,
    pub identity: Option<String>,
    pub state: LifecycleState,
    /// `Validated` or `Failed` once validation has run.
    pub verdict: Option<LifecycleState>,
    pub transitions: Vec<LifecycleState>,
    pub violations: Vec<Violation>,
    pub errors: Vec<ScenarioError>,
    pub leaked: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScenarioOutcome {
    fn begin(scenario: &str, identity: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            scenario: scenario.to_owned(),
            identity: identity.map(str::to_owned),
            state: LifecycleState::Pending,
            verdict: None,
            transitions: vec![LifecycleState::Pending],
            violations: Vec::new(),
            errors: Vec::new(),
            leaked: false,
            started_at: now,
            finished_at: now,
        }
    }

    /// Scenario that never reached provisioning.
    pub fn rejected(
        scenario: &str,
        identity: Option<&str>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let mut outcome = Self::begin(scenario, identity);
        outcome.error(kind, message);
        outcome.enter(LifecycleState::Rejected);
        outcome.finish()
    }

    /// Scenario whose task died without reporting back.
    pub fn abandoned(scenario: &str, message: impl Into<String>) -> Self {
        let mut outcome = Self::begin(scenario, None);
        outcome.error(ErrorKind::Abandoned, message);
        outcome.leaked = true;
        outcome.enter(LifecycleState::AbandonedPartial);
        outcome.finish()
    }

    /// Validated and cleanly destroyed with no errors.
    pub fn passed(&self) -> bool {
        self.state == LifecycleState::Destroyed
            && self.verdict == Some(LifecycleState::Validated)
            && self.errors.is_empty()
    }

    pub fn destroy_error(&self) -> Option<&ScenarioError> {
        self.errors.iter().find(|err| err.kind == ErrorKind::Destroy)
    }

    fn context(&self, state: LifecycleState) -> LogContext<'_> {
        LogContext {
            scenario: Some(&self.scenario),
            identity: self.identity.as_deref(),
            phase: Some(state.as_str()),
        }
    }

    fn enter(&mut self, state: LifecycleState) {
        self.state = state;
        self.transitions.push(state);
        scenario_info!(context = self.context(state), "entered {}", state);
    }

    fn error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        let message = message.into();
        scenario_warn!(context = self.context(self.state), "{:?}: {}", kind, message);
        self.errors.push(ScenarioError { kind, message });
    }

    fn leak(&mut self, err: &DestroyError) {
        log_lifecycle_event(
            Some(&self.context(LifecycleState::Destroying)),
            "scenario.leak",
            &err.to_string(),
            LifecycleOutcome::Leak,
        );
        self.leaked = true;
        self.errors.push(ScenarioError {
            kind: ErrorKind::Destroy,
            message: err.to_string(),
        });
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

/// Destroys its handle exactly once: explicitly via [`CleanupGuard::release`],
/// or best-effort from `Drop` when the owner never got that far.
pub struct CleanupGuard {
    backend: Arc<dyn ProvisioningBackend>,
    handle: Option<ProvisionedResourceHandle>,
    destroy_timeout: Duration,
    scenario: String,
}

impl CleanupGuard {
    pub fn arm(
        backend: Arc<dyn ProvisioningBackend>,
        handle: ProvisionedResourceHandle,
        destroy_timeout: Duration,
        scenario: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            handle: Some(handle),
            destroy_timeout,
            scenario: scenario.into(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&ProvisionedResourceHandle> {
        self.handle.as_ref()
    }

    /// Run destroy and disarm. The handle stays armed until destroy returns,
    /// so dropping this future mid-destroy still hands cleanup to `Drop`.
    pub async fn release(mut self) -> Result<(), DestroyError> {
        let Some(handle) = self.handle.clone() else {
            return Ok(());
        };
        let result = destroy_bounded(self.backend.as_ref(), &handle, self.destroy_timeout).await;
        self.handle = None;
        result
    }
}

impl fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("backend", &self.backend.name())
            .field("handle", &self.handle)
            .field("scenario", &self.scenario)
            .finish()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let context = LogContext::new()
            .with_scenario(&self.scenario)
            .with_identity(handle.identity())
            .with_phase(LifecycleState::AbandonedPartial.as_str());
        log_lifecycle_event(
            Some(&context),
            "scenario.abandoned",
            "scenario interrupted before cleanup; attempting best-effort destroy",
            LifecycleOutcome::Leak,
        );

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log_lifecycle_event(
                Some(&context),
                "scenario.leak",
                "no async runtime available for best-effort destroy",
                LifecycleOutcome::Leak,
            );
            return;
        };
        let backend = Arc::clone(&self.backend);
        let timeout = self.destroy_timeout;
        let scenario = self.scenario.clone();
        runtime.spawn(async move {
            let context = LogContext::new()
                .with_scenario(&scenario)
                .with_identity(handle.identity())
                .with_phase(LifecycleState::AbandonedPartial.as_str());
            match destroy_bounded(backend.as_ref(), &handle, timeout).await {
                Ok(()) => log_lifecycle_event(
                    Some(&context),
                    "scenario.abandoned_destroyed",
                    "best-effort destroy completed",
                    LifecycleOutcome::Success,
                ),
                Err(err) => log_lifecycle_event(
                    Some(&context),
                    "scenario.leak",
                    &err.to_string(),
                    LifecycleOutcome::Leak,
                ),
            }
        });
    }
}

async fn destroy_bounded(
    backend: &dyn ProvisioningBackend,
    handle: &ProvisionedResourceHandle,
    timeout: Duration,
) -> Result<(), DestroyError> {
    match tokio::time::timeout(timeout, backend.destroy(handle)).await {
        Ok(result) => result,
        Err(_) => Err(DestroyError::TimedOut {
            identity: handle.identity().to_owned(),
            timeout,
        }),
    }
}

enum Interrupt<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "validation panicked".to_owned())
}

/// Drives scenarios through their lifecycle against one backend and reader.
pub struct LifecycleOrchestrator {
    backend: Arc<dyn ProvisioningBackend>,
    reader: Arc<dyn StateReader>,
    read_policy: ReadPolicy,
    scenario_timeout: Duration,
    destroy_timeout: Duration,
    interrupt_grace: Duration,
}

/// Attempts at confirming removal when the provider answers with a
/// retryable error.
const CONFIRM_ATTEMPTS: u32 = 3;

impl LifecycleOrchestrator {
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        reader: Arc<dyn StateReader>,
        timeouts: &TimeoutConfig,
    ) -> Self {
        Self {
            backend,
            reader,
            read_policy: ReadPolicy::from_config(timeouts),
            scenario_timeout: timeouts.scenario,
            destroy_timeout: timeouts.destroy,
            interrupt_grace: timeouts.apply_interrupt_grace,
        }
    }

    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn with_scenario_timeout(mut self, timeout: Duration) -> Self {
        self.scenario_timeout = timeout;
        self
    }

    pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }

    /// How long an interrupted apply may take to wind down before it is killed.
    pub fn with_interrupt_grace(mut self, grace: Duration) -> Self {
        self.interrupt_grace = grace;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ProvisioningBackend> {
        &self.backend
    }

    /// Run one scenario with no external cancellation.
    pub async fn run(&self, definition: ScenarioDefinition) -> ScenarioOutcome {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_with_cancel(definition, cancel_rx).await
    }

    /// Run one scenario; raising `cancel` sends it straight to cleanup.
    pub async fn run_with_cancel(
        &self,
        definition: ScenarioDefinition,
        cancel: watch::Receiver<bool>,
    ) -> ScenarioOutcome {
        let span = info_span!(
            "scenario",
            scenario = %definition.name(),
            identity = %definition.identity(),
            backend = self.backend.name()
        );
        self.drive(definition, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        definition: ScenarioDefinition,
        cancel: watch::Receiver<bool>,
    ) -> ScenarioOutcome {
        let mut cancel = StopSignal::from(cancel);
        let mut outcome =
            ScenarioOutcome::begin(definition.name(), Some(definition.identity().as_str()));
        if cancel.is_raised() {
            outcome.error(ErrorKind::Cancelled, "run cancelled before the scenario started");
            outcome.enter(LifecycleState::Rejected);
            return outcome.finish();
        }

        let deadline = Instant::now() + self.scenario_timeout;
        let request = ApplyRequest::from_definition(&definition);

        outcome.enter(LifecycleState::Applying);
        let (stop_tx, stop) = StopSignal::channel();
        let mut apply = self.backend.apply(&request, stop);
        let applied = tokio::select! {
            result = &mut apply => Interrupt::Completed(result),
            _ = sleep_until(deadline) => Interrupt::TimedOut,
            _ = cancel.raised() => Interrupt::Cancelled,
        };
        let applied = match applied {
            Interrupt::Completed(Ok(applied)) => applied,
            Interrupt::Completed(Err(err)) => {
                outcome.error(ErrorKind::Apply, err.to_string());
                self.cleanup(&mut outcome, err.partial().cloned(), None).await;
                return outcome.finish();
            }
            Interrupt::TimedOut => {
                outcome.error(
                    ErrorKind::Timeout,
                    format!(
                        "apply exceeded the {:?} scenario deadline",
                        self.scenario_timeout
                    ),
                );
                self.abandon_apply(&mut outcome, apply, stop_tx, &request).await;
                return outcome.finish();
            }
            Interrupt::Cancelled => {
                outcome.error(ErrorKind::Cancelled, "run cancelled during apply");
                self.abandon_apply(&mut outcome, apply, stop_tx, &request).await;
                return outcome.finish();
            }
        };
        drop(apply);

        let guard = CleanupGuard::arm(
            Arc::clone(&self.backend),
            applied.handle.clone(),
            self.destroy_timeout,
            definition.name(),
        );
        outcome.enter(LifecycleState::Applied);
        outcome.enter(LifecycleState::Validating);

        let validation =
            AssertUnwindSafe(self.validate(&definition, &applied.outputs)).catch_unwind();
        let verdict = tokio::select! {
            result = validation => Interrupt::Completed(result),
            _ = sleep_until(deadline) => Interrupt::TimedOut,
            _ = cancel.raised() => Interrupt::Cancelled,
        };
        match verdict {
            Interrupt::Completed(Ok(violations)) => outcome.violations.extend(violations),
            Interrupt::Completed(Err(payload)) => {
                outcome.violations.push(Violation::ValidationFault {
                    message: panic_message(&*payload),
                });
            }
            Interrupt::TimedOut => outcome.error(
                ErrorKind::Timeout,
                format!(
                    "validation exceeded the {:?} scenario deadline",
                    self.scenario_timeout
                ),
            ),
            Interrupt::Cancelled => {
                outcome.error(ErrorKind::Cancelled, "run cancelled during validation")
            }
        }

        let verdict = if outcome.violations.is_empty() && outcome.errors.is_empty() {
            LifecycleState::Validated
        } else {
            LifecycleState::Failed
        };
        outcome.verdict = Some(verdict);
        outcome.enter(verdict);

        outcome.enter(LifecycleState::Destroying);
        match guard.release().await {
            Ok(()) => outcome.enter(LifecycleState::Destroyed),
            Err(err) => outcome.leak(&err),
        }
        outcome.finish()
    }

    /// Stop an interrupted apply, destroy whatever it left behind and confirm
    /// the service is gone. An apply still running after the grace period is
    /// dropped, which kills it; its state may then be incomplete.
    async fn abandon_apply(
        &self,
        outcome: &mut ScenarioOutcome,
        apply: BoxFuture<'_, Result<AppliedResource, ApplyError>>,
        stop: watch::Sender<bool>,
        request: &ApplyRequest,
    ) {
        let _ = stop.send(true);
        let context = outcome.context(LifecycleState::Applying);
        let handle = match tokio::time::timeout(self.interrupt_grace, apply).await {
            Ok(Ok(applied)) => {
                scenario_info!(context = context, "apply completed while stopping");
                Some(applied.handle)
            }
            Ok(Err(err)) => {
                scenario_info!(context = context, "apply stopped: {}", err);
                err.partial()
                    .cloned()
                    .or_else(|| self.backend.salvage(request))
            }
            Err(_) => {
                scenario_warn!(
                    context = context,
                    "apply still running after {:?}; killed",
                    self.interrupt_grace
                );
                self.backend.salvage(request)
            }
        };
        self.cleanup(outcome, handle, Some(request)).await;
    }

    /// Destroy `partial` if anything was created. With `verify`, also require
    /// the provider to confirm the service no longer exists.
    async fn cleanup(
        &self,
        outcome: &mut ScenarioOutcome,
        partial: Option<ProvisionedResourceHandle>,
        verify: Option<&ApplyRequest>,
    ) {
        outcome.enter(LifecycleState::Destroying);
        match partial {
            Some(handle) => {
                let guard = CleanupGuard::arm(
                    Arc::clone(&self.backend),
                    handle,
                    self.destroy_timeout,
                    outcome.scenario.clone(),
                );
                if let Err(err) = guard.release().await {
                    outcome.leak(&err);
                    return;
                }
            }
            None => scenario_info!(
                context = outcome.context(LifecycleState::Destroying),
                "no partial resources to clean up"
            ),
        }
        if let Some(request) = verify {
            if let Err(err) = self.confirm_removed(request).await {
                outcome.leak(&err);
                return;
            }
        }
        outcome.enter(LifecycleState::Destroyed);
    }

    async fn confirm_removed(&self, request: &ApplyRequest) -> Result<(), DestroyError> {
        let locator = request.locator();
        let identity = request.identity().as_str().to_owned();
        let unconfirmed = |detail: String| DestroyError::Unconfirmed {
            identity: identity.clone(),
            resource: locator.to_string(),
            detail,
        };
        let mut attempt = 1;
        loop {
            let describe = AssertUnwindSafe(self.reader.describe(locator)).catch_unwind();
            let err = match tokio::time::timeout(self.destroy_timeout, describe).await {
                Ok(Ok(Ok(None))) => return Ok(()),
                Ok(Ok(Ok(Some(_)))) => {
                    return Err(DestroyError::Residual {
                        identity: identity.clone(),
                        resource: locator.to_string(),
                    })
                }
                Ok(Ok(Err(err))) => err,
                Ok(Err(payload)) => return Err(unconfirmed(panic_message(&*payload))),
                Err(_) => {
                    return Err(unconfirmed(format!(
                        "no answer within {:?}",
                        self.destroy_timeout
                    )))
                }
            };
            if !err.is_retryable() || attempt >= CONFIRM_ATTEMPTS {
                return Err(unconfirmed(err.to_string()));
            }
            attempt += 1;
            tokio::time::sleep(self.read_policy.initial_backoff).await;
        }
    }

    async fn validate(
        &self,
        definition: &ScenarioDefinition,
        outputs: &OutputSet,
    ) -> Vec<Violation> {
        let mut violations = outputs::validate(outputs, definition.expected_outputs());
        if definition.expected_state().is_empty() {
            return violations;
        }
        let locator = definition.locator();
        match read_with_retry(self.reader.as_ref(), &locator, &self.read_policy).await {
            Ok(snapshot) => violations.extend(
                definition
                    .expected_state()
                    .iter()
                    .filter_map(|expectation| expectation.evaluate(&snapshot)),
            ),
            Err(err) => violations.push(err.into_violation()),
        }
        violations
    }
}

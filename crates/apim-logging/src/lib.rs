//! ---
//! apim_section: "03-logging"
//! apim_subsection: "module"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Structured lifecycle logging adapters."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber suitable for tests and tooling.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Structured logging context propagated by the scenario macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Scenario name used for reporting.
    pub scenario: Option<&'a str>,
    /// Unique identity allocated to the scenario.
    pub identity: Option<&'a str>,
    /// Lifecycle phase the event belongs to.
    pub phase: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a scenario name.
    pub fn with_scenario(mut self, scenario: &'a str) -> Self {
        self.scenario = Some(scenario);
        self
    }

    /// Attach the scenario identity.
    pub fn with_identity(mut self, identity: &'a str) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Attach a lifecycle phase.
    pub fn with_phase(mut self, phase: &'a str) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Outcome attached to lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The step completed successfully.
    Success,
    /// The step failed; cleanup still proceeds.
    Fault,
    /// Cleanup failed and live resources may remain.
    Leak,
}

impl LifecycleOutcome {
    /// Stable label used in the `outcome` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
            LifecycleOutcome::Leak => "leak",
        }
    }

    fn severity(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "normal",
            LifecycleOutcome::Fault => "degraded",
            LifecycleOutcome::Leak => "leak",
        }
    }
}

/// Emit a standardized lifecycle event.
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let ctx = context.cloned().unwrap_or_default();
    let scenario = ctx.scenario.unwrap_or("");
    let identity = ctx.identity.unwrap_or("");
    let phase = ctx.phase.unwrap_or("");
    // `tracing::event!` needs a constant level, hence the explicit dispatch.
    match outcome {
        LifecycleOutcome::Leak => tracing::error!(
            event = event,
            outcome = outcome.as_str(),
            severity = outcome.severity(),
            scenario = scenario,
            identity = identity,
            phase = phase,
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::warn!(
            event = event,
            outcome = outcome.as_str(),
            severity = outcome.severity(),
            scenario = scenario,
            identity = identity,
            phase = phase,
            message = %message
        ),
        LifecycleOutcome::Success => tracing::info!(
            event = event,
            outcome = outcome.as_str(),
            severity = outcome.severity(),
            scenario = scenario,
            identity = identity,
            phase = phase,
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_scenario("basic")
            .with_identity("apim-test-abc")
            .with_phase("applying");
        scenario_info!(context = ctx.clone(), "apply submitted");
        scenario_warn!("validation produced {} violations", 2);
        scenario_error!(context = ctx, "destroy failed: {}", "boom");
    }

    #[test]
    fn lifecycle_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_scenario("vnet");
        log_lifecycle_event(
            Some(&ctx),
            "scenario.destroyed",
            "resources removed",
            LifecycleOutcome::Success,
        );
        log_lifecycle_event(
            None,
            "scenario.leak",
            "destroy failed",
            LifecycleOutcome::Leak,
        );
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(LifecycleOutcome::Success.as_str(), "success");
        assert_eq!(LifecycleOutcome::Fault.as_str(), "fault");
        assert_eq!(LifecycleOutcome::Leak.as_str(), "leak");
        assert_eq!(LifecycleOutcome::Leak.severity(), "leak");
    }
}

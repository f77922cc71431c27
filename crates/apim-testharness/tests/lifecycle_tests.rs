//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "tests"
//! apim_type: "test"
//! apim_scope: "code"
//! apim_description: "Lifecycle guarantees exercised against the in-memory backend."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use apim_common::TimeoutConfig;
use apim_testharness::adapters::{
    ApplyFailure, FaultPlan, MemoryBackend, MemoryCloud, MemoryStateReader,
};
use apim_testharness::catalog::{self, CatalogSettings, PUBLISHER_EMAIL, PUBLISHER_NAME};
use apim_testharness::outputs::keys;
use apim_testharness::{
    allocate, ErrorKind, LifecycleOrchestrator, LifecycleState, ScenarioBuilder, ScenarioDefinition,
    TestRunCoordinator, VarMap, VarValue, Violation,
};
use tokio::sync::watch;

fn orchestrator(cloud: &Arc<MemoryCloud>) -> LifecycleOrchestrator {
    LifecycleOrchestrator::new(
        Arc::new(MemoryBackend::new(Arc::clone(cloud))),
        Arc::new(MemoryStateReader::new(Arc::clone(cloud))),
        &TimeoutConfig::default(),
    )
}

fn basic_definition(name: &str) -> ScenarioDefinition {
    let identity = allocate("apim-test-").expect("identity");
    ScenarioBuilder::new(name, &identity)
        .publisher(PUBLISHER_NAME, PUBLISHER_EMAIL)
        .sku("Developer_1")
        .build()
        .expect("definition")
}

fn overrides(key: &str, value: &str) -> VarMap {
    let mut map = VarMap::new();
    map.insert(key.to_owned(), VarValue::text(value));
    map
}

#[tokio::test]
async fn healthy_scenario_passes_and_destroys_once() {
    let cloud = MemoryCloud::new();
    let definition = basic_definition("basic");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud).run(definition).await;

    assert!(outcome.passed(), "{outcome:?}");
    assert_eq!(
        outcome.transitions,
        vec![
            LifecycleState::Pending,
            LifecycleState::Applying,
            LifecycleState::Applied,
            LifecycleState::Validating,
            LifecycleState::Validated,
            LifecycleState::Destroying,
            LifecycleState::Destroyed,
        ]
    );
    assert_eq!(cloud.destroy_calls(&identity), 1);
    assert!(cloud.live_services().is_empty());
}

#[tokio::test]
async fn every_violation_is_reported_and_destroy_still_runs_once() {
    let cloud = MemoryCloud::new();
    let mut output_overrides = overrides(keys::GATEWAY_URL, "http://insecure.azure-api.net");
    output_overrides.insert(keys::PUBLISHER_NAME.to_owned(), VarValue::text("Someone Else"));
    cloud.inject(
        "broken-outputs",
        FaultPlan {
            output_overrides,
            output_removals: vec![keys::PORTAL_URL.to_owned()],
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("broken-outputs");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud).run(definition).await;

    assert_eq!(outcome.verdict, Some(LifecycleState::Failed));
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert_eq!(outcome.violations.len(), 3, "{:?}", outcome.violations);
    assert!(outcome
        .violations
        .contains(&Violation::MissingOutput { key: keys::PORTAL_URL.to_owned() }));
    let subjects: HashSet<_> = outcome.violations.iter().filter_map(Violation::subject).collect();
    assert!(subjects.contains(keys::GATEWAY_URL));
    assert!(subjects.contains(keys::PUBLISHER_NAME));
    assert_eq!(cloud.destroy_calls(&identity), 1);
}

#[tokio::test]
async fn gateway_scheme_decides_the_verdict() {
    let cloud = MemoryCloud::new();
    let passing = orchestrator(&cloud).run(basic_definition("https-gateway")).await;
    assert!(passing.passed());

    cloud.inject(
        "http-gateway",
        FaultPlan {
            output_overrides: overrides(keys::GATEWAY_URL, "http://apim.azure-api.net"),
            ..FaultPlan::default()
        },
    );
    let failing = orchestrator(&cloud).run(basic_definition("http-gateway")).await;
    assert_eq!(failing.violations.len(), 1);
    assert!(matches!(
        &failing.violations[0],
        Violation::ShapeMismatch { key, .. } if key == keys::GATEWAY_URL
    ));
}

#[tokio::test]
async fn partial_apply_is_destroyed_without_validation() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "half-built",
        FaultPlan {
            apply_failure: Some(ApplyFailure::AfterCreate),
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("half-built");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud).run(definition).await;

    assert_eq!(outcome.errors[0].kind, ErrorKind::Apply);
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert!(!outcome.transitions.contains(&LifecycleState::Validating));
    assert_eq!(cloud.describe_calls(), 0);
    assert_eq!(cloud.destroy_calls(&identity), 1);
    assert!(cloud.live_services().is_empty());
}

#[tokio::test]
async fn apply_failure_before_create_has_nothing_to_destroy() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "never-built",
        FaultPlan {
            apply_failure: Some(ApplyFailure::BeforeCreate),
            ..FaultPlan::default()
        },
    );
    let outcome = orchestrator(&cloud).run(basic_definition("never-built")).await;
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert_eq!(cloud.total_destroy_calls(), 0);
    assert!(!outcome.passed());
}

#[tokio::test]
async fn validation_panic_becomes_fault_and_still_destroys() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "panicky",
        FaultPlan {
            panic_on_describe: true,
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("panicky");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud).run(definition).await;

    assert!(outcome.violations.iter().any(|v| matches!(
        v,
        Violation::ValidationFault { message } if message.contains("injected panic")
    )));
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert_eq!(cloud.destroy_calls(&identity), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_deadline_during_validation_still_destroys() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "slow-read",
        FaultPlan {
            hidden_reads: u32::MAX,
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("slow-read");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud)
        .with_scenario_timeout(Duration::from_secs(60))
        .run(definition)
        .await;

    assert!(outcome.errors.iter().any(|err| err.kind == ErrorKind::Timeout));
    assert_eq!(outcome.verdict, Some(LifecycleState::Failed));
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert_eq!(cloud.destroy_calls(&identity), 1);
}

#[tokio::test(start_paused = true)]
async fn resource_that_never_appears_is_a_read_timeout() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "invisible",
        FaultPlan {
            hidden_reads: u32::MAX,
            ..FaultPlan::default()
        },
    );
    let outcome = orchestrator(&cloud).run(basic_definition("invisible")).await;
    assert!(matches!(outcome.violations.as_slice(), [Violation::ReadTimeout { .. }]));
    assert_eq!(outcome.state, LifecycleState::Destroyed);
}

#[tokio::test(start_paused = true)]
async fn eventual_consistency_is_absorbed_by_retries() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "lagging",
        FaultPlan {
            hidden_reads: 2,
            transient_read_errors: 2,
            ..FaultPlan::default()
        },
    );
    let outcome = orchestrator(&cloud).run(basic_definition("lagging")).await;
    assert!(outcome.passed(), "{outcome:?}");
    assert_eq!(cloud.describe_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn timeout_before_create_has_nothing_to_destroy() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "slow-start",
        FaultPlan {
            apply_delay: Duration::from_secs(600),
            ..FaultPlan::default()
        },
    );

    let outcome = orchestrator(&cloud)
        .with_scenario_timeout(Duration::from_secs(60))
        .run(basic_definition("slow-start"))
        .await;

    assert_eq!(outcome.errors.len(), 1, "{:?}", outcome.errors);
    assert_eq!(outcome.errors[0].kind, ErrorKind::Timeout);
    assert!(!outcome.transitions.contains(&LifecycleState::Validating));
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert!(!outcome.leaked);
    assert_eq!(cloud.total_destroy_calls(), 0);
    assert_eq!(cloud.describe_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_after_create_destroys_the_service() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "slow-finish",
        FaultPlan {
            settle_delay: Duration::from_secs(600),
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("slow-finish");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud)
        .with_scenario_timeout(Duration::from_secs(60))
        .run(definition)
        .await;

    assert!(outcome.errors.iter().any(|err| err.kind == ErrorKind::Timeout));
    assert!(!outcome.transitions.contains(&LifecycleState::Validating));
    assert_eq!(outcome.verdict, None);
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert!(!outcome.leaked);
    assert_eq!(cloud.destroy_calls(&identity), 1);
    assert!(cloud.live_services().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_apply_destroys_what_was_created() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "cancelled-apply",
        FaultPlan {
            settle_delay: Duration::from_secs(600),
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("cancelled-apply");
    let identity = definition.identity().as_str().to_owned();
    let orchestrator = orchestrator(&cloud);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let (outcome, _) = tokio::join!(orchestrator.run_with_cancel(definition, cancel_rx), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel_tx.send(true).expect("scenario listening");
    });

    assert!(outcome.errors.iter().any(|err| err.kind == ErrorKind::Cancelled));
    assert!(!outcome.transitions.contains(&LifecycleState::Validating));
    assert_eq!(outcome.state, LifecycleState::Destroyed);
    assert_eq!(cloud.destroy_calls(&identity), 1);
    assert!(cloud.live_services().is_empty());
}

#[tokio::test(start_paused = true)]
async fn killed_apply_with_surviving_service_is_a_leak() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "stubborn",
        FaultPlan {
            settle_delay: Duration::from_secs(3600),
            ignore_stop: true,
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("stubborn");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud)
        .with_scenario_timeout(Duration::from_secs(60))
        .with_interrupt_grace(Duration::from_secs(30))
        .run(definition)
        .await;

    assert!(outcome.errors.iter().any(|err| err.kind == ErrorKind::Timeout));
    assert!(outcome.leaked);
    assert_eq!(outcome.state, LifecycleState::Destroying);
    let destroy = outcome.destroy_error().expect("leak reported");
    assert!(destroy.message.contains("still exists"), "{}", destroy.message);
    assert_eq!(cloud.destroy_calls(&identity), 1);
    assert_eq!(cloud.live_services(), vec![identity]);
}

#[tokio::test]
async fn destroy_failure_is_reported_as_leak_alongside_violations() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        "sticky",
        FaultPlan {
            fail_destroy: true,
            output_overrides: overrides(keys::PUBLISHER_NAME, "Wrong Publisher"),
            ..FaultPlan::default()
        },
    );
    let definition = basic_definition("sticky");
    let identity = definition.identity().as_str().to_owned();

    let outcome = orchestrator(&cloud).run(definition).await;

    assert!(outcome.leaked);
    assert!(outcome.destroy_error().is_some());
    assert_eq!(outcome.violations.len(), 1);
    assert_eq!(outcome.state, LifecycleState::Destroying);
    assert_eq!(cloud.live_services(), vec![identity.clone()]);
    assert_eq!(cloud.destroy_calls(&identity), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_moves_in_flight_scenarios_to_cleanup() {
    let cloud = MemoryCloud::new();
    cloud.inject_all(FaultPlan {
        hidden_reads: u32::MAX,
        ..FaultPlan::default()
    });
    let coordinator = TestRunCoordinator::new(orchestrator(&cloud), 4);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let templates = catalog::all(&CatalogSettings::default());

    let (report, _) = tokio::join!(coordinator.run_with_cancel(templates, cancel_rx), async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel_tx.send(true).expect("receivers alive");
    });

    assert_eq!(report.scenarios.len(), 3);
    assert!(!report.passed);
    for outcome in &report.scenarios {
        assert!(outcome.errors.iter().any(|err| err.kind == ErrorKind::Cancelled));
        assert_eq!(outcome.state, LifecycleState::Destroyed);
    }
    assert_eq!(cloud.total_destroy_calls(), 3);
    assert!(cloud.live_services().is_empty());
}

#[tokio::test]
async fn one_failing_scenario_does_not_stop_the_others() {
    let cloud = MemoryCloud::new();
    cloud.inject(
        catalog::FULL,
        FaultPlan {
            apply_failure: Some(ApplyFailure::AfterCreate),
            ..FaultPlan::default()
        },
    );
    let coordinator = TestRunCoordinator::new(orchestrator(&cloud), 1);

    let report = coordinator.run(catalog::all(&CatalogSettings::default())).await;

    assert!(!report.passed);
    assert!(report.outcome(catalog::BASIC).expect("basic").passed());
    assert!(report.outcome(catalog::VNET).expect("vnet").passed());
    assert_eq!(report.failed().count(), 1);
    assert_eq!(cloud.apply_calls(), 3);
    assert!(cloud.live_services().is_empty());
}

#[tokio::test]
async fn concurrent_identities_never_collide() {
    let handles: Vec<_> = (0..1000)
        .map(|_| tokio::spawn(async { allocate("apim-test-").expect("identity").to_string() }))
        .collect();
    let mut seen = HashSet::new();
    for handle in handles {
        assert!(seen.insert(handle.await.expect("task")));
    }
    assert_eq!(seen.len(), 1000);
}

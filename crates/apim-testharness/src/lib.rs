//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "module"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Acceptance harness for the API Management Terraform module."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! Provisions real (or emulated) API Management services from scenario
//! definitions, checks the module's outputs and the live resource state, and
//! always destroys what it created. [`TestRunCoordinator`] fans scenarios out
//! concurrently; [`LifecycleOrchestrator`] drives a single scenario through
//! apply, validation and destroy.

pub mod adapters;
pub mod backend;
pub mod catalog;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod outputs;
pub mod scenario;
pub mod state;
pub mod value;

pub use backend::{
    AppliedResource, ApplyRequest, ProvisionedResourceHandle, ProvisioningBackend, StopSignal,
};
pub use coordinator::{RunReport, ScenarioTemplate, TestRunCoordinator};
pub use error::{
    ApplyError, ConfigValidationError, DestroyError, IdentityError, ProviderError, Violation,
};
pub use identity::{allocate, Identity};
pub use lifecycle::{
    CleanupGuard, ErrorKind, LifecycleOrchestrator, LifecycleState, ScenarioError, ScenarioOutcome,
};
pub use outputs::{OutputConstraint, OutputExpectation, OutputSet};
pub use scenario::{
    ApiSpec, NamedValueSpec, OperationSpec, ProductSpec, ScenarioBuilder, ScenarioDefinition,
};
pub use state::{
    read_with_retry, ReadPolicy, ResourceLocator, ResourceSnapshot, SnapshotField, StateCheck,
    StateExpectation, StateReader,
};
pub use value::{Scalar, VarMap, VarValue};

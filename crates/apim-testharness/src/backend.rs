//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "04-provisioning"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Provisioning backend seam: apply, destroy and salvage."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{ApplyError, DestroyError};
use crate::identity::Identity;
use crate::outputs::OutputSet;
use crate::scenario::ScenarioDefinition;
use crate::state::ResourceLocator;
use crate::value::VarMap;

/// Everything a backend needs to provision one scenario.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    scenario: String,
    identity: Identity,
    locator: ResourceLocator,
    variables: VarMap,
}

impl ApplyRequest {
    pub fn from_definition(definition: &ScenarioDefinition) -> Self {
        Self {
            scenario: definition.name().to_owned(),
            identity: definition.identity().clone(),
            locator: definition.locator(),
            variables: definition.variables().clone(),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    pub fn variables(&self) -> &VarMap {
        &self.variables
    }

    /// Handle describing what this request provisions at `workspace`.
    pub fn handle(&self, workspace: Option<PathBuf>) -> ProvisionedResourceHandle {
        ProvisionedResourceHandle {
            identity: self.identity.as_str().to_owned(),
            resource_name: self.locator.name.clone(),
            resource_group: self.locator.resource_group.clone(),
            workspace,
        }
    }
}

/// Opaque reference to provisioned resources, consumed by destroy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedResourceHandle {
    identity: String,
    resource_name: String,
    resource_group: String,
    workspace: Option<PathBuf>,
}

impl ProvisionedResourceHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    /// Working copy holding the backend's state, when it keeps one on disk.
    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }
}

/// Result of a successful apply.
#[derive(Debug, Clone)]
pub struct AppliedResource {
    pub outputs: OutputSet,
    pub handle: ProvisionedResourceHandle,
}

/// Request to wind an in-flight operation down gracefully. Once raised it
/// stays raised.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal nobody can raise.
    pub fn never() -> Self {
        Self::channel().1
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal is raised. Never resolves when the sender is
    /// gone without raising it.
    pub async fn raised(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl From<watch::Receiver<bool>> for StopSignal {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }
}

/// External system turning scenario variables into live resources.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Provision `request`. When `stop` is raised the backend should stop
    /// creating resources, record what already exists, and return.
    async fn apply(
        &self,
        request: &ApplyRequest,
        stop: StopSignal,
    ) -> Result<AppliedResource, ApplyError>;

    async fn destroy(&self, handle: &ProvisionedResourceHandle) -> Result<(), DestroyError>;

    /// Recover a handle for `request` after an apply was interrupted before
    /// reporting back. `None` when nothing can have been created.
    fn salvage(&self, request: &ApplyRequest) -> Option<ProvisionedResourceHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_signal_resolves_once_raised() {
        let (tx, mut stop) = StopSignal::channel();
        assert!(!stop.is_raised());
        tx.send(true).expect("receiver alive");
        tokio::time::timeout(Duration::from_secs(1), stop.raised())
            .await
            .expect("raised");
        assert!(stop.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn unraisable_signal_never_resolves() {
        let mut stop = StopSignal::never();
        let waited = tokio::time::timeout(Duration::from_secs(3600), stop.raised()).await;
        assert!(waited.is_err());
    }
}

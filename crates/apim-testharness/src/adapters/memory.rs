//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "06-adapters"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "In-process module and provider emulation with fault injection."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! [`MemoryCloud`] plays both external collaborators: it provisions services
//! from scenario variables the way the module would, and answers describe
//! calls the way the management API would. Faults are planned per scenario
//! name so a single run can mix healthy and failing scenarios.
//!
//! Like a Terraform state file, a service is only known to destroy once the
//! apply that created it has returned. An apply dropped mid-flight leaves an
//! untracked service that destroy cannot see.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{
    AppliedResource, ApplyRequest, ProvisionedResourceHandle, ProvisioningBackend, StopSignal,
};
use crate::error::{ApplyError, DestroyError, ProviderError};
use crate::outputs::{keys, OutputSet, SERVICE_RESOURCE_TYPE};
use crate::scenario::vars;
use crate::state::{ResourceLocator, ResourceSnapshot, StateReader};
use crate::value::{VarMap, VarValue};

const SUBSCRIPTION_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Where an injected apply failure strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFailure {
    /// Fails before anything exists; no partial handle.
    BeforeCreate,
    /// Fails after the service exists; returns a partial handle.
    AfterCreate,
}

/// Faults applied to scenarios matching a name (or to every scenario).
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    pub apply_failure: Option<ApplyFailure>,
    pub fail_destroy: bool,
    /// Pause before the service is created.
    pub apply_delay: Duration,
    /// Pause after the service is created, before apply returns.
    pub settle_delay: Duration,
    /// Keep applying through a stop request instead of winding down.
    pub ignore_stop: bool,
    /// Describe calls answering "not found" before the service shows up.
    pub hidden_reads: u32,
    /// Describe calls failing with a retryable error before succeeding.
    pub transient_read_errors: u32,
    pub output_overrides: VarMap,
    pub output_removals: Vec<String>,
    pub panic_on_describe: bool,
}

#[derive(Debug, Clone)]
struct MemoryService {
    scenario: String,
    snapshot: ResourceSnapshot,
    /// Recorded by a returning apply; destroy only removes tracked services.
    tracked: bool,
    hidden_reads: u32,
    transient_read_errors: u32,
}

#[derive(Debug, Default)]
struct CloudState {
    services: IndexMap<String, MemoryService>,
    faults: HashMap<String, FaultPlan>,
    default_faults: FaultPlan,
    apply_calls: usize,
    describe_calls: usize,
    destroy_calls: HashMap<String, usize>,
    next_address: u8,
}

impl CloudState {
    fn faults_for(&self, scenario: &str) -> FaultPlan {
        self.faults
            .get(scenario)
            .cloned()
            .unwrap_or_else(|| self.default_faults.clone())
    }
}

/// Shared in-memory stand-in for the module and the provider.
#[derive(Debug, Default)]
pub struct MemoryCloud {
    state: Mutex<CloudState>,
}

impl MemoryCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Plan faults for scenarios named `scenario`.
    pub fn inject(&self, scenario: &str, faults: FaultPlan) {
        self.state.lock().faults.insert(scenario.to_owned(), faults);
    }

    /// Plan faults for every scenario without a specific plan.
    pub fn inject_all(&self, faults: FaultPlan) {
        self.state.lock().default_faults = faults;
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().apply_calls
    }

    pub fn describe_calls(&self) -> usize {
        self.state.lock().describe_calls
    }

    pub fn destroy_calls(&self, identity: &str) -> usize {
        self.state
            .lock()
            .destroy_calls
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_destroy_calls(&self) -> usize {
        self.state.lock().destroy_calls.values().sum()
    }

    /// Identities of services that currently exist.
    pub fn live_services(&self) -> Vec<String> {
        self.state.lock().services.keys().cloned().collect()
    }

    pub fn snapshot(&self, identity: &str) -> Option<ResourceSnapshot> {
        self.state
            .lock()
            .services
            .get(identity)
            .map(|service| service.snapshot.clone())
    }

    fn create(&self, request: &ApplyRequest, faults: &FaultPlan) -> ResourceSnapshot {
        let mut state = self.state.lock();
        state.next_address = state.next_address.wrapping_add(1);
        let snapshot = snapshot_from(request, state.next_address);
        state.services.insert(
            request.identity().as_str().to_owned(),
            MemoryService {
                scenario: request.scenario().to_owned(),
                snapshot: snapshot.clone(),
                tracked: false,
                hidden_reads: faults.hidden_reads,
                transient_read_errors: faults.transient_read_errors,
            },
        );
        snapshot
    }

    fn track(&self, identity: &str) {
        if let Some(service) = self.state.lock().services.get_mut(identity) {
            service.tracked = true;
        }
    }
}

/// Sleep for `delay`; `true` when cut short by `stop`.
async fn pause(delay: Duration, stop: &mut StopSignal, ignore_stop: bool) -> bool {
    if delay.is_zero() {
        return false;
    }
    if ignore_stop {
        tokio::time::sleep(delay).await;
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.raised() => true,
    }
}

fn text<'a>(variables: &'a VarMap, key: &str) -> &'a str {
    variables
        .get(key)
        .and_then(VarValue::as_text)
        .unwrap_or_default()
}

fn mapping_keys(variables: &VarMap, key: &str) -> Vec<String> {
    variables
        .get(key)
        .and_then(VarValue::as_mapping)
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

fn snapshot_from(request: &ApplyRequest, address: u8) -> ResourceSnapshot {
    let variables = request.variables();
    let name = text(variables, vars::API_MANAGEMENT_NAME).to_owned();
    let network = Some(text(variables, vars::VIRTUAL_NETWORK_TYPE))
        .filter(|mode| !mode.is_empty() && *mode != "None")
        .map(str::to_owned);
    let (public_ip_addresses, private_ip_addresses) = match network.as_deref() {
        Some("External") => (
            vec![format!("20.62.0.{address}")],
            vec![format!("10.0.1.{address}")],
        ),
        Some(_) => (Vec::new(), vec![format!("10.0.1.{address}")]),
        None => (Vec::new(), Vec::new()),
    };
    let api_ids = variables
        .get(vars::APIS)
        .and_then(VarValue::as_mapping)
        .map(|apis| {
            apis.iter()
                .map(|(id, api)| {
                    api.get("name")
                        .and_then(VarValue::as_text)
                        .unwrap_or(id.as_str())
                        .to_owned()
                })
                .collect()
        })
        .unwrap_or_default();

    ResourceSnapshot {
        gateway_url: format!("https://{name}.azure-api.net"),
        portal_url: format!("https://{name}.developer.azure-api.net"),
        resource_group: text(variables, vars::RESOURCE_GROUP_NAME).to_owned(),
        location: text(variables, vars::LOCATION).to_owned(),
        sku_name: text(variables, vars::SKU_NAME).to_owned(),
        publisher_name: text(variables, vars::PUBLISHER_NAME).to_owned(),
        publisher_email: text(variables, vars::PUBLISHER_EMAIL).to_owned(),
        virtual_network_type: network,
        public_ip_addresses,
        private_ip_addresses,
        product_ids: mapping_keys(variables, vars::PRODUCTS),
        api_ids,
        named_value_ids: mapping_keys(variables, vars::NAMED_VALUES),
        name,
    }
}

/// Outputs the module exports for `snapshot`, keyed the way the module's
/// `outputs.tf` names them.
fn outputs_from(
    request: &ApplyRequest,
    snapshot: &ResourceSnapshot,
    faults: &FaultPlan,
) -> OutputSet {
    let service_id = format!(
        "/subscriptions/{SUBSCRIPTION_ID}/resourceGroups/{}/providers/{SERVICE_RESOURCE_TYPE}/{}",
        snapshot.resource_group, snapshot.name
    );
    let mut values = VarMap::new();
    values.insert(keys::API_MANAGEMENT_ID.into(), VarValue::text(&service_id));
    values.insert(keys::API_MANAGEMENT_NAME.into(), VarValue::text(&snapshot.name));
    values.insert(keys::GATEWAY_URL.into(), VarValue::text(&snapshot.gateway_url));
    values.insert(keys::PORTAL_URL.into(), VarValue::text(&snapshot.portal_url));
    values.insert(keys::RESOURCE_GROUP_NAME.into(), VarValue::text(&snapshot.resource_group));
    values.insert(keys::LOCATION.into(), VarValue::text(&snapshot.location));
    values.insert(keys::PUBLISHER_NAME.into(), VarValue::text(&snapshot.publisher_name));
    values.insert(
        keys::PRODUCT_IDS.into(),
        VarValue::mapping(
            snapshot
                .product_ids
                .iter()
                .map(|id| (id.clone(), format!("{service_id}/products/{id}"))),
        ),
    );
    let api_keys = mapping_keys(request.variables(), vars::APIS);
    values.insert(
        keys::API_IDS.into(),
        VarValue::mapping(
            api_keys
                .iter()
                .zip(&snapshot.api_ids)
                .map(|(id, name)| (id.clone(), format!("{service_id}/apis/{name}"))),
        ),
    );
    values.insert(
        keys::NAMED_VALUE_IDS.into(),
        VarValue::mapping(
            snapshot
                .named_value_ids
                .iter()
                .map(|id| (id.clone(), format!("{service_id}/namedValues/{id}"))),
        ),
    );
    values.insert(
        "public_ip_addresses".into(),
        VarValue::list(snapshot.public_ip_addresses.clone()),
    );
    values.insert(
        "private_ip_addresses".into(),
        VarValue::list(snapshot.private_ip_addresses.clone()),
    );

    for (key, value) in &faults.output_overrides {
        values.insert(key.clone(), value.clone());
    }
    for key in &faults.output_removals {
        values.shift_remove(key);
    }
    OutputSet::new(values)
}

/// Provisioning backend over a [`MemoryCloud`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    cloud: Arc<MemoryCloud>,
}

impl MemoryBackend {
    pub fn new(cloud: Arc<MemoryCloud>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl ProvisioningBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply(
        &self,
        request: &ApplyRequest,
        mut stop: StopSignal,
    ) -> Result<AppliedResource, ApplyError> {
        let faults = {
            let mut state = self.cloud.state.lock();
            state.apply_calls += 1;
            state.faults_for(request.scenario())
        };
        let identity = request.identity().as_str().to_owned();
        if pause(faults.apply_delay, &mut stop, faults.ignore_stop).await {
            return Err(ApplyError::Provisioning {
                identity,
                message: "stopped before any resource was created".into(),
                partial: None,
            });
        }

        if faults.apply_failure == Some(ApplyFailure::BeforeCreate) {
            return Err(ApplyError::Provisioning {
                identity,
                message: "injected failure before any resource was created".into(),
                partial: None,
            });
        }

        let snapshot = self.cloud.create(request, &faults);
        let handle = request.handle(None);
        if pause(faults.settle_delay, &mut stop, faults.ignore_stop).await {
            self.cloud.track(&identity);
            return Err(ApplyError::Provisioning {
                identity,
                message: "stopped after the service was created".into(),
                partial: Some(handle),
            });
        }
        self.cloud.track(&identity);
        if faults.apply_failure == Some(ApplyFailure::AfterCreate) {
            return Err(ApplyError::Provisioning {
                identity,
                message: "injected failure after the service was created".into(),
                partial: Some(handle),
            });
        }

        debug!(identity = %identity, "memory apply complete");
        Ok(AppliedResource {
            outputs: outputs_from(request, &snapshot, &faults),
            handle,
        })
    }

    async fn destroy(&self, handle: &ProvisionedResourceHandle) -> Result<(), DestroyError> {
        let mut state = self.cloud.state.lock();
        *state
            .destroy_calls
            .entry(handle.identity().to_owned())
            .or_default() += 1;
        let (scenario, tracked) = state
            .services
            .get(handle.identity())
            .map(|service| (service.scenario.clone(), service.tracked))
            .unwrap_or_default();
        if state.faults_for(&scenario).fail_destroy {
            return Err(DestroyError::Failed {
                identity: handle.identity().to_owned(),
                message: "injected destroy failure".into(),
            });
        }
        if tracked {
            state.services.shift_remove(handle.identity());
        } else {
            debug!(identity = %handle.identity(), "nothing recorded for this identity");
        }
        Ok(())
    }

    fn salvage(&self, request: &ApplyRequest) -> Option<ProvisionedResourceHandle> {
        self.cloud
            .state
            .lock()
            .services
            .contains_key(request.identity().as_str())
            .then(|| request.handle(None))
    }
}

/// Provider read API over a [`MemoryCloud`].
#[derive(Debug, Clone)]
pub struct MemoryStateReader {
    cloud: Arc<MemoryCloud>,
}

impl MemoryStateReader {
    pub fn new(cloud: Arc<MemoryCloud>) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl StateReader for MemoryStateReader {
    async fn describe(
        &self,
        locator: &ResourceLocator,
    ) -> Result<Option<ResourceSnapshot>, ProviderError> {
        let mut state = self.cloud.state.lock();
        state.describe_calls += 1;
        let Some(service) = state.services.values_mut().find(|service| {
            service.snapshot.name == locator.name
                && service.snapshot.resource_group == locator.resource_group
        }) else {
            return Ok(None);
        };
        if service.transient_read_errors > 0 {
            service.transient_read_errors -= 1;
            return Err(ProviderError::Transient("injected throttling".into()));
        }
        if service.hidden_reads > 0 {
            service.hidden_reads -= 1;
            return Ok(None);
        }
        let snapshot = service.snapshot.clone();
        let scenario = service.scenario.clone();
        let panic_on_describe = state.faults_for(&scenario).panic_on_describe;
        drop(state);
        if panic_on_describe {
            panic!("injected panic while describing {locator}");
        }
        Ok(Some(snapshot))
    }
}

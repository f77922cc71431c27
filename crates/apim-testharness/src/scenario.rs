//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "02-model"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Scenario definitions and the validating scenario builder."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! A [`ScenarioDefinition`] is immutable once built and owns private copies of
//! every nested structure, so concurrently running scenarios never share
//! mutable configuration.

use indexmap::IndexMap;

use crate::error::ConfigValidationError;
use crate::identity::Identity;
use crate::outputs::{self, keys, OutputExpectation};
use crate::state::{ResourceLocator, SnapshotField, StateExpectation};
use crate::value::{VarMap, VarValue};

/// Variable names understood by the module.
pub mod vars {
    pub const RESOURCE_GROUP_NAME: &str = "resource_group_name";
    pub const API_MANAGEMENT_NAME: &str = "api_management_name";
    pub const LOCATION: &str = "location";
    pub const ENVIRONMENT: &str = "environment";
    pub const PUBLISHER_NAME: &str = "publisher_name";
    pub const PUBLISHER_EMAIL: &str = "publisher_email";
    pub const SKU_NAME: &str = "sku_name";
    pub const VIRTUAL_NETWORK_TYPE: &str = "virtual_network_type";
    pub const PRODUCTS: &str = "products";
    pub const APIS: &str = "apis";
    pub const NAMED_VALUES: &str = "named_values";
    pub const TAGS: &str = "tags";
}

pub const DEFAULT_LOCATION: &str = "East US";
pub const DEFAULT_ENVIRONMENT: &str = "test";

const REQUIRED: [&str; 5] = [
    vars::RESOURCE_GROUP_NAME,
    vars::API_MANAGEMENT_NAME,
    vars::PUBLISHER_NAME,
    vars::PUBLISHER_EMAIL,
    vars::SKU_NAME,
];
const SKU_TIERS: [&str; 5] = ["Developer", "Basic", "Standard", "Premium", "Consumption"];
const NETWORK_MODES: [&str; 3] = ["None", "External", "Internal"];

/// Product published by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSpec {
    pub display_name: String,
    pub description: String,
    pub approval_required: bool,
    pub published: bool,
    pub subscription_required: bool,
    pub subscriptions_limit: Option<u32>,
}

impl ProductSpec {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            description: String::new(),
            approval_required: false,
            published: true,
            subscription_required: true,
            subscriptions_limit: None,
        }
    }

    fn into_value(self) -> VarValue {
        let mut map = VarMap::new();
        map.insert("display_name".into(), self.display_name.into());
        map.insert("description".into(), self.description.into());
        map.insert("approval_required".into(), self.approval_required.into());
        map.insert("published".into(), self.published.into());
        map.insert("subscription_required".into(), self.subscription_required.into());
        if let Some(limit) = self.subscriptions_limit {
            map.insert("subscriptions_limit".into(), limit.into());
        }
        VarValue::Mapping(map)
    }
}

/// Operation exposed by an API.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSpec {
    pub display_name: String,
    pub method: String,
    pub url_template: String,
    pub description: String,
}

impl OperationSpec {
    pub fn new(
        display_name: impl Into<String>,
        method: impl Into<String>,
        url_template: impl Into<String>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            method: method.into(),
            url_template: url_template.into(),
            description: String::new(),
        }
    }

    fn into_value(self) -> VarValue {
        VarValue::mapping([
            ("display_name", self.display_name),
            ("method", self.method),
            ("url_template", self.url_template),
            ("description", self.description),
        ])
    }
}

/// API hosted by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiSpec {
    /// Resource name of the API inside the service.
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub path: String,
    pub protocols: Vec<String>,
    pub service_url: Option<String>,
    pub operations: IndexMap<String, OperationSpec>,
}

impl ApiSpec {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            description: String::new(),
            path: path.into(),
            protocols: vec!["https".to_owned()],
            service_url: None,
            operations: IndexMap::new(),
        }
    }

    pub fn operation(mut self, id: impl Into<String>, operation: OperationSpec) -> Self {
        self.operations.insert(id.into(), operation);
        self
    }

    fn into_value(self) -> VarValue {
        let mut map = VarMap::new();
        map.insert("name".into(), self.name.into());
        map.insert("display_name".into(), self.display_name.into());
        map.insert("description".into(), self.description.into());
        map.insert("path".into(), self.path.into());
        map.insert("protocols".into(), VarValue::list(self.protocols));
        if let Some(url) = self.service_url {
            map.insert("service_url".into(), url.into());
        }
        map.insert(
            "operations".into(),
            VarValue::Mapping(
                self.operations
                    .into_iter()
                    .map(|(id, op)| (id, op.into_value()))
                    .collect(),
            ),
        );
        VarValue::Mapping(map)
    }
}

/// Named value (service-wide property).
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValueSpec {
    pub display_name: String,
    pub value: String,
    pub secret: bool,
}

impl NamedValueSpec {
    pub fn new(display_name: impl Into<String>, value: impl Into<String>, secret: bool) -> Self {
        Self {
            display_name: display_name.into(),
            value: value.into(),
            secret,
        }
    }

    fn into_value(self) -> VarValue {
        VarValue::mapping([
            ("display_name", VarValue::from(self.display_name)),
            ("value", VarValue::from(self.value)),
            ("secret", VarValue::from(self.secret)),
        ])
    }
}

/// One fully resolved apply/validate/destroy test case.
#[derive(Debug, Clone)]
pub struct ScenarioDefinition {
    name: String,
    identity: Identity,
    variables: VarMap,
    expected_outputs: Vec<OutputExpectation>,
    expected_state: Vec<StateExpectation>,
}

impl ScenarioDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn variables(&self) -> &VarMap {
        &self.variables
    }

    pub fn expected_outputs(&self) -> &[OutputExpectation] {
        &self.expected_outputs
    }

    pub fn expected_state(&self) -> &[StateExpectation] {
        &self.expected_state
    }

    /// Service name and resource group the scenario provisions.
    pub fn locator(&self) -> ResourceLocator {
        ResourceLocator::new(
            text_var(&self.variables, vars::API_MANAGEMENT_NAME),
            text_var(&self.variables, vars::RESOURCE_GROUP_NAME),
        )
    }
}

/// Builds a [`ScenarioDefinition`] around an allocated identity.
#[derive(Debug, Clone)]
pub struct ScenarioBuilder {
    name: String,
    identity: Identity,
    variables: VarMap,
    products: IndexMap<String, ProductSpec>,
    apis: IndexMap<String, ApiSpec>,
    named_values: IndexMap<String, NamedValueSpec>,
    tags: IndexMap<String, String>,
    expected_outputs: Vec<OutputExpectation>,
    expected_state: Vec<StateExpectation>,
}

impl ScenarioBuilder {
    /// Start a scenario whose service is named after `identity` and whose
    /// resource group is `rg-<identity>`.
    pub fn new(name: impl Into<String>, identity: &Identity) -> Self {
        let mut variables = VarMap::new();
        variables.insert(
            vars::RESOURCE_GROUP_NAME.into(),
            VarValue::text(format!("rg-{identity}")),
        );
        variables.insert(vars::LOCATION.into(), DEFAULT_LOCATION.into());
        variables.insert(vars::ENVIRONMENT.into(), DEFAULT_ENVIRONMENT.into());
        variables.insert(vars::API_MANAGEMENT_NAME.into(), identity.as_str().into());
        Self {
            name: name.into(),
            identity: identity.clone(),
            variables,
            products: IndexMap::new(),
            apis: IndexMap::new(),
            named_values: IndexMap::new(),
            tags: IndexMap::new(),
            expected_outputs: Vec::new(),
            expected_state: Vec::new(),
        }
    }

    pub fn location(self, location: impl Into<String>) -> Self {
        self.variable(vars::LOCATION, VarValue::text(location))
    }

    pub fn environment(self, environment: impl Into<String>) -> Self {
        self.variable(vars::ENVIRONMENT, VarValue::text(environment))
    }

    pub fn publisher(self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.variable(vars::PUBLISHER_NAME, VarValue::text(name))
            .variable(vars::PUBLISHER_EMAIL, VarValue::text(email))
    }

    pub fn sku(self, sku_name: impl Into<String>) -> Self {
        self.variable(vars::SKU_NAME, VarValue::text(sku_name))
    }

    pub fn virtual_network_type(self, mode: impl Into<String>) -> Self {
        self.variable(vars::VIRTUAL_NETWORK_TYPE, VarValue::text(mode))
    }

    /// Set any top-level variable, overriding earlier values.
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<VarValue>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn product(mut self, id: impl Into<String>, product: ProductSpec) -> Self {
        self.products.insert(id.into(), product);
        self
    }

    pub fn api(mut self, id: impl Into<String>, api: ApiSpec) -> Self {
        self.apis.insert(id.into(), api);
        self
    }

    pub fn named_value(mut self, id: impl Into<String>, named_value: NamedValueSpec) -> Self {
        self.named_values.insert(id.into(), named_value);
        self
    }

    pub fn expect_output(mut self, expectation: OutputExpectation) -> Self {
        self.expected_outputs.push(expectation);
        self
    }

    pub fn expect_state(mut self, expectation: StateExpectation) -> Self {
        self.expected_state.push(expectation);
        self
    }

    /// Validate inputs and produce the definition with the standard output
    /// and state contracts prepended to any caller expectations.
    pub fn build(self) -> Result<ScenarioDefinition, ConfigValidationError> {
        let problems = self.problems();
        if !problems.is_empty() {
            return Err(ConfigValidationError {
                scenario: self.name,
                problems,
            });
        }

        let publisher_name = text_var(&self.variables, vars::PUBLISHER_NAME).to_owned();
        let publisher_email = text_var(&self.variables, vars::PUBLISHER_EMAIL).to_owned();
        let sku_name = text_var(&self.variables, vars::SKU_NAME).to_owned();
        let service_name = text_var(&self.variables, vars::API_MANAGEMENT_NAME).to_owned();

        let mut expected_outputs = outputs::standard_contract(&publisher_name);
        let mut expected_state = vec![
            StateExpectation::equals(SnapshotField::Name, service_name),
            StateExpectation::equals(SnapshotField::SkuName, sku_name),
            StateExpectation::equals(SnapshotField::PublisherName, publisher_name),
            StateExpectation::equals(SnapshotField::PublisherEmail, publisher_email),
            StateExpectation::non_empty(SnapshotField::GatewayUrl),
            StateExpectation::non_empty(SnapshotField::PortalUrl),
        ];
        for id in self.products.keys() {
            expected_outputs
                .push(OutputExpectation::present(keys::PRODUCT_IDS).contains(id.as_str()));
            expected_state
                .push(StateExpectation::contains(SnapshotField::ProductIds, id.as_str()));
        }
        for (id, api) in &self.apis {
            expected_outputs
                .push(OutputExpectation::present(keys::API_IDS).contains(id.as_str()));
            expected_state
                .push(StateExpectation::contains(SnapshotField::ApiIds, api.name.as_str()));
        }
        for id in self.named_values.keys() {
            expected_state
                .push(StateExpectation::contains(SnapshotField::NamedValueIds, id.as_str()));
        }
        expected_outputs.extend(self.expected_outputs);
        expected_state.extend(self.expected_state);

        let mut variables = self.variables;
        if !self.products.is_empty() {
            variables.insert(
                vars::PRODUCTS.into(),
                VarValue::Mapping(
                    self.products
                        .into_iter()
                        .map(|(id, product)| (id, product.into_value()))
                        .collect(),
                ),
            );
        }
        if !self.apis.is_empty() {
            variables.insert(
                vars::APIS.into(),
                VarValue::Mapping(
                    self.apis
                        .into_iter()
                        .map(|(id, api)| (id, api.into_value()))
                        .collect(),
                ),
            );
        }
        if !self.named_values.is_empty() {
            variables.insert(
                vars::NAMED_VALUES.into(),
                VarValue::Mapping(
                    self.named_values
                        .into_iter()
                        .map(|(id, nv)| (id, nv.into_value()))
                        .collect(),
                ),
            );
        }
        if !self.tags.is_empty() {
            variables.insert(vars::TAGS.into(), VarValue::mapping(self.tags));
        }

        Ok(ScenarioDefinition {
            name: self.name,
            identity: self.identity,
            variables,
            expected_outputs,
            expected_state,
        })
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for key in REQUIRED {
            match self.variables.get(key) {
                Some(value) if !value.is_empty() => {}
                _ => problems.push(format!("{key} is required")),
            }
        }
        let sku = text_var(&self.variables, vars::SKU_NAME);
        if !sku.trim().is_empty() && !valid_sku(sku) {
            problems.push(format!(
                "sku_name `{sku}` must be <{}>_<capacity>",
                SKU_TIERS.join("|")
            ));
        }
        let email = text_var(&self.variables, vars::PUBLISHER_EMAIL);
        if !email.trim().is_empty() && !email.contains('@') {
            problems.push(format!("publisher_email `{email}` is not an email address"));
        }
        if let Some(mode) = self.variables.get(vars::VIRTUAL_NETWORK_TYPE) {
            if !mode.is_empty() && !mode.as_text().is_some_and(|m| NETWORK_MODES.contains(&m)) {
                problems.push(format!(
                    "virtual_network_type `{}` must be one of {}",
                    mode.render(),
                    NETWORK_MODES.join(", ")
                ));
            }
        }
        problems
    }
}

fn text_var<'a>(variables: &'a VarMap, key: &str) -> &'a str {
    variables
        .get(key)
        .and_then(VarValue::as_text)
        .unwrap_or_default()
}

fn valid_sku(sku: &str) -> bool {
    let Some((tier, capacity)) = sku.split_once('_') else {
        return false;
    };
    SKU_TIERS.contains(&tier)
        && !capacity.is_empty()
        && capacity.chars().all(|c| c.is_ascii_digit())
}

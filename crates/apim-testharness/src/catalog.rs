//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "07-catalog"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Built-in acceptance scenarios for the API Management module."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use apim_common::RunConfig;
use thiserror::Error;

use crate::coordinator::ScenarioTemplate;
use crate::scenario::{ApiSpec, NamedValueSpec, OperationSpec, ProductSpec, ScenarioBuilder};
use crate::state::{SnapshotField, StateExpectation};

pub const PUBLISHER_NAME: &str = "Test Publisher";
pub const PUBLISHER_EMAIL: &str = "test@example.com";

pub const BASIC: &str = "basic";
pub const FULL: &str = "full";
pub const VNET: &str = "vnet";

/// Names of every catalog scenario, in run order.
pub const NAMES: [&str; 3] = [BASIC, FULL, VNET];

#[derive(Debug, Error)]
#[error("unknown scenario `{0}` (available: basic, full, vnet)")]
pub struct UnknownScenario(pub String);

/// Region and environment tag applied to every catalog scenario.
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    pub location: String,
    pub environment: String,
}

impl CatalogSettings {
    pub fn from_run(config: &RunConfig) -> Self {
        Self {
            location: config.location.clone(),
            environment: config.environment.clone(),
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self::from_run(&RunConfig::default())
    }
}

/// Developer tier service with nothing but the required inputs.
pub fn basic(settings: &CatalogSettings) -> ScenarioTemplate {
    let settings = settings.clone();
    ScenarioTemplate::new(BASIC, "apim-test-", move |identity| {
        ScenarioBuilder::new(BASIC, identity)
            .location(settings.location.as_str())
            .environment(settings.environment.as_str())
            .publisher(PUBLISHER_NAME, PUBLISHER_EMAIL)
            .sku("Developer_1")
            .tag("Environment", settings.environment.as_str())
            .tag("Module", "api-management")
            .build()
    })
}

/// Service with a product, an API with one operation, and a secret named value.
pub fn full(settings: &CatalogSettings) -> ScenarioTemplate {
    let settings = settings.clone();
    ScenarioTemplate::new(FULL, "apim-full-test-", move |identity| {
        let starter = ProductSpec {
            description: "Basic API product for testing".into(),
            subscriptions_limit: Some(10),
            ..ProductSpec::new("Starter Product")
        };
        let petstore = ApiSpec {
            description: "Sample Petstore API".into(),
            service_url: Some("https://petstore.swagger.io/v2".into()),
            ..ApiSpec::new("petstore-api", "Petstore API", "petstore")
        }
        .operation(
            "get-pets",
            OperationSpec {
                description: "Retrieve all pets".into(),
                ..OperationSpec::new("Get Pets", "GET", "/pets")
            },
        );
        ScenarioBuilder::new(FULL, identity)
            .location(settings.location.as_str())
            .environment(settings.environment.as_str())
            .publisher(PUBLISHER_NAME, PUBLISHER_EMAIL)
            .sku("Developer_1")
            .product("starter", starter)
            .api("petstore", petstore)
            .named_value("api-key", NamedValueSpec::new("API Key", "test-api-key-123", true))
            .tag("Environment", settings.environment.as_str())
            .tag("Module", "api-management-full")
            .build()
    })
}

/// Premium service injected into a virtual network in External mode.
pub fn vnet(settings: &CatalogSettings) -> ScenarioTemplate {
    let settings = settings.clone();
    ScenarioTemplate::new(VNET, "apim-vnet-test-", move |identity| {
        ScenarioBuilder::new(VNET, identity)
            .location(settings.location.as_str())
            .environment(settings.environment.as_str())
            .publisher(PUBLISHER_NAME, PUBLISHER_EMAIL)
            .sku("Premium_1")
            .virtual_network_type("External")
            .tag("Environment", settings.environment.as_str())
            .tag("Module", "api-management-vnet")
            .expect_state(StateExpectation::equals(SnapshotField::VirtualNetworkType, "External"))
            .expect_state(StateExpectation::non_empty(SnapshotField::PublicIpAddresses))
            .expect_state(StateExpectation::non_empty(SnapshotField::PrivateIpAddresses))
            .build()
    })
}

pub fn all(settings: &CatalogSettings) -> Vec<ScenarioTemplate> {
    vec![basic(settings), full(settings), vnet(settings)]
}

/// Templates for `names`, or the whole catalog when `names` is empty.
pub fn select(
    settings: &CatalogSettings,
    names: &[String],
) -> Result<Vec<ScenarioTemplate>, UnknownScenario> {
    if names.is_empty() {
        return Ok(all(settings));
    }
    names
        .iter()
        .map(|name| match name.as_str() {
            BASIC => Ok(basic(settings)),
            FULL => Ok(full(settings)),
            VNET => Ok(vnet(settings)),
            other => Err(UnknownScenario(other.to_owned())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::vars;
    use crate::value::VarValue;

    #[test]
    fn every_template_builds() {
        let settings = CatalogSettings::default();
        for template in all(&settings) {
            let definition = template.instantiate().expect("valid catalog scenario");
            assert_eq!(definition.name(), template.name());
            assert!(definition.identity().as_str().starts_with(template.prefix()));
        }
    }

    #[test]
    fn full_scenario_carries_nested_structures() {
        let definition = full(&CatalogSettings::default()).instantiate().expect("full");
        let variables = definition.variables();
        assert_eq!(
            variables[vars::APIS].get_path(&["petstore", "operations", "get-pets", "url_template"]),
            Some(&VarValue::text("/pets"))
        );
        assert_eq!(
            variables[vars::NAMED_VALUES].get_path(&["api-key", "secret"]),
            Some(&VarValue::from(true))
        );
    }

    #[test]
    fn select_rejects_unknown_names() {
        let settings = CatalogSettings::default();
        assert_eq!(select(&settings, &[]).expect("all").len(), 3);
        assert_eq!(select(&settings, &["vnet".into()]).expect("vnet").len(), 1);
        let err = select(&settings, &["bogus".into()]).expect_err("unknown");
        assert_eq!(err.0, "bogus");
    }
}

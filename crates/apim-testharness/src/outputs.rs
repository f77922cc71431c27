//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "03-validation"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Exported output set and the output contract validator."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! Output checks are structural: values are rendered to strings and tested
//! with substring or URL predicates. Identifiers are never interpreted beyond
//! containment.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Violation;
use crate::value::{VarMap, VarValue};

/// Output keys every module apply must export.
pub mod keys {
    pub const API_MANAGEMENT_ID: &str = "api_management_id";
    pub const API_MANAGEMENT_NAME: &str = "api_management_name";
    pub const GATEWAY_URL: &str = "api_management_gateway_url";
    pub const PORTAL_URL: &str = "api_management_portal_url";
    pub const RESOURCE_GROUP_NAME: &str = "resource_group_name";
    pub const LOCATION: &str = "location";
    pub const PUBLISHER_NAME: &str = "publisher_name";
    pub const PRODUCT_IDS: &str = "product_ids";
    pub const API_IDS: &str = "api_ids";
    pub const NAMED_VALUE_IDS: &str = "named_value_ids";
}

/// Resource type token expected inside the service identifier.
pub const SERVICE_RESOURCE_TYPE: &str = "Microsoft.ApiManagement/service";

/// Ordered key/value results exported by a successful apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OutputSet {
    values: VarMap,
}

#[derive(Deserialize)]
struct TerraformOutput {
    value: VarValue,
}

impl OutputSet {
    pub fn new(values: VarMap) -> Self {
        Self { values }
    }

    /// Parse the document printed by `terraform output -json`.
    pub fn from_terraform_json(raw: &str) -> Result<Self, serde_json::Error> {
        let parsed: IndexMap<String, TerraformOutput> = serde_json::from_str(raw)?;
        Ok(Self {
            values: parsed
                .into_iter()
                .map(|(key, output)| (key, output.value))
                .collect(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&VarValue> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, VarValue)> for OutputSet {
    fn from_iter<T: IntoIterator<Item = (String, VarValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Format or content predicate applied to a rendered output value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputConstraint {
    Equals(String),
    StartsWith(String),
    Contains(String),
    /// Parses as a URL with the `https` scheme and a host.
    HttpsUrl,
}

impl OutputConstraint {
    fn holds(&self, rendered: &str) -> bool {
        match self {
            OutputConstraint::Equals(expected) => rendered == expected,
            OutputConstraint::StartsWith(prefix) => rendered.starts_with(prefix.as_str()),
            OutputConstraint::Contains(needle) => rendered.contains(needle.as_str()),
            OutputConstraint::HttpsUrl => Url::parse(rendered)
                .map(|url| url.scheme() == "https" && url.host_str().is_some_and(|h| !h.is_empty()))
                .unwrap_or(false),
        }
    }

    fn describe(&self) -> String {
        match self {
            OutputConstraint::Equals(expected) => format!("equal `{expected}`"),
            OutputConstraint::StartsWith(prefix) => format!("start with `{prefix}`"),
            OutputConstraint::Contains(needle) => format!("contain `{needle}`"),
            OutputConstraint::HttpsUrl => "be an https URL".to_owned(),
        }
    }
}

/// Expected output: the key must be present and non-empty, and every
/// constraint must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputExpectation {
    key: String,
    constraints: Vec<OutputConstraint>,
}

impl OutputExpectation {
    /// Require `key` to be present and non-empty.
    pub fn present(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            constraints: Vec::new(),
        }
    }

    pub fn equals(self, expected: impl Into<String>) -> Self {
        self.with(OutputConstraint::Equals(expected.into()))
    }

    pub fn starts_with(self, prefix: impl Into<String>) -> Self {
        self.with(OutputConstraint::StartsWith(prefix.into()))
    }

    pub fn contains(self, needle: impl Into<String>) -> Self {
        self.with(OutputConstraint::Contains(needle.into()))
    }

    pub fn https_url(self) -> Self {
        self.with(OutputConstraint::HttpsUrl)
    }

    pub fn with(mut self, constraint: OutputConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn constraints(&self) -> &[OutputConstraint] {
        &self.constraints
    }
}

/// Check every expectation against `outputs`, collecting all violations in
/// expectation order.
pub fn validate(outputs: &OutputSet, expectations: &[OutputExpectation]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for expectation in expectations {
        let value = match outputs.get(&expectation.key) {
            Some(value) if !value.is_empty() => value,
            _ => {
                violations.push(Violation::MissingOutput {
                    key: expectation.key.clone(),
                });
                continue;
            }
        };
        let rendered = value.render();
        violations.extend(
            expectation
                .constraints
                .iter()
                .filter(|constraint| !constraint.holds(&rendered))
                .map(|constraint| Violation::ShapeMismatch {
                    key: expectation.key.clone(),
                    constraint: constraint.describe(),
                    actual: rendered.clone(),
                }),
        );
    }
    violations
}

/// Outputs every module apply is held to.
pub fn standard_contract(publisher_name: &str) -> Vec<OutputExpectation> {
    vec![
        OutputExpectation::present(keys::API_MANAGEMENT_ID).contains(SERVICE_RESOURCE_TYPE),
        OutputExpectation::present(keys::API_MANAGEMENT_NAME),
        OutputExpectation::present(keys::GATEWAY_URL).https_url(),
        OutputExpectation::present(keys::PORTAL_URL).https_url(),
        OutputExpectation::present(keys::RESOURCE_GROUP_NAME),
        OutputExpectation::present(keys::LOCATION),
        OutputExpectation::present(keys::PUBLISHER_NAME).equals(publisher_name),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(pairs: &[(&str, VarValue)]) -> OutputSet {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), value.clone()))
            .collect()
    }

    #[test]
    fn https_gateway_passes_and_http_fails_once() {
        let expectation = [OutputExpectation::present("gateway_url").starts_with("https://")];

        let ok = outputs(&[("gateway_url", VarValue::text("https://x"))]);
        assert!(validate(&ok, &expectation).is_empty());

        let bad = outputs(&[("gateway_url", VarValue::text("http://x"))]);
        let violations = validate(&bad, &expectation);
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            &violations[0],
            Violation::ShapeMismatch { key, .. } if key == "gateway_url"
        ));
    }

    #[test]
    fn https_url_constraint_requires_scheme_and_host() {
        let expectation = [OutputExpectation::present("portal").https_url()];
        for (value, ok) in [
            ("https://apim.developer.azure-api.net", true),
            ("http://apim.developer.azure-api.net", false),
            ("https://", false),
            ("apim.developer.azure-api.net", false),
        ] {
            let set = outputs(&[("portal", VarValue::text(value))]);
            assert_eq!(validate(&set, &expectation).is_empty(), ok, "{value}");
        }
    }

    #[test]
    fn absent_and_empty_outputs_are_missing() {
        let expectations = [
            OutputExpectation::present("location"),
            OutputExpectation::present("product_ids").contains("starter"),
        ];
        let set = outputs(&[("product_ids", VarValue::Mapping(VarMap::new()))]);
        let violations = validate(&set, &expectations);
        assert_eq!(
            violations,
            vec![
                Violation::MissingOutput { key: "location".into() },
                Violation::MissingOutput { key: "product_ids".into() },
            ]
        );
    }

    #[test]
    fn collects_every_violation_in_expectation_order() {
        let set = outputs(&[
            (keys::API_MANAGEMENT_ID, VarValue::text("/subscriptions/x/resourceGroups/rg")),
            (keys::GATEWAY_URL, VarValue::text("http://gw")),
            (keys::PUBLISHER_NAME, VarValue::text("Someone Else")),
        ]);
        let violations = validate(&set, &standard_contract("Test Publisher"));
        let subjects: Vec<_> = violations.iter().filter_map(Violation::subject).collect();
        assert_eq!(
            subjects,
            vec![
                keys::API_MANAGEMENT_ID,
                keys::API_MANAGEMENT_NAME,
                keys::GATEWAY_URL,
                keys::PORTAL_URL,
                keys::RESOURCE_GROUP_NAME,
                keys::LOCATION,
                keys::PUBLISHER_NAME,
            ]
        );
    }

    #[test]
    fn structured_outputs_compare_on_rendered_json() {
        let set = outputs(&[(
            keys::PRODUCT_IDS,
            VarValue::mapping([("starter", "/service/apim/products/starter")]),
        )]);
        let expectation = [OutputExpectation::present(keys::PRODUCT_IDS).contains("\"starter\"")];
        assert!(validate(&set, &expectation).is_empty());
    }

    #[test]
    fn parses_terraform_output_document() {
        let raw = r#"{
            "api_management_name": {"sensitive": false, "type": "string", "value": "apim-test-abc"},
            "product_ids": {
                "sensitive": false,
                "type": ["map", "string"],
                "value": {"starter": "/p/starter"}
            }
        }"#;
        let set = OutputSet::from_terraform_json(raw).expect("parse");
        assert_eq!(set.keys().collect::<Vec<_>>(), vec!["api_management_name", "product_ids"]);
        assert_eq!(
            set.get("product_ids").and_then(|v| v.get("starter")),
            Some(&VarValue::text("/p/starter"))
        );
    }
}

//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "02-model"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Domain error and violation types for the acceptance lifecycle."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::backend::ProvisionedResourceHandle;

/// Identity allocation failures. Each rejects only the scenario that asked.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("operating system entropy unavailable: {0}")]
    Entropy(String),
    #[error("invalid identity prefix `{prefix}`: {reason}")]
    InvalidPrefix {
        prefix: String,
        reason: &'static str,
    },
}

/// Scenario input rejected before any provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scenario `{scenario}` has invalid configuration: {}", .problems.join("; "))]
pub struct ConfigValidationError {
    pub scenario: String,
    pub problems: Vec<String>,
}

/// Provisioning backend failure during apply.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Nothing was created; the module copy could not be prepared.
    #[error("workspace preparation failed for {identity}: {message}")]
    Workspace { identity: String, message: String },
    /// The backend started creating resources and then failed.
    #[error("provisioning failed for {identity}: {message}")]
    Provisioning {
        identity: String,
        message: String,
        partial: Option<ProvisionedResourceHandle>,
    },
    /// Resources exist but their outputs could not be read back.
    #[error("outputs unreadable for {identity}: {message}")]
    Outputs {
        identity: String,
        message: String,
        partial: Option<ProvisionedResourceHandle>,
    },
}

impl ApplyError {
    /// Handle to whatever was created before the failure.
    pub fn partial(&self) -> Option<&ProvisionedResourceHandle> {
        match self {
            ApplyError::Workspace { .. } => None,
            ApplyError::Provisioning { partial, .. } | ApplyError::Outputs { partial, .. } => {
                partial.as_ref()
            }
        }
    }
}

/// Cleanup failure. Always reported as a potential resource leak.
#[derive(Debug, Clone, Error)]
pub enum DestroyError {
    #[error("destroy failed for {identity}: {message}")]
    Failed { identity: String, message: String },
    #[error("destroy of {identity} did not finish within {timeout:?}")]
    TimedOut { identity: String, timeout: Duration },
    /// Destroy reported success but the service is still live.
    #[error("{resource} still exists after destroying {identity}")]
    Residual { identity: String, resource: String },
    /// Removal could not be confirmed against the provider.
    #[error("could not confirm {resource} was removed for {identity}: {detail}")]
    Unconfirmed {
        identity: String,
        resource: String,
        detail: String,
    },
}

/// Failure talking to the cloud provider's read API.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Transient(_) => true,
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) => false,
        }
    }
}

/// One unmet expectation found while validating a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("output `{key}` is missing or empty")]
    MissingOutput { key: String },
    #[error("output `{key}` must {constraint}, got `{actual}`")]
    ShapeMismatch {
        key: String,
        constraint: String,
        actual: String,
    },
    #[error("state field `{field}` must {expectation}, got `{actual}`")]
    StateMismatch {
        field: String,
        expectation: String,
        actual: String,
    },
    #[error("resource `{resource}` not visible after {waited_ms}ms: {detail}")]
    ReadTimeout {
        resource: String,
        waited_ms: u64,
        detail: String,
    },
    #[error("validation aborted: {message}")]
    ValidationFault { message: String },
}

impl Violation {
    /// Output key or state field the violation refers to, when it has one.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Violation::MissingOutput { key } | Violation::ShapeMismatch { key, .. } => Some(key),
            Violation::StateMismatch { field, .. } => Some(field),
            Violation::ReadTimeout { resource, .. } => Some(resource),
            Violation::ValidationFault { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_lists_every_problem() {
        let err = ConfigValidationError {
            scenario: "basic".into(),
            problems: vec!["publisher_name is required".into(), "sku_name is required".into()],
        };
        assert_eq!(
            err.to_string(),
            "scenario `basic` has invalid configuration: \
             publisher_name is required; sku_name is required"
        );
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(ProviderError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(ProviderError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(!ProviderError::Http { status: 403, message: String::new() }.is_retryable());
        assert!(!ProviderError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn violations_serialize_with_kind_tag() {
        let violation = Violation::MissingOutput { key: "location".into() };
        let json = serde_json::to_value(&violation).expect("serialize");
        assert_eq!(json["kind"], "missing_output");
        assert_eq!(json["key"], "location");
        assert_eq!(violation.subject(), Some("location"));
    }
}

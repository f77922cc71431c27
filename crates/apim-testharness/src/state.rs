//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "03-validation"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Live state snapshots, state expectations and bounded read-after-write retry."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::fmt;
use std::time::Duration;

use apim_common::TimeoutConfig;
use async_trait::async_trait;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::{ProviderError, Violation};

/// Name and resource group of a provisioned service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceLocator {
    pub name: String,
    pub resource_group: String,
}

impl ResourceLocator {
    pub fn new(name: impl Into<String>, resource_group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_group: resource_group.into(),
        }
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_group, self.name)
    }
}

/// Read-only view of a live API Management service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    /// `<tier>_<capacity>`, e.g. `Premium_1`.
    pub sku_name: String,
    pub publisher_name: String,
    pub publisher_email: String,
    pub gateway_url: String,
    pub portal_url: String,
    pub virtual_network_type: Option<String>,
    /// Externally reachable addresses.
    pub public_ip_addresses: Vec<String>,
    pub private_ip_addresses: Vec<String>,
    pub product_ids: Vec<String>,
    pub api_ids: Vec<String>,
    pub named_value_ids: Vec<String>,
}

/// Snapshot attribute addressed by a [`StateExpectation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotField {
    Name,
    ResourceGroup,
    Location,
    SkuName,
    PublisherName,
    PublisherEmail,
    GatewayUrl,
    PortalUrl,
    VirtualNetworkType,
    PublicIpAddresses,
    PrivateIpAddresses,
    ProductIds,
    ApiIds,
    NamedValueIds,
}

enum FieldValue<'a> {
    Text(&'a str),
    List(&'a [String]),
}

impl SnapshotField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotField::Name => "name",
            SnapshotField::ResourceGroup => "resource_group",
            SnapshotField::Location => "location",
            SnapshotField::SkuName => "sku_name",
            SnapshotField::PublisherName => "publisher_name",
            SnapshotField::PublisherEmail => "publisher_email",
            SnapshotField::GatewayUrl => "gateway_url",
            SnapshotField::PortalUrl => "portal_url",
            SnapshotField::VirtualNetworkType => "virtual_network_type",
            SnapshotField::PublicIpAddresses => "public_ip_addresses",
            SnapshotField::PrivateIpAddresses => "private_ip_addresses",
            SnapshotField::ProductIds => "product_ids",
            SnapshotField::ApiIds => "api_ids",
            SnapshotField::NamedValueIds => "named_value_ids",
        }
    }

    fn read<'a>(&self, snapshot: &'a ResourceSnapshot) -> FieldValue<'a> {
        match self {
            SnapshotField::Name => FieldValue::Text(&snapshot.name),
            SnapshotField::ResourceGroup => FieldValue::Text(&snapshot.resource_group),
            SnapshotField::Location => FieldValue::Text(&snapshot.location),
            SnapshotField::SkuName => FieldValue::Text(&snapshot.sku_name),
            SnapshotField::PublisherName => FieldValue::Text(&snapshot.publisher_name),
            SnapshotField::PublisherEmail => FieldValue::Text(&snapshot.publisher_email),
            SnapshotField::GatewayUrl => FieldValue::Text(&snapshot.gateway_url),
            SnapshotField::PortalUrl => FieldValue::Text(&snapshot.portal_url),
            SnapshotField::VirtualNetworkType => {
                FieldValue::Text(snapshot.virtual_network_type.as_deref().unwrap_or(""))
            }
            SnapshotField::PublicIpAddresses => FieldValue::List(&snapshot.public_ip_addresses),
            SnapshotField::PrivateIpAddresses => FieldValue::List(&snapshot.private_ip_addresses),
            SnapshotField::ProductIds => FieldValue::List(&snapshot.product_ids),
            SnapshotField::ApiIds => FieldValue::List(&snapshot.api_ids),
            SnapshotField::NamedValueIds => FieldValue::List(&snapshot.named_value_ids),
        }
    }
}

/// Predicate applied to one snapshot field. On list fields `Contains` means
/// membership and `Equals` compares the comma-joined list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateCheck {
    Equals(String),
    NonEmpty,
    Contains(String),
}

/// Expected property of the live resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateExpectation {
    field: SnapshotField,
    check: StateCheck,
}

impl StateExpectation {
    pub fn equals(field: SnapshotField, expected: impl Into<String>) -> Self {
        Self {
            field,
            check: StateCheck::Equals(expected.into()),
        }
    }

    pub fn non_empty(field: SnapshotField) -> Self {
        Self {
            field,
            check: StateCheck::NonEmpty,
        }
    }

    pub fn contains(field: SnapshotField, member: impl Into<String>) -> Self {
        Self {
            field,
            check: StateCheck::Contains(member.into()),
        }
    }

    pub fn field(&self) -> SnapshotField {
        self.field
    }

    pub fn check(&self) -> &StateCheck {
        &self.check
    }

    /// Compare against `snapshot`; `None` when the expectation holds.
    pub fn evaluate(&self, snapshot: &ResourceSnapshot) -> Option<Violation> {
        let value = self.field.read(snapshot);
        let holds = match (&self.check, &value) {
            (StateCheck::Equals(expected), FieldValue::Text(actual)) => {
                *actual == expected.as_str()
            }
            (StateCheck::Equals(expected), FieldValue::List(items)) => {
                items.join(",") == *expected
            }
            (StateCheck::NonEmpty, FieldValue::Text(actual)) => !actual.trim().is_empty(),
            (StateCheck::NonEmpty, FieldValue::List(items)) => !items.is_empty(),
            (StateCheck::Contains(needle), FieldValue::Text(actual)) => {
                actual.contains(needle.as_str())
            }
            (StateCheck::Contains(member), FieldValue::List(items)) => {
                items.iter().any(|item| item == member)
            }
        };
        if holds {
            return None;
        }
        let actual = match value {
            FieldValue::Text(text) => text.to_owned(),
            FieldValue::List(items) => format!("[{}]", items.join(", ")),
        };
        let expectation = match &self.check {
            StateCheck::Equals(expected) => format!("equal `{expected}`"),
            StateCheck::NonEmpty => "be non-empty".to_owned(),
            StateCheck::Contains(member) => format!("contain `{member}`"),
        };
        Some(Violation::StateMismatch {
            field: self.field.as_str().to_owned(),
            expectation,
            actual,
        })
    }
}

/// Read-only access to the provider's live state.
#[async_trait]
pub trait StateReader: Send + Sync {
    /// Describe the service; `Ok(None)` when it is not (yet) visible.
    async fn describe(
        &self,
        locator: &ResourceLocator,
    ) -> Result<Option<ResourceSnapshot>, ProviderError>;
}

/// Backoff schedule used while waiting for read-after-write visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
    pub timeout: Duration,
}

impl ReadPolicy {
    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self {
            initial_backoff: config.read_initial_backoff,
            max_backoff: config.read_max_backoff,
            jitter: config.read_jitter,
            timeout: config.read_timeout,
        }
    }

    /// Delay before retry `attempt` (1-indexed): doubling from the initial
    /// backoff, capped, plus up to `jitter`.
    fn delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_backoff);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

/// Why a retried read gave up.
#[derive(Debug, Error)]
pub enum StateReadError {
    #[error("{locator} not visible after {waited:?} ({attempts} attempts, last: {last})")]
    NotVisible {
        locator: ResourceLocator,
        waited: Duration,
        attempts: u32,
        last: String,
    },
    #[error("reading {locator} failed: {source}")]
    Provider {
        locator: ResourceLocator,
        #[source]
        source: ProviderError,
    },
}

impl StateReadError {
    pub fn into_violation(self) -> Violation {
        match self {
            StateReadError::NotVisible {
                locator,
                waited,
                last,
                ..
            } => Violation::ReadTimeout {
                resource: locator.to_string(),
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                detail: last,
            },
            other @ StateReadError::Provider { .. } => Violation::ValidationFault {
                message: other.to_string(),
            },
        }
    }
}

/// Describe `locator`, retrying not-found and retryable provider errors with
/// exponential backoff until `policy.timeout` elapses.
pub async fn read_with_retry(
    reader: &dyn StateReader,
    locator: &ResourceLocator,
    policy: &ReadPolicy,
) -> Result<ResourceSnapshot, StateReadError> {
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut rng = StdRng::from_rng(OsRng).unwrap_or_else(|_| StdRng::seed_from_u64(0x5eed));
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let last = match reader.describe(locator).await {
            Ok(Some(snapshot)) => {
                debug!(resource = %locator, attempt, "live state visible");
                return Ok(snapshot);
            }
            Ok(None) => "not found".to_owned(),
            Err(err) if err.is_retryable() => err.to_string(),
            Err(source) => {
                return Err(StateReadError::Provider {
                    locator: locator.clone(),
                    source,
                })
            }
        };

        let now = Instant::now();
        if now >= deadline {
            return Err(StateReadError::NotVisible {
                locator: locator.clone(),
                waited: now - started,
                attempts: attempt,
                last,
            });
        }
        let delay = policy.delay(attempt, &mut rng).min(deadline - now);
        debug!(resource = %locator, attempt, ?delay, reason = %last, "live state not yet readable");
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn snapshot() -> ResourceSnapshot {
        ResourceSnapshot {
            name: "apim-test-abc".into(),
            resource_group: "rg-apim-test-abc".into(),
            sku_name: "Developer_1".into(),
            product_ids: vec!["starter".into()],
            ..ResourceSnapshot::default()
        }
    }

    struct Flaky {
        calls: AtomicU32,
        visible_after: u32,
        error: Option<ProviderError>,
    }

    #[async_trait]
    impl StateReader for Flaky {
        async fn describe(
            &self,
            _locator: &ResourceLocator,
        ) -> Result<Option<ResourceSnapshot>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = &self.error {
                return Err(err.clone());
            }
            Ok((call >= self.visible_after).then(snapshot))
        }
    }

    fn locator() -> ResourceLocator {
        ResourceLocator::new("apim-test-abc", "rg-apim-test-abc")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReadPolicy {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            jitter: Duration::ZERO,
            timeout: Duration::from_secs(300),
        };
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<_> = (1..=6).map(|n| policy.delay(n, &mut rng).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn expectations_cover_text_and_lists() {
        let snap = snapshot();
        assert!(StateExpectation::equals(SnapshotField::SkuName, "Developer_1")
            .evaluate(&snap)
            .is_none());
        assert!(StateExpectation::contains(SnapshotField::ProductIds, "starter")
            .evaluate(&snap)
            .is_none());
        assert!(StateExpectation::non_empty(SnapshotField::GatewayUrl)
            .evaluate(&snap)
            .is_some());
        let violation = StateExpectation::equals(SnapshotField::VirtualNetworkType, "External")
            .evaluate(&snap)
            .expect("mismatch");
        assert!(matches!(
            violation,
            Violation::StateMismatch { ref field, ref actual, .. }
                if field == "virtual_network_type" && actual.is_empty()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_resource_becomes_visible() {
        let reader = Flaky {
            calls: AtomicU32::new(0),
            visible_after: 3,
            error: None,
        };
        let snapshot = read_with_retry(&reader, &locator(), &ReadPolicy::default())
            .await
            .expect("visible");
        assert_eq!(snapshot.name, "apim-test-abc");
        assert_eq!(reader.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_the_deadline() {
        let reader = Flaky {
            calls: AtomicU32::new(0),
            visible_after: u32::MAX,
            error: None,
        };
        let policy = ReadPolicy::default();
        let err = read_with_retry(&reader, &locator(), &policy)
            .await
            .expect_err("timeout");
        match err.into_violation() {
            Violation::ReadTimeout { waited_ms, detail, .. } => {
                assert!(waited_ms >= policy.timeout.as_millis() as u64);
                assert_eq!(detail, "not found");
            }
            other => panic!("unexpected violation {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_immediately() {
        let reader = Flaky {
            calls: AtomicU32::new(0),
            visible_after: 1,
            error: Some(ProviderError::Http {
                status: 403,
                message: "forbidden".into(),
            }),
        };
        let err = read_with_retry(&reader, &locator(), &ReadPolicy::default())
            .await
            .expect_err("forbidden");
        assert!(matches!(err, StateReadError::Provider { .. }));
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
    }
}

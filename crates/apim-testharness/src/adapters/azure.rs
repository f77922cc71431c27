//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "06-adapters"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Azure Resource Manager read-only describe of API Management services."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::fmt;
use std::sync::Arc;

use apim_common::{ProviderConfig, ProviderCredentials};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::adapters::token::{token_provider, TokenProvider};
use crate::error::ProviderError;
use crate::state::{ResourceLocator, ResourceSnapshot, StateReader};

#[derive(Debug, Deserialize)]
struct ArmSku {
    name: String,
    #[serde(default)]
    capacity: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmServiceProperties {
    #[serde(default)]
    publisher_name: String,
    #[serde(default)]
    publisher_email: String,
    #[serde(default)]
    gateway_url: Option<String>,
    #[serde(default)]
    developer_portal_url: Option<String>,
    #[serde(default)]
    portal_url: Option<String>,
    #[serde(default)]
    virtual_network_type: Option<String>,
    #[serde(default, rename = "publicIPAddresses")]
    public_ip_addresses: Option<Vec<String>>,
    #[serde(default, rename = "privateIPAddresses")]
    private_ip_addresses: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ArmService {
    name: String,
    #[serde(default)]
    location: String,
    sku: ArmSku,
    #[serde(default)]
    properties: ArmServiceProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmPage {
    #[serde(default)]
    value: Vec<ArmNamed>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArmNamed {
    name: String,
}

/// Describes services through the management endpoint. A bearer token is
/// requested from the [`TokenProvider`] for every call.
#[derive(Clone)]
pub struct ArmStateReader {
    client: reqwest::Client,
    endpoint: Url,
    api_version: String,
    subscription_id: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ArmStateReader {
    pub fn new(
        config: &ProviderConfig,
        credentials: Arc<ProviderCredentials>,
    ) -> Result<Self, ProviderError> {
        let endpoint = Url::parse(&config.management_endpoint)
            .map_err(|err| ProviderError::Decode(format!("management endpoint: {err}")))?;
        let login = Url::parse(&config.login_endpoint)
            .map_err(|err| ProviderError::Decode(format!("login endpoint: {err}")))?;
        let tokens = token_provider(credentials.token_source(), &endpoint, &login)?;
        debug!(source = tokens.kind(), "management API token source selected");
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_version: config.api_version.clone(),
            subscription_id: credentials.subscription_id().to_owned(),
            tokens,
        })
    }

    /// Replace the token source.
    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    fn service_url(
        &self,
        locator: &ResourceLocator,
        collection: Option<&str>,
    ) -> Result<Url, ProviderError> {
        let mut path = format!(
            "subscriptions/{}/resourceGroups/{}/providers/Microsoft.ApiManagement/service/{}",
            self.subscription_id, locator.resource_group, locator.name
        );
        if let Some(collection) = collection {
            path.push('/');
            path.push_str(collection);
        }
        let mut url = self
            .endpoint
            .join(&path)
            .map_err(|err| ProviderError::Decode(format!("resource url: {err}")))?;
        url.query_pairs_mut().append_pair("api-version", &self.api_version);
        Ok(url)
    }

    /// GET `url`; `Ok(None)` on 404.
    async fn get_json(&self, url: Url) -> Result<Option<Value>, ProviderError> {
        let token = self.tokens.token().await?;
        debug!(%url, "ARM GET");
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ProviderError::Transient(format!("GET {url}: {err}")))?;
        let status = response.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            return Err(ProviderError::Http {
                status,
                message: parse_arm_error(&body),
            });
        }
        if body.is_null() {
            return Err(ProviderError::Decode(format!("GET {url}: empty or malformed body")));
        }
        Ok(Some(body))
    }

    /// Names of every child resource in `collection`, following `nextLink`.
    /// `None` when the collection is not visible yet.
    async fn list_names(
        &self,
        locator: &ResourceLocator,
        collection: &str,
    ) -> Result<Option<Vec<String>>, ProviderError> {
        let mut names = Vec::new();
        let mut next = Some(self.service_url(locator, Some(collection))?);
        while let Some(url) = next.take() {
            let Some(body) = self.get_json(url).await? else {
                debug!(%locator, collection, "collection not visible yet");
                return Ok(None);
            };
            let page: ArmPage = serde_json::from_value(body)
                .map_err(|err| ProviderError::Decode(err.to_string()))?;
            names.extend(page.value.into_iter().map(|item| item.name));
            next = page
                .next_link
                .map(|link| Url::parse(&link))
                .transpose()
                .map_err(|err| ProviderError::Decode(format!("nextLink: {err}")))?;
        }
        Ok(Some(names))
    }
}

impl fmt::Debug for ArmStateReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArmStateReader")
            .field("endpoint", &self.endpoint.as_str())
            .field("api_version", &self.api_version)
            .field("subscription_id", &self.subscription_id)
            .field("tokens", &self.tokens.kind())
            .finish()
    }
}

fn parse_arm_error(body: &Value) -> String {
    let err = body.get("error").unwrap_or(body);
    let code = err["code"].as_str().unwrap_or("Unknown");
    let message = err["message"].as_str().unwrap_or("unknown error");
    format!("{code}: {message}")
}

fn snapshot_from(service: ArmService, resource_group: &str) -> ResourceSnapshot {
    let properties = service.properties;
    ResourceSnapshot {
        name: service.name,
        resource_group: resource_group.to_owned(),
        location: service.location,
        sku_name: format!("{}_{}", service.sku.name, service.sku.capacity),
        publisher_name: properties.publisher_name,
        publisher_email: properties.publisher_email,
        gateway_url: properties.gateway_url.unwrap_or_default(),
        portal_url: properties
            .developer_portal_url
            .or(properties.portal_url)
            .unwrap_or_default(),
        virtual_network_type: properties.virtual_network_type,
        public_ip_addresses: properties.public_ip_addresses.unwrap_or_default(),
        private_ip_addresses: properties.private_ip_addresses.unwrap_or_default(),
        product_ids: Vec::new(),
        api_ids: Vec::new(),
        named_value_ids: Vec::new(),
    }
}

#[async_trait]
impl StateReader for ArmStateReader {
    async fn describe(
        &self,
        locator: &ResourceLocator,
    ) -> Result<Option<ResourceSnapshot>, ProviderError> {
        let Some(body) = self.get_json(self.service_url(locator, None)?).await? else {
            return Ok(None);
        };
        let service: ArmService =
            serde_json::from_value(body).map_err(|err| ProviderError::Decode(err.to_string()))?;
        let mut snapshot = snapshot_from(service, &locator.resource_group);
        let (Some(products), Some(apis), Some(named_values)) = (
            self.list_names(locator, "products").await?,
            self.list_names(locator, "apis").await?,
            self.list_names(locator, "namedValues").await?,
        ) else {
            return Ok(None);
        };
        snapshot.product_ids = products;
        snapshot.api_ids = apis;
        snapshot.named_value_ids = named_values;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::adapters::test_server::TestServer;
    use apim_common::TokenSource;

    const SERVICE_PATH: &str = "/subscriptions/sub-123/resourceGroups/rg-apim-test-abc/providers/\
                                Microsoft.ApiManagement/service/apim-test-abc";

    fn reader() -> ArmStateReader {
        ArmStateReader::new(
            &ProviderConfig::default(),
            Arc::new(ProviderCredentials::new("sub-123", TokenSource::Static("token".into()))),
        )
        .expect("reader")
    }

    fn reader_for(server: &TestServer) -> ArmStateReader {
        let config = ProviderConfig {
            management_endpoint: server.url().to_string(),
            ..ProviderConfig::default()
        };
        let mut reader = ArmStateReader::new(
            &config,
            Arc::new(ProviderCredentials::new("sub-123", TokenSource::Static("token".into()))),
        )
        .expect("reader");
        reader.client = reqwest::Client::builder().no_proxy().build().expect("client");
        reader
    }

    /// Hands out `token-1`, `token-2`, ... so each request's token is visible.
    #[derive(Default)]
    struct CountingToken {
        issued: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingToken {
        async fn token(&self) -> Result<String, ProviderError> {
            Ok(format!("token-{}", self.issued.fetch_add(1, Ordering::SeqCst) + 1))
        }

        fn kind(&self) -> &'static str {
            "counting"
        }
    }

    fn service_body() -> Value {
        serde_json::json!({
            "name": "apim-test-abc",
            "location": "East US",
            "sku": {"name": "Developer", "capacity": 1},
            "properties": {
                "publisherName": "Test Publisher",
                "publisherEmail": "test@example.com",
                "gatewayUrl": "https://apim-test-abc.azure-api.net"
            }
        })
    }

    #[test]
    fn builds_resource_urls_with_api_version() {
        let reader = reader();
        let locator = ResourceLocator::new("apim-test-abc", "rg-apim-test-abc");
        let url = reader.service_url(&locator, Some("products")).expect("url");
        assert_eq!(
            url.as_str(),
            format!(
                "https://management.azure.com{SERVICE_PATH}/products?api-version=2022-08-01"
            )
        );
    }

    #[test]
    fn maps_service_document_to_snapshot() {
        let body = serde_json::json!({
            "name": "apim-vnet-test-abc",
            "location": "East US",
            "sku": {"name": "Premium", "capacity": 1},
            "properties": {
                "publisherName": "Test Publisher",
                "publisherEmail": "test@example.com",
                "gatewayUrl": "https://apim-vnet-test-abc.azure-api.net",
                "developerPortalUrl": "https://apim-vnet-test-abc.developer.azure-api.net",
                "virtualNetworkType": "External",
                "publicIPAddresses": ["20.62.0.4"],
                "privateIPAddresses": ["10.0.1.4"]
            }
        });
        let service: ArmService = serde_json::from_value(body).expect("service");
        let snapshot = snapshot_from(service, "rg-apim-vnet-test-abc");
        assert_eq!(snapshot.sku_name, "Premium_1");
        assert_eq!(snapshot.virtual_network_type.as_deref(), Some("External"));
        assert_eq!(snapshot.public_ip_addresses, vec!["20.62.0.4"]);
        assert_eq!(
            snapshot.portal_url,
            "https://apim-vnet-test-abc.developer.azure-api.net"
        );
    }

    #[test]
    fn arm_errors_render_code_and_message() {
        let body =
            serde_json::json!({"error": {"code": "AuthorizationFailed", "message": "no access"}});
        assert_eq!(parse_arm_error(&body), "AuthorizationFailed: no access");
    }

    #[tokio::test]
    async fn every_request_asks_for_a_fresh_token() {
        let server = TestServer::start(|request| {
            if request.path == SERVICE_PATH {
                (200, service_body())
            } else if request.path.ends_with("/products") {
                (200, serde_json::json!({"value": [{"name": "starter"}]}))
            } else {
                (200, serde_json::json!({"value": []}))
            }
        })
        .await;
        let reader = reader_for(&server).with_token_provider(Arc::new(CountingToken::default()));
        let locator = ResourceLocator::new("apim-test-abc", "rg-apim-test-abc");

        let snapshot = reader
            .describe(&locator)
            .await
            .expect("describe")
            .expect("visible");

        assert_eq!(snapshot.product_ids, vec!["starter"]);
        let tokens: Vec<_> = server
            .requests()
            .into_iter()
            .filter_map(|request| request.authorization)
            .collect();
        assert_eq!(tokens.len(), 4);
        for n in 1..=4 {
            assert!(tokens.contains(&format!("Bearer token-{n}")), "{tokens:?}");
        }
    }

    #[tokio::test]
    async fn missing_child_collection_means_not_visible_yet() {
        let server = TestServer::start(|request| {
            if request.path == SERVICE_PATH {
                (200, service_body())
            } else if request.path.ends_with("/apis") {
                (404, serde_json::json!({"error": {"code": "ResourceNotFound"}}))
            } else {
                (200, serde_json::json!({"value": []}))
            }
        })
        .await;
        let reader = reader_for(&server);
        let locator = ResourceLocator::new("apim-test-abc", "rg-apim-test-abc");

        assert_eq!(reader.describe(&locator).await.expect("describe"), None);
    }

    #[tokio::test]
    async fn expired_credentials_are_not_retried() {
        let server = TestServer::start(|_| {
            let error = serde_json::json!({
                "error": {"code": "ExpiredAuthenticationToken", "message": "expired"}
            });
            (401, error)
        })
        .await;
        let reader = reader_for(&server);
        let locator = ResourceLocator::new("apim-test-abc", "rg-apim-test-abc");

        let err = reader.describe(&locator).await.expect_err("unauthorized");
        assert!(matches!(err, ProviderError::Http { status: 401, .. }));
        assert!(!err.is_retryable());
    }
}

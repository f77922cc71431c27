//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "06-adapters"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Bearer token acquisition and caching for the management API."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! Applies can outlive a single access token, so the state reader asks a
//! [`TokenProvider`] for a token on every request. Refreshable sources cache
//! their token and fetch a new one shortly before it expires.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use apim_common::TokenSource;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::error::ProviderError;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(120);
const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);
const CLI_FALLBACK_LIFETIME: Duration = Duration::from_secs(300);
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

/// Source of bearer tokens for management API requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, ProviderError>;

    /// Short label used in logs.
    fn kind(&self) -> &'static str;
}

/// Build the provider matching `source`. `management` is the audience the
/// tokens are issued for; `login` is the identity platform endpoint.
pub fn token_provider(
    source: &TokenSource,
    management: &Url,
    login: &Url,
) -> Result<Arc<dyn TokenProvider>, ProviderError> {
    let resource = management.as_str().to_owned();
    let provider: Arc<dyn TokenProvider> = match source {
        TokenSource::Static(token) => Arc::new(StaticToken(token.clone())),
        TokenSource::ServicePrincipal {
            tenant_id,
            client_id,
            client_secret,
        } => {
            let token_url = login
                .join(&format!("{tenant_id}/oauth2/v2.0/token"))
                .map_err(|err| ProviderError::Decode(format!("login endpoint: {err}")))?;
            Arc::new(ServicePrincipalToken {
                client: reqwest::Client::new(),
                token_url,
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                scope: format!("{resource}.default"),
                cache: TokenCache::default(),
            })
        }
        TokenSource::ManagedIdentity { client_id } => Arc::new(ManagedIdentityToken {
            client: reqwest::Client::new(),
            endpoint: Url::parse(IMDS_TOKEN_URL)
                .map_err(|err| ProviderError::Decode(format!("metadata endpoint: {err}")))?,
            resource,
            client_id: client_id.clone(),
            cache: TokenCache::default(),
        }),
        TokenSource::AzureCli { tenant_id } => Arc::new(AzureCliToken {
            binary: "az".to_owned(),
            resource,
            tenant_id: tenant_id.clone(),
            cache: TokenCache::default(),
        }),
    };
    Ok(provider)
}

#[derive(Debug, Default)]
struct TokenCache {
    slot: Mutex<Option<(String, Instant)>>,
}

impl TokenCache {
    fn get(&self) -> Option<String> {
        self.slot
            .lock()
            .as_ref()
            .filter(|(_, refresh_at)| Instant::now() < *refresh_at)
            .map(|(token, _)| token.clone())
    }

    fn store(&self, token: String, lifetime: Duration) -> String {
        let refresh_at = Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN);
        *self.slot.lock() = Some((token.clone(), refresh_at));
        token
    }
}

/// `expires_in` arrives as a number from the login endpoint and as a string
/// from the metadata service.
fn lifetime(value: &Value) -> Duration {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_LIFETIME)
}

fn token_field(body: &Value, field: &str, source: &str) -> Result<String, ProviderError> {
    body[field]
        .as_str()
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| ProviderError::Decode(format!("{source}: response carries no {field}")))
}

async fn fetch_json(
    request: reqwest::RequestBuilder,
    source: &str,
) -> Result<Value, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|err| ProviderError::Transient(format!("{source} token request: {err}")))?;
    let status = response.status().as_u16();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !(200..300).contains(&status) {
        let message = body["error_description"]
            .as_str()
            .or_else(|| body["error"].as_str())
            .unwrap_or("token request rejected");
        return Err(ProviderError::Http {
            status,
            message: format!("{source}: {message}"),
        });
    }
    Ok(body)
}

/// Pre-issued token used as is.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, ProviderError> {
        Ok(self.0.clone())
    }

    fn kind(&self) -> &'static str {
        "static"
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StaticToken").field(&"<redacted>").finish()
    }
}

/// Client-credentials grant against the identity platform.
pub struct ServicePrincipalToken {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: TokenCache,
}

#[async_trait]
impl TokenProvider for ServicePrincipalToken {
    async fn token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }
        debug!(url = %self.token_url, "requesting service principal token");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let body = fetch_json(
            self.client.post(self.token_url.clone()).form(&params),
            "service principal",
        )
        .await?;
        let token = token_field(&body, "access_token", "service principal")?;
        Ok(self.cache.store(token, lifetime(&body["expires_in"])))
    }

    fn kind(&self) -> &'static str {
        "service_principal"
    }
}

/// Instance metadata service token for a system or user-assigned identity.
pub struct ManagedIdentityToken {
    client: reqwest::Client,
    endpoint: Url,
    resource: String,
    client_id: Option<String>,
    cache: TokenCache,
}

#[async_trait]
impl TokenProvider for ManagedIdentityToken {
    async fn token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("api-version", IMDS_API_VERSION)
            .append_pair("resource", &self.resource);
        if let Some(client_id) = &self.client_id {
            url.query_pairs_mut().append_pair("client_id", client_id);
        }
        let body = fetch_json(
            self.client.get(url).header("Metadata", "true"),
            "managed identity",
        )
        .await?;
        let token = token_field(&body, "access_token", "managed identity")?;
        Ok(self.cache.store(token, lifetime(&body["expires_in"])))
    }

    fn kind(&self) -> &'static str {
        "managed_identity"
    }
}

/// Token from the Azure CLI's logged-in account.
pub struct AzureCliToken {
    binary: String,
    resource: String,
    tenant_id: Option<String>,
    cache: TokenCache,
}

#[async_trait]
impl TokenProvider for AzureCliToken {
    async fn token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }
        let mut command = Command::new(&self.binary);
        command
            .args(["account", "get-access-token", "--output", "json", "--resource"])
            .arg(&self.resource)
            .kill_on_drop(true);
        if let Some(tenant_id) = &self.tenant_id {
            command.args(["--tenant", tenant_id]);
        }
        let output = command.output().await.map_err(|err| {
            ProviderError::Transient(format!("failed to launch {}: {err}", self.binary))
        })?;
        if !output.status.success() {
            return Err(ProviderError::Decode(format!(
                "az account get-access-token failed ({}): {}; run `az login` first",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let body: Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| ProviderError::Decode(format!("az output: {err}")))?;
        let token = token_field(&body, "accessToken", "azure cli")?;
        Ok(self.cache.store(token, cli_lifetime(&body)))
    }

    fn kind(&self) -> &'static str {
        "azure_cli"
    }
}

/// Newer CLI releases report `expires_on` as epoch seconds.
fn cli_lifetime(body: &Value) -> Duration {
    body["expires_on"]
        .as_i64()
        .map(|expires_on| expires_on - Utc::now().timestamp())
        .and_then(|remaining| u64::try_from(remaining).ok())
        .map(Duration::from_secs)
        .unwrap_or(CLI_FALLBACK_LIFETIME)
}

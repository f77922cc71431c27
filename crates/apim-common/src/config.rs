//! ---
//! apim_section: "01-core-functionality"
//! apim_subsection: "module"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Shared configuration and logging primitives for the harness."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;
use url::Url;

use crate::logging::LogFormat;

fn default_module_dir() -> PathBuf {
    PathBuf::from("..")
}

fn default_terraform_binary() -> PathBuf {
    PathBuf::from("terraform")
}

fn default_work_root() -> PathBuf {
    PathBuf::from("target/apim-harness/workspaces")
}

fn default_skip_entries() -> Vec<String> {
    vec![
        ".terraform".to_owned(),
        ".terraform.lock.hcl".to_owned(),
        ".git".to_owned(),
        "test".to_owned(),
        "target".to_owned(),
    ]
}

fn default_management_endpoint() -> String {
    "https://management.azure.com".to_owned()
}

fn default_login_endpoint() -> String {
    "https://login.microsoftonline.com".to_owned()
}

fn default_api_version() -> String {
    "2022-08-01".to_owned()
}

fn default_scenario_timeout() -> Duration {
    Duration::from_secs(90 * 60)
}

fn default_destroy_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_read_initial_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_read_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_read_jitter() -> Duration {
    Duration::from_millis(500)
}

fn default_apply_interrupt_grace() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_max_parallel() -> usize {
    3
}

fn default_location() -> String {
    "East US".to_owned()
}

fn default_environment() -> String {
    "test".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for a harness run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarnessConfig {
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`HarnessConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHarnessConfig {
    pub config: HarnessConfig,
    pub source: Option<PathBuf>,
}

impl HarnessConfig {
    pub const ENV_CONFIG_PATH: &'static str = "APIM_HARNESS_CONFIG";

    /// Load configuration from disk, respecting the `APIM_HARNESS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// Unlike a daemon, the harness can run on defaults: when no candidate
    /// exists the built-in configuration is validated and returned with no source.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHarnessConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(LoadedHarnessConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading harness configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<HarnessConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.module.validate()?;
        self.provider.validate()?;
        self.timeouts.validate()?;
        self.run.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for HarnessConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: HarnessConfig =
            toml::from_str(content).with_context(|| "failed to parse harness configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Location of the module under test and how to drive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_module_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_terraform_binary")]
    pub terraform_binary: PathBuf,
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Top-level entries of `dir` that are never copied into scenario workspaces.
    #[serde(default = "default_skip_entries")]
    pub skip_entries: Vec<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            dir: default_module_dir(),
            terraform_binary: default_terraform_binary(),
            work_root: default_work_root(),
            skip_entries: default_skip_entries(),
        }
    }
}

impl ModuleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.terraform_binary.as_os_str().is_empty() {
            return Err(anyhow!("module.terraform_binary must not be empty"));
        }
        if self.work_root.as_os_str().is_empty() {
            return Err(anyhow!("module.work_root must not be empty"));
        }
        Ok(())
    }
}

/// Cloud provider endpoint settings. Secrets never live in this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default = "default_management_endpoint")]
    pub management_endpoint: String,
    #[serde(default = "default_login_endpoint")]
    pub login_endpoint: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            subscription_id: None,
            management_endpoint: default_management_endpoint(),
            login_endpoint: default_login_endpoint(),
            api_version: default_api_version(),
        }
    }
}

impl ProviderConfig {
    pub const ENV_SUBSCRIPTION_ID: &'static str = "ARM_SUBSCRIPTION_ID";
    pub const ENV_TENANT_ID: &'static str = "ARM_TENANT_ID";
    pub const ENV_CLIENT_ID: &'static str = "ARM_CLIENT_ID";
    pub const ENV_CLIENT_SECRET: &'static str = "ARM_CLIENT_SECRET";
    pub const ENV_USE_MSI: &'static str = "ARM_USE_MSI";
    pub const ENV_ACCESS_TOKEN: &'static str = "ARM_ACCESS_TOKEN";

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("provider.management_endpoint", &self.management_endpoint),
            ("provider.login_endpoint", &self.login_endpoint),
        ] {
            Url::parse(value)
                .with_context(|| format!("{name} '{value}' is not a valid URL"))?;
        }
        if self.api_version.trim().is_empty() {
            return Err(anyhow!("provider.api_version must not be empty"));
        }
        Ok(())
    }

    /// Resolve the credential bundle from configuration and the process
    /// environment, using the same `ARM_*` variables the azurerm provider reads.
    pub fn resolve_credentials(&self) -> Result<ProviderCredentials> {
        self.resolve_credentials_with(|name| std::env::var(name).ok())
    }

    /// Token source precedence: service principal, managed identity, a
    /// pre-issued `ARM_ACCESS_TOKEN`, then the Azure CLI login.
    pub fn resolve_credentials_with<F>(&self, lookup: F) -> Result<ProviderCredentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let subscription_id = match &self.subscription_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => env(Self::ENV_SUBSCRIPTION_ID).ok_or_else(|| {
                anyhow!(
                    "{} must be exported before running against a live provider",
                    Self::ENV_SUBSCRIPTION_ID
                )
            })?,
        };
        let tenant_id = env(Self::ENV_TENANT_ID);
        let client_id = env(Self::ENV_CLIENT_ID);
        let use_msi = env(Self::ENV_USE_MSI)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));

        let client_secret = env(Self::ENV_CLIENT_SECRET);

        let token_source = match (tenant_id, client_id, client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                TokenSource::ServicePrincipal {
                    tenant_id,
                    client_id,
                    client_secret,
                }
            }
            (_, client_id, _) if use_msi => TokenSource::ManagedIdentity { client_id },
            (tenant_id, _, _) => match env(Self::ENV_ACCESS_TOKEN) {
                Some(token) => TokenSource::Static(token),
                None => TokenSource::AzureCli { tenant_id },
            },
        };
        Ok(ProviderCredentials::new(subscription_id, token_source))
    }
}

/// Where bearer tokens for the management API come from.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Client-credentials grant against the login endpoint.
    ServicePrincipal {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    /// Instance metadata service; `client_id` picks a user-assigned identity.
    ManagedIdentity { client_id: Option<String> },
    /// Pre-issued token. Expires on its own schedule.
    Static(String),
    /// `az account get-access-token`.
    AzureCli { tenant_id: Option<String> },
}

impl TokenSource {
    pub fn kind(&self) -> &'static str {
        match self {
            TokenSource::ServicePrincipal { .. } => "service_principal",
            TokenSource::ManagedIdentity { .. } => "managed_identity",
            TokenSource::Static(_) => "static",
            TokenSource::AzureCli { .. } => "azure_cli",
        }
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            TokenSource::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            TokenSource::Static(_) => f.debug_tuple("Static").field(&"<redacted>").finish(),
            TokenSource::AzureCli { tenant_id } => f
                .debug_struct("AzureCli")
                .field("tenant_id", tenant_id)
                .finish(),
        }
    }
}

/// Read-only provider credentials shared by every scenario of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    subscription_id: String,
    token_source: TokenSource,
}

impl ProviderCredentials {
    pub fn new(subscription_id: impl Into<String>, token_source: TokenSource) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            token_source,
        }
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn token_source(&self) -> &TokenSource {
        &self.token_source
    }
}

/// Time bounds applied to each scenario. APIM provisioning is minutes-scale,
/// hence the generous defaults.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_scenario_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub scenario: Duration,
    #[serde(default = "default_destroy_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub destroy: Duration,
    #[serde(default = "default_read_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,
    #[serde(default = "default_read_initial_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_initial_backoff: Duration,
    #[serde(default = "default_read_max_backoff")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_max_backoff: Duration,
    #[serde(default = "default_read_jitter", rename = "read_jitter_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub read_jitter: Duration,
    /// How long an interrupted apply may take to stop and record its state
    /// before it is killed.
    #[serde(default = "default_apply_interrupt_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub apply_interrupt_grace: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scenario: default_scenario_timeout(),
            destroy: default_destroy_timeout(),
            read_timeout: default_read_timeout(),
            read_initial_backoff: default_read_initial_backoff(),
            read_max_backoff: default_read_max_backoff(),
            read_jitter: default_read_jitter(),
            apply_interrupt_grace: default_apply_interrupt_grace(),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("timeouts.scenario", self.scenario),
            ("timeouts.destroy", self.destroy),
            ("timeouts.read_timeout", self.read_timeout),
            ("timeouts.read_initial_backoff", self.read_initial_backoff),
            ("timeouts.read_max_backoff", self.read_max_backoff),
            ("timeouts.apply_interrupt_grace", self.apply_interrupt_grace),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{name} must be greater than zero"));
            }
        }
        if self.read_initial_backoff > self.read_max_backoff {
            return Err(anyhow!(
                "timeouts.read_initial_backoff must not exceed timeouts.read_max_backoff"
            ));
        }
        if self.read_initial_backoff > self.read_timeout {
            return Err(anyhow!(
                "timeouts.read_initial_backoff must not exceed timeouts.read_timeout"
            ));
        }
        Ok(())
    }
}

/// Scenario-wide defaults and scheduling limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            location: default_location(),
            environment: default_environment(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("run.max_parallel must be at least 1"));
        }
        if self.location.trim().is_empty() {
            return Err(anyhow!("run.location must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_validate() {
        let config = HarnessConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.run.max_parallel, 3);
        assert_eq!(config.timeouts.read_timeout, Duration::from_secs(300));
        assert_eq!(config.timeouts.read_jitter, Duration::from_millis(500));
    }

    #[test]
    fn parses_partial_document() {
        let config: HarnessConfig = r#"
            [module]
            dir = "modules/api-management"

            [timeouts]
            scenario = 600
            read_initial_backoff = 1
            read_max_backoff = 4
            read_jitter_ms = 0
            apply_interrupt_grace = 30

            [run]
            max_parallel = 8
            location = "West Europe"
        "#
        .parse()
        .expect("config parses");
        assert_eq!(config.module.dir, PathBuf::from("modules/api-management"));
        assert_eq!(config.module.terraform_binary, PathBuf::from("terraform"));
        assert_eq!(config.timeouts.scenario, Duration::from_secs(600));
        assert_eq!(config.timeouts.read_max_backoff, Duration::from_secs(4));
        assert!(config.timeouts.read_jitter.is_zero());
        assert_eq!(config.timeouts.apply_interrupt_grace, Duration::from_secs(30));
        assert_eq!(config.run.max_parallel, 8);
        assert_eq!(config.run.environment, "test");
    }

    #[test]
    fn rejects_zero_parallelism() {
        let err = "[run]\nmax_parallel = 0\n"
            .parse::<HarnessConfig>()
            .expect_err("zero parallelism is invalid");
        assert!(err.to_string().contains("max_parallel"));
    }

    #[test]
    fn rejects_backoff_larger_than_cap() {
        let err = "[timeouts]\nread_initial_backoff = 30\nread_max_backoff = 10\n"
            .parse::<HarnessConfig>()
            .expect_err("inverted backoff is invalid");
        assert!(err.to_string().contains("read_initial_backoff"));
    }

    #[test]
    fn rejects_bad_management_endpoint() {
        let err = "[provider]\nmanagement_endpoint = \"not a url\"\n"
            .parse::<HarnessConfig>()
            .expect_err("endpoint must parse");
        assert!(format!("{err:#}").contains("management_endpoint"));
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harness.toml");
        fs::write(&path, "[run]\nmax_parallel = 2\n").expect("write config");
        let missing = dir.path().join("missing.toml");
        let loaded = HarnessConfig::load_with_source(&[missing, path.clone()]).expect("load");
        assert_eq!(loaded.source, Some(path));
        assert_eq!(loaded.config.run.max_parallel, 2);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = ProviderCredentials::new(
            "sub-1",
            TokenSource::ServicePrincipal {
                tenant_id: "tenant".into(),
                client_id: "client".into(),
                client_secret: "super-secret".into(),
            },
        );
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("sub-1"));
        assert!(rendered.contains("client"));
        assert!(!rendered.contains("super-secret"));

        let creds = ProviderCredentials::new("sub-1", TokenSource::Static("raw-token".into()));
        assert!(!format!("{creds:?}").contains("raw-token"));
    }

    #[test]
    fn service_principal_wins_over_static_token() {
        let creds = ProviderConfig::default()
            .resolve_credentials_with(lookup(&[
                ("ARM_SUBSCRIPTION_ID", "sub-1"),
                ("ARM_TENANT_ID", "tenant"),
                ("ARM_CLIENT_ID", "client"),
                ("ARM_CLIENT_SECRET", "secret"),
                ("ARM_ACCESS_TOKEN", "stale"),
            ]))
            .expect("credentials");
        assert_eq!(creds.token_source().kind(), "service_principal");
    }

    #[test]
    fn token_source_falls_back_to_cli_login() {
        let provider = ProviderConfig {
            subscription_id: Some("sub-from-file".into()),
            ..ProviderConfig::default()
        };
        let msi = provider
            .resolve_credentials_with(lookup(&[("ARM_USE_MSI", "true"), ("ARM_CLIENT_ID", "uami")]))
            .expect("msi");
        assert_eq!(
            msi.token_source(),
            &TokenSource::ManagedIdentity {
                client_id: Some("uami".into())
            }
        );

        let fixed = provider
            .resolve_credentials_with(lookup(&[("ARM_ACCESS_TOKEN", "abc")]))
            .expect("static");
        assert_eq!(fixed.token_source(), &TokenSource::Static("abc".into()));

        let cli = provider
            .resolve_credentials_with(lookup(&[("ARM_TENANT_ID", "tenant")]))
            .expect("cli");
        assert_eq!(cli.subscription_id(), "sub-from-file");
        assert_eq!(
            cli.token_source(),
            &TokenSource::AzureCli {
                tenant_id: Some("tenant".into())
            }
        );
    }

    #[test]
    fn subscription_is_required() {
        let err = ProviderConfig::default()
            .resolve_credentials_with(lookup(&[]))
            .expect_err("no subscription");
        assert!(err.to_string().contains("ARM_SUBSCRIPTION_ID"));
    }
}

//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "binary"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Command-line runner for the API Management acceptance scenarios."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use apim_common::{HarnessConfig, LogFormat};
use apim_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use apim_testharness::adapters::{
    ArmStateReader, MemoryBackend, MemoryCloud, MemoryStateReader, TerraformBackend,
};
use apim_testharness::catalog::{self, CatalogSettings};
use apim_testharness::{LifecycleOrchestrator, RunReport, TestRunCoordinator};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

const DEFAULT_CONFIG: &str = "apim-harness.toml";

/// Exit status when at least one scenario may have left resources behind.
const EXIT_LEAKED: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Acceptance harness for the API Management Terraform module",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision, validate and destroy the selected scenarios.
    Run(RunCommand),
    /// Print the names of the built-in scenarios.
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    /// Real Terraform applies against Azure.
    Terraform,
    /// In-process emulation; provisions nothing.
    Memory,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    StructuredJson,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::StructuredJson => LogFormat::StructuredJson,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Args)]
struct RunCommand {
    /// Harness configuration file (falls back to APIM_HARNESS_CONFIG, then ./apim-harness.toml).
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Scenario to run; repeat to select several. Runs the whole catalog when omitted.
    #[arg(long = "scenario", short = 's', value_name = "NAME")]
    scenarios: Vec<String>,

    #[arg(long, value_enum, default_value_t = BackendArg::Terraform)]
    backend: BackendArg,

    /// Upper bound on concurrently provisioned scenarios.
    #[arg(long, value_name = "N")]
    max_parallel: Option<usize>,

    #[arg(long = "log-format", value_enum)]
    log_format: Option<LogFormatArg>,

    /// Write the JSON run report here instead of stdout.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::List => {
            for name in catalog::NAMES {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(cmd) => cmd.execute().await,
    }
}

impl RunCommand {
    async fn execute(self) -> Result<ExitCode> {
        let candidates = match &self.config {
            Some(path) if !path.exists() => bail!("config file {} does not exist", path.display()),
            Some(path) => vec![path.clone()],
            None => vec![PathBuf::from(DEFAULT_CONFIG)],
        };
        let loaded = HarnessConfig::load_with_source(&candidates)?;
        let mut config = loaded.config;
        if let Some(max_parallel) = self.max_parallel {
            config.run.max_parallel = max_parallel;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format.into();
        }
        config.validate()?;

        apim_common::init_tracing("apim-harness", &config.logging)?;
        info!(
            config = %loaded
                .source
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_owned()),
            "configuration loaded"
        );

        let templates = catalog::select(&CatalogSettings::from_run(&config.run), &self.scenarios)?;
        let orchestrator = match self.backend {
            BackendArg::Terraform => {
                let credentials = Arc::new(config.provider.resolve_credentials()?);
                let backend = TerraformBackend::new(&config.module)
                    .with_credentials(Arc::clone(&credentials));
                let reader = ArmStateReader::new(&config.provider, credentials)
                    .context("failed to build the management API client")?;
                LifecycleOrchestrator::new(Arc::new(backend), Arc::new(reader), &config.timeouts)
            }
            BackendArg::Memory => {
                let cloud = MemoryCloud::new();
                LifecycleOrchestrator::new(
                    Arc::new(MemoryBackend::new(Arc::clone(&cloud))),
                    Arc::new(MemoryStateReader::new(cloud)),
                    &config.timeouts,
                )
            }
        };

        let coordinator = TestRunCoordinator::new(orchestrator, config.run.max_parallel);
        let report = coordinator.run_until_interrupted(templates).await;
        self.write_report(&report)?;
        Ok(exit_code(&report))
    }

    fn write_report(&self, report: &RunReport) -> Result<()> {
        let rendered = serde_json::to_string_pretty(report)?;
        match &self.report {
            Some(path) => std::fs::write(path, rendered)
                .with_context(|| format!("failed to write report to {}", path.display()))?,
            None => println!("{rendered}"),
        }
        Ok(())
    }
}

fn exit_code(report: &RunReport) -> ExitCode {
    for outcome in report.leaked() {
        let context = LogContext::new()
            .with_scenario(&outcome.scenario)
            .with_identity(outcome.identity.as_deref().unwrap_or_default());
        log_lifecycle_event(
            Some(&context),
            "run.leak",
            "resources may remain; destroy them out of band",
            LifecycleOutcome::Leak,
        );
    }
    if report.leaked().next().is_some() {
        ExitCode::from(EXIT_LEAKED)
    } else if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

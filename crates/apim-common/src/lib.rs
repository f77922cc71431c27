//! ---
//! apim_section: "01-core-functionality"
//! apim_subsection: "module"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Shared configuration and logging primitives for the harness."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! Shared primitives for the APIM acceptance harness workspace.
//! This crate exposes configuration loading, the read-only provider
//! credential bundle, and the tracing bootstrap consumed by the harness
//! binary and its adapters.

pub mod config;
pub mod logging;

pub use config::{
    HarnessConfig, LoadedHarnessConfig, LoggingConfig, ModuleConfig, ProviderConfig,
    ProviderCredentials, RunConfig, TimeoutConfig, TokenSource,
};
pub use logging::{init_tracing, LogFormat};

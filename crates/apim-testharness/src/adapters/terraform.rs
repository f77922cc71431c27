//! ---
//! apim_section: "11-acceptance"
//! apim_subsection: "06-adapters"
//! apim_type: "source"
//! apim_scope: "code"
//! apim_description: "Terraform CLI provisioning backend with per-identity workspaces."
//! apim_version: "v0.1.0"
//! apim_owner: "platform-qa"
//! ---
//! Each scenario gets a private copy of the module under
//! `<work_root>/<identity>` so concurrent applies never share a state file.
//! Variables are written as `terraform.tfvars.json`, which Terraform loads
//! automatically.
//!
//! A stop request interrupts the running command with SIGINT, which makes
//! Terraform finish its in-flight calls and persist state before exiting. The
//! orchestrator bounds that wait; only past the bound is the child killed.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use apim_common::{ModuleConfig, ProviderConfig, ProviderCredentials};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backend::{
    AppliedResource, ApplyRequest, ProvisionedResourceHandle, ProvisioningBackend, StopSignal,
};
use crate::error::{ApplyError, DestroyError};
use crate::outputs::OutputSet;
use crate::value::VarMap;

const TFVARS_FILE: &str = "terraform.tfvars.json";
const STDERR_TAIL: usize = 2048;

/// Drives the `terraform` binary against copies of the module directory.
#[derive(Debug, Clone)]
pub struct TerraformBackend {
    binary: PathBuf,
    module_dir: PathBuf,
    work_root: PathBuf,
    skip_entries: Vec<String>,
    credentials: Option<Arc<ProviderCredentials>>,
}

impl TerraformBackend {
    pub fn new(config: &ModuleConfig) -> Self {
        Self {
            binary: config.terraform_binary.clone(),
            module_dir: config.dir.clone(),
            work_root: config.work_root.clone(),
            skip_entries: config.skip_entries.clone(),
            credentials: None,
        }
    }

    /// Export the subscription to every Terraform invocation.
    pub fn with_credentials(mut self, credentials: Arc<ProviderCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Working copy used for `identity`.
    pub fn workspace_for(&self, identity: &str) -> PathBuf {
        self.work_root.join(identity)
    }

    async fn prepare_workspace(&self, request: &ApplyRequest) -> io::Result<PathBuf> {
        let workspace = self.workspace_for(request.identity().as_str());
        let module_dir = self.module_dir.clone();
        let work_root = self.work_root.clone();
        let skip = self.skip_entries.clone();
        let variables = request.variables().clone();
        let target = workspace.clone();
        tokio::task::spawn_blocking(move || {
            copy_module(&module_dir, &target, &work_root, &skip)?;
            write_tfvars(&target, &variables)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(workspace)
    }

    async fn terraform(
        &self,
        workspace: &Path,
        args: &[&str],
        stop: &mut StopSignal,
    ) -> Result<String, String> {
        let verb = args.first().copied().unwrap_or_default();
        if stop.is_raised() {
            return Err(format!("terraform {verb} not started: scenario is stopping"));
        }
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .current_dir(workspace)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(credentials) = &self.credentials {
            command.env(ProviderConfig::ENV_SUBSCRIPTION_ID, credentials.subscription_id());
        }
        debug!(workspace = %workspace.display(), ?args, "running terraform");
        let child = command
            .spawn()
            .map_err(|err| format!("failed to launch {}: {err}", self.binary.display()))?;
        let pid = child.id();
        let output = child.wait_with_output();
        tokio::pin!(output);
        let output = tokio::select! {
            output = &mut output => output,
            _ = stop.raised() => {
                warn!(
                    workspace = %workspace.display(),
                    verb,
                    "interrupting terraform so it can record state"
                );
                interrupt(pid);
                output.await
            }
        };
        let output = output.map_err(|err| format!("terraform {verb} did not complete: {err}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(format!(
                "terraform {verb} exited with {}: {}",
                output.status,
                tail(&String::from_utf8_lossy(&output.stderr))
            ))
        }
    }
}

/// Ask the child to stop the way Ctrl-C would.
#[cfg(unix)]
fn interrupt(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!(pid, error = %err, "failed to interrupt terraform");
    }
}

/// No graceful interrupt off unix; the child runs until the grace period
/// ends and is then killed on drop.
#[cfg(not(unix))]
fn interrupt(_pid: Option<u32>) {}

#[async_trait]
impl ProvisioningBackend for TerraformBackend {
    fn name(&self) -> &'static str {
        "terraform"
    }

    async fn apply(
        &self,
        request: &ApplyRequest,
        mut stop: StopSignal,
    ) -> Result<AppliedResource, ApplyError> {
        let identity = request.identity().as_str().to_owned();
        let workspace = self
            .prepare_workspace(request)
            .await
            .map_err(|err| ApplyError::Workspace {
                identity: identity.clone(),
                message: err.to_string(),
            })?;
        info!(
            identity = %identity,
            workspace = %workspace.display(),
            "terraform workspace ready"
        );

        let init = ["init", "-input=false", "-no-color"];
        if let Err(message) = self.terraform(&workspace, &init, &mut stop).await {
            if let Err(err) = tokio::fs::remove_dir_all(&workspace).await {
                warn!(
                    identity = %identity,
                    error = %err,
                    "failed to remove workspace after init failure"
                );
            }
            return Err(ApplyError::Provisioning {
                identity,
                message,
                partial: None,
            });
        }

        let handle = request.handle(Some(workspace.clone()));
        let apply = ["apply", "-auto-approve", "-input=false", "-no-color"];
        self.terraform(&workspace, &apply, &mut stop)
            .await
            .map_err(|message| ApplyError::Provisioning {
                identity: identity.clone(),
                message,
                partial: Some(handle.clone()),
            })?;

        let raw = self
            .terraform(&workspace, &["output", "-json", "-no-color"], &mut stop)
            .await
            .map_err(|message| ApplyError::Outputs {
                identity: identity.clone(),
                message,
                partial: Some(handle.clone()),
            })?;
        let outputs = OutputSet::from_terraform_json(&raw).map_err(|err| ApplyError::Outputs {
            identity: identity.clone(),
            message: err.to_string(),
            partial: Some(handle.clone()),
        })?;
        info!(identity = %identity, outputs = outputs.len(), "terraform apply complete");
        Ok(AppliedResource { outputs, handle })
    }

    async fn destroy(&self, handle: &ProvisionedResourceHandle) -> Result<(), DestroyError> {
        let failed = |message: String| DestroyError::Failed {
            identity: handle.identity().to_owned(),
            message,
        };
        let workspace = handle
            .workspace()
            .ok_or_else(|| failed("handle carries no terraform workspace".into()))?;
        let destroy = ["destroy", "-auto-approve", "-input=false", "-no-color"];
        self.terraform(workspace, &destroy, &mut StopSignal::never())
            .await
            .map_err(failed)?;
        if let Err(err) = tokio::fs::remove_dir_all(workspace).await {
            warn!(
                identity = %handle.identity(),
                error = %err,
                "destroyed but workspace removal failed"
            );
        }
        info!(identity = %handle.identity(), "terraform destroy complete");
        Ok(())
    }

    fn salvage(&self, request: &ApplyRequest) -> Option<ProvisionedResourceHandle> {
        let workspace = self.workspace_for(request.identity().as_str());
        workspace
            .join(".terraform")
            .exists()
            .then(|| request.handle(Some(workspace)))
    }
}

/// Copy `module_dir` into `target`, skipping named entries and the work root
/// itself (which may live inside the module).
fn copy_module(
    module_dir: &Path,
    target: &Path,
    work_root: &Path,
    skip: &[String],
) -> io::Result<()> {
    std::fs::create_dir_all(target)?;
    let work_root = work_root.canonicalize().unwrap_or_else(|_| work_root.to_path_buf());
    let walker = WalkDir::new(module_dir).min_depth(1).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        let inside_work_root = entry
            .path()
            .canonicalize()
            .map(|path| path.starts_with(&work_root))
            .unwrap_or(false);
        !skip.iter().any(|s| *s == name) && !inside_work_root
    });
    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(module_dir)
            .map_err(io::Error::other)?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

fn write_tfvars(workspace: &Path, variables: &VarMap) -> io::Result<()> {
    let rendered = serde_json::to_vec_pretty(variables).map_err(io::Error::other)?;
    std::fs::write(workspace.join(TFVARS_FILE), rendered)
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

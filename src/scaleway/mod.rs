//! Scaleway Instances control plane driven through the `scw` CLI.
//!
//! Every server created here carries the [`PROVIDER_TAG`] tag plus a tag
//! naming its create request, so a single tag-filtered listing answers every
//! fetch and lets lost ledger entries be rediscovered.

mod error;
mod types;

use std::ffi::OsString;

use tracing::{info, warn};

use crate::backend::{
    ControlPlane, FetchScope, NativeState, ProvisionRequest, ProvisionedMachine, RemoteState,
};
use crate::config::ScalewayConfig;
use crate::ledger::MachineRef;
use crate::request_id::CREATE_PREFIX;
use crate::runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
use types::{ScwServer, ServerEnvelope, ServerList};

pub use error::ScalewayError;
pub use types::{ACCOUNT_TAG_PREFIX, PROVIDER_TAG, REQUEST_TAG_PREFIX};

/// Control plane that shells out to `scw` with JSON output.
#[derive(Clone, Debug)]
pub struct ScalewayControlPlane<R: CommandRunner> {
    config: ScalewayConfig,
    runner: R,
}

impl ScalewayControlPlane<ProcessCommandRunner> {
    /// Creates a control plane wired to the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayError::Config`] when the configuration is invalid.
    pub fn with_process_runner(config: ScalewayConfig) -> Result<Self, ScalewayError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> ScalewayControlPlane<R> {
    /// Creates a control plane using the provided configuration and runner.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayError::Config`] when the configuration is invalid.
    pub fn new(config: ScalewayConfig, runner: R) -> Result<Self, ScalewayError> {
        config
            .validate()
            .map_err(|err| ScalewayError::Config(err.to_string()))?;
        Ok(Self { config, runner })
    }

    fn check_scw_output(
        &self,
        output: CommandOutput,
        resource: &str,
    ) -> Result<CommandOutput, ScalewayError> {
        if output.is_success() {
            return Ok(output);
        }

        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(ScalewayError::CommandFailure {
            program: self.config.scw_bin.clone(),
            status: output.code,
            status_text,
            stderr: format!("{resource}: {}", output.stderr.trim()),
        })
    }

    fn run_scw(&self, args: &[OsString], resource: &str) -> Result<String, ScalewayError> {
        let output = self.runner.run(&self.config.scw_bin, args)?;
        self.check_scw_output(output, resource)
            .map(|out| out.stdout)
    }

    fn build_list_args(&self) -> Vec<OsString> {
        vec![
            OsString::from("instance"),
            OsString::from("server"),
            OsString::from("list"),
            OsString::from(format!("project-id={}", self.config.default_project_id)),
            OsString::from("zone=all"),
            OsString::from(format!("tags.0={PROVIDER_TAG}")),
            OsString::from("-o"),
            OsString::from("json"),
        ]
    }

    fn list_servers(&self) -> Result<Vec<ScwServer>, ScalewayError> {
        let stdout = self.run_scw(&self.build_list_args(), "servers")?;
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str::<ServerList>(&stdout)
            .map(ServerList::into_servers)
            .map_err(|err| ScalewayError::Parse {
                resource: String::from("servers"),
                message: err.to_string(),
            })
    }

    fn build_create_args(&self, request: &ProvisionRequest, index: u32) -> Vec<OsString> {
        let template = &request.template;
        let zone = template
            .zone
            .as_deref()
            .unwrap_or(&self.config.default_zone);
        let mut tags = vec![
            String::from(PROVIDER_TAG),
            format!("{REQUEST_TAG_PREFIX}{}", request.request_id),
        ];
        if let Some(account) = request.rc_account.as_deref() {
            tags.push(format!("{ACCOUNT_TAG_PREFIX}{account}"));
        }
        tags.extend(template.tags.iter().cloned());
        tags.extend(request.extra_tags.iter().cloned());

        let mut args = vec![
            OsString::from("instance"),
            OsString::from("server"),
            OsString::from("create"),
            OsString::from(format!("type={}", template.instance_type)),
            OsString::from(format!("image={}", template.image)),
            OsString::from(format!(
                "name={}",
                server_name(&request.request_id, index)
            )),
            OsString::from(format!("zone={zone}")),
            OsString::from(format!("project-id={}", self.config.default_project_id)),
        ];
        args.extend(
            tags.iter()
                .enumerate()
                .map(|(position, tag)| OsString::from(format!("tags.{position}={tag}"))),
        );
        args.push(OsString::from("-o"));
        args.push(OsString::from("json"));
        args
    }

    fn create_one(
        &self,
        request: &ProvisionRequest,
        index: u32,
    ) -> Result<ProvisionedMachine, ScalewayError> {
        let stdout = self.run_scw(&self.build_create_args(request, index), "server create")?;
        serde_json::from_str::<ServerEnvelope>(&stdout)
            .map(|envelope| envelope.into_server().into_provisioned())
            .map_err(|err| ScalewayError::Parse {
                resource: String::from("server"),
                message: err.to_string(),
            })
    }

    fn resolve(&self, machine: &MachineRef) -> Result<Option<(String, String)>, ScalewayError> {
        if let (Some(id), Some(zone)) = (machine.machine_id.as_ref(), machine.zone.as_ref()) {
            return Ok(Some((id.clone(), zone.clone())));
        }
        let state = RemoteState::from_machines(
            self.list_servers()?
                .into_iter()
                .map(ScwServer::into_remote),
        );
        Ok(state.find(machine).map(|remote| {
            (
                remote.machine_id.clone(),
                remote
                    .zone
                    .clone()
                    .unwrap_or_else(|| self.config.default_zone.clone()),
            )
        }))
    }
}

impl<R: CommandRunner> ControlPlane for ScalewayControlPlane<R> {
    type Error = ScalewayError;

    fn fetch(&self, scope: FetchScope<'_>) -> Result<RemoteState, Self::Error> {
        let servers = self
            .list_servers()?
            .into_iter()
            .filter(ScwServer::is_managed)
            .map(ScwServer::into_remote);
        let state = match scope {
            FetchScope::All => RemoteState::from_machines(servers),
            FetchScope::Machines(refs) => RemoteState::from_machines(servers.filter(|remote| {
                refs.iter().any(|reference| {
                    reference.machine_id.as_deref() == Some(remote.machine_id.as_str())
                        || reference.name.as_deref() == Some(remote.name.as_str())
                })
            })),
        };
        Ok(state)
    }

    fn create(&self, request: &ProvisionRequest) -> Result<Vec<ProvisionedMachine>, Self::Error> {
        let mut created = Vec::new();
        for index in 0..request.count {
            match self.create_one(request, index) {
                Ok(machine) => {
                    info!(
                        request_id = %request.request_id,
                        machine_id = ?machine.machine_id,
                        name = %machine.name,
                        "created server"
                    );
                    created.push(machine);
                }
                Err(err) if created.is_empty() => return Err(err),
                Err(err) => {
                    warn!(
                        request_id = %request.request_id,
                        created = created.len(),
                        requested = request.count,
                        error = %err,
                        "server creation stopped early"
                    );
                    break;
                }
            }
        }
        Ok(created)
    }

    fn terminate(&self, machine: &MachineRef) -> Result<(), Self::Error> {
        let Some((machine_id, zone)) = self.resolve(machine)? else {
            info!(reference = ?machine, "server already gone, nothing to terminate");
            return Ok(());
        };
        let args = vec![
            OsString::from("instance"),
            OsString::from("server"),
            OsString::from("delete"),
            OsString::from(&machine_id),
            OsString::from(format!("zone={zone}")),
            OsString::from("with-ip=true"),
            OsString::from("with-volumes=all"),
            OsString::from("force-shutdown=true"),
        ];
        self.run_scw(&args, "server delete")?;
        info!(machine_id = %machine_id, zone = %zone, "requested server deletion");
        Ok(())
    }

    fn classify(&self, native_state: &str) -> NativeState {
        classify_state(native_state)
    }
}

/// Maps Scaleway server states onto [`NativeState`].
#[must_use]
pub fn classify_state(native_state: &str) -> NativeState {
    match native_state.trim().to_ascii_lowercase().as_str() {
        "starting" | "stopping" => NativeState::Transitional,
        "running" => NativeState::Running,
        "stopped" | "stopped in place" => NativeState::Stopped,
        _ => NativeState::Failed,
    }
}

/// Builds a DNS-safe server name from the request id and machine index.
fn server_name(request_id: &str, index: u32) -> String {
    let short: String = request_id
        .strip_prefix(CREATE_PREFIX)
        .unwrap_or(request_id)
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("{PROVIDER_TAG}-{short}-{index}")
}

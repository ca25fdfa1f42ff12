//! Binary entry point for the `hostprov` host provider.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tracing::error;

use hostprov::clock::SystemClock;
use hostprov::config::{ConfigError, ProviderConfig, ScalewayConfig};
use hostprov::context::ProviderContext;
use hostprov::logging::{self, LoggingError};
use hostprov::operations::{
    self, Operation, OperationError, OperationKind, Operations, Response, read_input,
};
use hostprov::protocol::{ErrorResponse, ProtocolError};
use hostprov::scaleway::{ScalewayControlPlane, ScalewayError};

use cli::{Cli, Command};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Input(#[from] ProtocolError),
    #[error("backend error: {0}")]
    Backend(#[from] ScalewayError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("failed to render response: {0}")]
    Render(String),
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(&cli) {
        Ok(document) => {
            write_document(io::stdout(), &document);
            0
        }
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn dispatch(cli: &Cli) -> Result<String, CliError> {
    let (kind, input) = operation_kind(&cli.command);
    let config = apply_overrides(cli, ProviderConfig::load_without_cli_args()?);
    let context = ProviderContext::from_config(&config)?;
    logging::init(&context, &config.log_level)?;
    context.check_directories()?;

    let raw = if kind.takes_input() {
        read_input(input.map(Utf8Path::new))?
    } else {
        String::new()
    };
    let operation = Operation::decode(kind, &raw)?;
    let response = execute(&context, operation)?;
    render(&response)
}

fn execute(context: &ProviderContext, operation: Operation) -> Result<Response, CliError> {
    if let Some(result) = operations::run_offline(context, &operation) {
        return Ok(result?);
    }
    let scaleway = ScalewayConfig::load_without_cli_args()?;
    let plane = ScalewayControlPlane::with_process_runner(scaleway)?;
    Ok(Operations::new(context, &plane, &SystemClock).run(operation)?)
}

fn operation_kind(command: &Command) -> (OperationKind, Option<&str>) {
    match command {
        Command::GetAvailableTemplates => (OperationKind::GetAvailableTemplates, None),
        Command::RequestMachines(args) => (OperationKind::RequestMachines, args.input.as_deref()),
        Command::RequestReturnMachines(args) => {
            (OperationKind::RequestReturnMachines, args.input.as_deref())
        }
        Command::GetRequestStatus(args) => (OperationKind::GetRequestStatus, args.input.as_deref()),
        Command::GetReturnRequests(args) => {
            (OperationKind::GetReturnRequests, args.input.as_deref())
        }
        Command::GetAvailableMachines => (OperationKind::GetAvailableMachines, None),
    }
}

/// Command-line flags and host factory variables win over files and
/// `HOSTPROV_*` variables.
fn apply_overrides(cli: &Cli, mut config: ProviderConfig) -> ProviderConfig {
    if let Some(work_dir) = &cli.work_dir {
        config.work_dir.clone_from(work_dir);
    }
    if let Some(conf_dir) = &cli.conf_dir {
        config.conf_dir.clone_from(conf_dir);
    }
    if let Some(provider_name) = &cli.provider_name {
        config.provider_name.clone_from(provider_name);
    }
    if cli.log_dir.is_some() {
        config.log_dir.clone_from(&cli.log_dir);
    }
    config
}

fn render(response: &Response) -> Result<String, CliError> {
    serde_json::to_string_pretty(response).map_err(|err| CliError::Render(err.to_string()))
}

fn report_error(err: &CliError) {
    error!(error = %err, "operation failed");
    let document = serde_json::to_string_pretty(&ErrorResponse::new(err.to_string()))
        .unwrap_or_else(|_| String::from(r#"{"status":"complete_with_error"}"#));
    write_document(io::stdout(), &document);
    write_error(io::stderr(), err);
}

fn write_document(mut target: impl Write, document: &str) {
    writeln!(target, "{document}").ok();
    target.flush().ok();
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

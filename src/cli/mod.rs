//! Command-line interface definitions for the `hostprov` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `hostprov` binary.
#[derive(Debug, Parser)]
#[command(
    name = "hostprov",
    about = "Elastic host provider that provisions Scaleway servers for an HPC host factory",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Directory holding the request ledger.
    #[arg(long, global = true, env = "PRO_DATA_DIR", value_name = "DIR")]
    pub(crate) work_dir: Option<String>,
    /// Directory holding the template catalog.
    #[arg(long, global = true, env = "PRO_CONF_DIR", value_name = "DIR")]
    pub(crate) conf_dir: Option<String>,
    /// Provider instance name, used for the ledger and log file names.
    #[arg(long, global = true, env = "PROVIDER_NAME", value_name = "NAME")]
    pub(crate) provider_name: Option<String>,
    /// Directory for the provider log file; logs go to stderr when unset.
    #[arg(long, global = true, env = "PRO_LOG_DIR", value_name = "DIR")]
    pub(crate) log_dir: Option<String>,
    /// Operation requested by the host factory.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Host factory operations.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// List the templates this provider offers.
    #[command(name = "get-available-templates", visible_alias = "getAvailableTemplates")]
    GetAvailableTemplates,
    /// Create machines from a template.
    #[command(name = "request-machines", visible_alias = "requestMachines")]
    RequestMachines(InputArgs),
    /// Return machines to the provider.
    #[command(name = "request-return-machines", visible_alias = "requestReturnMachines")]
    RequestReturnMachines(InputArgs),
    /// Poll create and return requests.
    #[command(name = "get-request-status", visible_alias = "getRequestStatus")]
    GetRequestStatus(InputArgs),
    /// Report machines the provider reclaimed on its own.
    #[command(name = "get-return-requests", visible_alias = "getReturnRequests")]
    GetReturnRequests(InputArgs),
    /// List machines that are up and not being returned.
    #[command(name = "get-available-machines", visible_alias = "getAvailableMachines")]
    GetAvailableMachines,
}

/// Input document location shared by operations that take one.
#[derive(Debug, Args)]
pub(crate) struct InputArgs {
    /// JSON input document; read from stdin when omitted or `-`.
    #[arg(short = 'f', long, value_name = "PATH")]
    pub(crate) input: Option<String>,
}

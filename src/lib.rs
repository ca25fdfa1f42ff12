//! Core library for the `hostprov` elastic host provider.
//!
//! An HPC host factory drives the provider through one-shot CLI calls. Each
//! call issues create or return requests against the Scaleway control plane,
//! or reconciles previously issued requests against the remote machine
//! inventory, persisting the outcome in a per-provider JSON ledger.

pub mod backend;
pub mod clock;
pub mod config;
pub mod context;
pub mod issuer;
pub mod ledger;
pub mod logging;
pub mod operations;
pub mod protocol;
pub mod reconcile;
pub mod request_id;
pub mod runner;
pub mod scaleway;
pub mod status;
pub mod templates;
pub mod test_support;
pub mod timeout;

pub use backend::{
    BackendError, ControlPlane, FetchScope, NativeState, ProvisionRequest,
    ProvisionRequestBuilder, RemoteMachine, RemoteState,
};
pub use config::{ConfigError, ProviderConfig, ScalewayConfig};
pub use context::ProviderContext;
pub use ledger::{Ledger, LedgerError, LedgerStore, MachineRecord, MachineRef, RequestRecord};
pub use operations::{Operation, OperationError, OperationKind, Operations, Response};
pub use request_id::{RequestId, RequestKind};
pub use scaleway::{ScalewayControlPlane, ScalewayError};

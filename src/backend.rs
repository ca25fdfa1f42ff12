//! Control-plane abstraction consumed by the reconciliation engine.
//!
//! Providers implement [`ControlPlane`] with four operations: a batched state
//! fetch, bulk creation, termination of a single machine, and classification
//! of native state strings. Everything else lives in the generic engine.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::ledger::{MachineRecord, MachineRef};
use crate::templates::Template;

/// Provider-neutral interpretation of a native state string.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NativeState {
    /// The machine is moving between states (starting, stopping, ...).
    Transitional,
    /// The machine is up. Success for create requests.
    Running,
    /// The machine is stopped or terminated. Success for terminate requests.
    Stopped,
    /// The provider reports the machine as broken or the state is unknown.
    Failed,
}

/// Which machines a fetch should report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchScope<'a> {
    /// Only the referenced machines.
    Machines(&'a [MachineRef]),
    /// Every machine managed by this provider instance.
    All,
}

/// Observable state of one remote machine.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteMachine {
    /// Provider-assigned identifier.
    pub machine_id: String,
    /// Hostname.
    pub name: String,
    /// Native state string as reported by the provider.
    pub state: String,
    /// Private address, when assigned.
    pub private_address: Option<String>,
    /// Public address, when assigned.
    pub public_address: Option<String>,
    /// Zone hosting the machine.
    pub zone: Option<String>,
    /// Create request recorded in the machine's tags, if any.
    pub request_id: Option<String>,
    /// Creation time in epoch seconds, when reported.
    pub launch_time: Option<u64>,
}

impl RemoteMachine {
    /// Returns `true` when the machine has an address the host factory can use.
    #[must_use]
    pub const fn is_addressed(&self) -> bool {
        self.private_address.is_some() || self.public_address.is_some()
    }
}

/// Result of one fetch, keyed by machine identifier.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemoteState {
    machines: BTreeMap<String, RemoteMachine>,
}

impl RemoteState {
    /// Builds a state map from observed machines.
    #[must_use]
    pub fn from_machines(machines: impl IntoIterator<Item = RemoteMachine>) -> Self {
        Self {
            machines: machines
                .into_iter()
                .map(|machine| (machine.machine_id.clone(), machine))
                .collect(),
        }
    }

    /// Looks up a machine by identifier.
    #[must_use]
    pub fn get(&self, machine_id: &str) -> Option<&RemoteMachine> {
        self.machines.get(machine_id)
    }

    /// Finds the remote machine for a ledger record, joining on
    /// `machine_id` and falling back to `name` while the id is unknown.
    #[must_use]
    pub fn lookup(&self, record: &MachineRecord) -> Option<&RemoteMachine> {
        match record.machine_id.as_deref() {
            Some(machine_id) => self.get(machine_id),
            None if record.name.is_empty() => None,
            None => self
                .machines
                .values()
                .find(|machine| machine.name == record.name),
        }
    }

    /// Finds the remote machine matching a caller reference.
    #[must_use]
    pub fn find(&self, reference: &MachineRef) -> Option<&RemoteMachine> {
        self.machines.values().find(|machine| {
            reference
                .machine_id
                .as_deref()
                .is_none_or(|id| id == machine.machine_id)
                && reference
                    .name
                    .as_deref()
                    .is_none_or(|name| name == machine.name)
                && !reference.is_empty()
        })
    }

    /// Iterates machines tagged with create request `request_id`.
    pub fn tagged_with<'a>(
        &'a self,
        request_id: &'a str,
    ) -> impl Iterator<Item = &'a RemoteMachine> + 'a {
        self.machines
            .values()
            .filter(move |machine| machine.request_id.as_deref() == Some(request_id))
    }

    /// Iterates every observed machine.
    pub fn iter(&self) -> impl Iterator<Item = &RemoteMachine> {
        self.machines.values()
    }

    /// Number of observed machines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// Returns `true` when nothing was observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

/// Parameters for one bulk creation call.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionRequest {
    /// Template to provision from.
    pub template: Template,
    /// Number of machines to create.
    pub count: u32,
    /// Create request that will own the machines.
    pub request_id: String,
    /// Account tag supplied by the host factory.
    pub rc_account: Option<String>,
    /// Caller tags applied in addition to the provider tags.
    pub extra_tags: Vec<String>,
}

impl ProvisionRequest {
    /// Starts a builder for a [`ProvisionRequest`].
    #[must_use]
    pub const fn builder(template: Template) -> ProvisionRequestBuilder {
        ProvisionRequestBuilder::new(template)
    }
}

/// Builder for [`ProvisionRequest`] that validates on `build`.
#[derive(Clone, Debug)]
pub struct ProvisionRequestBuilder {
    template: Template,
    count: u32,
    request_id: String,
    rc_account: Option<String>,
    extra_tags: Vec<String>,
}

impl ProvisionRequestBuilder {
    const fn new(template: Template) -> Self {
        Self {
            template,
            count: 1,
            request_id: String::new(),
            rc_account: None,
            extra_tags: Vec::new(),
        }
    }

    /// Sets the number of machines.
    #[must_use]
    pub const fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Sets the owning request identifier.
    #[must_use]
    pub fn request_id(mut self, value: impl Into<String>) -> Self {
        self.request_id = value.into();
        self
    }

    /// Sets the account tag.
    #[must_use]
    pub fn rc_account(mut self, value: Option<String>) -> Self {
        self.rc_account = value.filter(|account| !account.trim().is_empty());
        self
    }

    /// Sets caller tags; blank entries are dropped.
    #[must_use]
    pub fn extra_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.extra_tags = tags
            .into_iter()
            .map(|tag| tag.trim().to_owned())
            .filter(|tag| !tag.is_empty())
            .collect();
        self
    }

    /// Validates and builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the count is zero or the
    /// request id is blank.
    pub fn build(self) -> Result<ProvisionRequest, BackendError> {
        if self.count == 0 {
            return Err(BackendError::Validation(String::from("count")));
        }
        let request_id = self.request_id.trim().to_owned();
        if request_id.is_empty() {
            return Err(BackendError::Validation(String::from("request_id")));
        }
        Ok(ProvisionRequest {
            template: self.template,
            count: self.count,
            request_id,
            rc_account: self.rc_account,
            extra_tags: self.extra_tags,
        })
    }
}

/// A machine reported back by a creation call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionedMachine {
    /// Identifier, when the provider assigns it synchronously.
    pub machine_id: Option<String>,
    /// Hostname.
    pub name: String,
    /// Native state at creation time.
    pub state: String,
    /// Zone hosting the machine.
    pub zone: Option<String>,
}

/// Errors shared by control-plane implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a provisioning request is missing a required field.
    #[error("invalid provisioning request: {0}")]
    Validation(String),
}

/// Remote control plane operated by one provider instance.
pub trait ControlPlane {
    /// Provider specific error type.
    type Error: std::error::Error + 'static;

    /// Fetches current state for `scope` in one bounded round trip.
    ///
    /// # Errors
    ///
    /// Returns the provider error on transport or API failure.
    fn fetch(&self, scope: FetchScope<'_>) -> Result<RemoteState, Self::Error>;

    /// Creates `request.count` machines.
    ///
    /// Returns the machines the provider acknowledged, which may be fewer
    /// than requested.
    ///
    /// # Errors
    ///
    /// Returns the provider error when nothing could be created.
    fn create(&self, request: &ProvisionRequest) -> Result<Vec<ProvisionedMachine>, Self::Error>;

    /// Requests termination of one machine.
    ///
    /// # Errors
    ///
    /// Returns the provider error when the request is rejected.
    fn terminate(&self, machine: &MachineRef) -> Result<(), Self::Error>;

    /// Interprets a native state string.
    fn classify(&self, native_state: &str) -> NativeState;
}

//! Persisted ledger of in-flight and recently completed requests.
//!
//! The ledger is one JSON document per provider work directory. Machine
//! records are stored by value inside their owning create request; terminate
//! requests exist only as a projection over `MachineRecord::return_id`.

mod store;

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::request_id::{RequestId, RequestKind};

pub use store::{LedgerError, LedgerStore};

/// Caller-facing per-machine outcome.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineResult {
    /// The create or terminate operation is still in progress.
    #[default]
    Executing,
    /// The machine reached the goal state of its request.
    Succeed,
    /// The machine failed to reach the goal state.
    Fail,
}

/// Caller-facing request status.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// At least one machine is still executing and none has failed.
    #[default]
    Running,
    /// Every machine succeeded.
    Complete,
    /// At least one machine failed.
    CompleteWithError,
}

impl RequestStatus {
    /// Aggregates machine results with precedence fail > running > complete.
    #[must_use]
    pub fn aggregate(results: impl IntoIterator<Item = MachineResult>) -> Self {
        let mut status = Self::Complete;
        for result in results {
            match result {
                MachineResult::Fail => return Self::CompleteWithError,
                MachineResult::Executing => status = Self::Running,
                MachineResult::Succeed => {}
            }
        }
        status
    }
}

/// One machine tracked by the ledger.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRecord {
    /// Provider-assigned identifier; unknown until the machine materializes.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub machine_id: Option<String>,
    /// Hostname; may be empty until assigned.
    #[serde(default)]
    pub name: String,
    /// Owning create request.
    #[serde(default)]
    pub request_id: String,
    /// Owning terminate request; set at most once.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub return_id: Option<String>,
    /// Template the machine was provisioned from.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub template_id: Option<String>,
    /// Normalized outcome for the owning request.
    #[serde(default)]
    pub result: MachineResult,
    /// Last observed native state, or a reconciliation label.
    #[serde(default)]
    pub status: String,
    /// Private address, once assigned.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub private_ip_address: Option<String>,
    /// Public address, once assigned.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub public_ip_address: Option<String>,
    /// Availability zone hosting the machine.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub zone: Option<String>,
    /// Account tag supplied by the host factory.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub rc_account: Option<String>,
    /// Launch time in epoch seconds; the first-observed time when the
    /// control plane reports none.
    #[serde(default, rename = "launchtime")]
    pub launch_time: u64,
    /// Diagnostic text, populated on failure.
    #[serde(default)]
    pub message: String,
    /// Set once the control plane accepted a termination for this machine;
    /// cleared when a termination call fails.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub termination_requested: bool,
}

impl MachineRecord {
    /// Returns `true` once the machine has been handed to a terminate request.
    #[must_use]
    pub const fn is_returned(&self) -> bool {
        self.return_id.is_some()
    }

    /// Builds a reference suitable for control-plane calls.
    #[must_use]
    pub fn machine_ref(&self) -> MachineRef {
        MachineRef {
            machine_id: self.machine_id.clone(),
            name: non_empty(&self.name),
            zone: self.zone.clone(),
        }
    }
}

/// One create request and the machines it owns.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Engine-assigned identifier; its prefix encodes the kind.
    pub request_id: String,
    /// Aggregated status as of the last poll.
    #[serde(default)]
    pub status: RequestStatus,
    /// Request-level diagnostic text.
    #[serde(default)]
    pub message: String,
    /// Template the request was issued against.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub template_id: Option<String>,
    /// Account tag supplied by the host factory.
    #[serde(
        default,
        rename = "rc_account",
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub rc_account: Option<String>,
    /// Machines owned by the request, in issue order.
    #[serde(default)]
    pub machines: Vec<MachineRecord>,
}

impl RequestRecord {
    /// Recomputes [`RequestRecord::status`] from the results of machines
    /// not yet handed to a terminate request.
    pub fn refresh_status(&mut self) -> RequestStatus {
        self.status = RequestStatus::aggregate(
            self.machines
                .iter()
                .filter(|machine| !machine.is_returned())
                .map(|machine| machine.result),
        );
        self.status
    }
}

/// Caller-supplied machine reference used by terminate requests.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineRef {
    /// Provider-assigned identifier, when known.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub machine_id: Option<String>,
    /// Hostname, when known.
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    /// Zone hint for control-plane calls; never part of matching.
    #[serde(skip)]
    pub zone: Option<String>,
}

impl MachineRef {
    /// Applies the matching rule against a ledger machine.
    ///
    /// Every identifying field present on both sides must agree, and at least
    /// one field must be comparable.
    #[must_use]
    pub fn matches(&self, machine: &MachineRecord) -> bool {
        let id_check = match (self.machine_id.as_deref(), machine.machine_id.as_deref()) {
            (Some(want), Some(have)) => Some(want == have),
            _ => None,
        };
        let name_check = match (self.name.as_deref(), non_empty(&machine.name).as_deref()) {
            (Some(want), Some(have)) => Some(want == have),
            _ => None,
        };

        match (id_check, name_check) {
            (None, None) => false,
            (Some(id), None) => id,
            (None, Some(name)) => name,
            (Some(id), Some(name)) => id && name,
        }
    }

    /// Returns `true` when the reference carries no identifying field.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.machine_id.is_none() && self.name.is_none()
    }
}

/// The whole persisted document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ledger {
    /// Create requests, in issue order.
    #[serde(default)]
    pub requests: Vec<RequestRecord>,
}

impl Ledger {
    /// Looks up a create request by identifier.
    #[must_use]
    pub fn find_by_id(&self, request_id: &str) -> Option<&RequestRecord> {
        self.requests
            .iter()
            .find(|record| record.request_id == request_id)
    }

    /// Mutable variant of [`Ledger::find_by_id`].
    pub fn find_by_id_mut(&mut self, request_id: &str) -> Option<&mut RequestRecord> {
        self.requests
            .iter_mut()
            .find(|record| record.request_id == request_id)
    }

    /// Inserts a request, replacing any record with the same identifier.
    pub fn upsert(&mut self, record: RequestRecord) {
        if let Some(existing) = self.find_by_id_mut(&record.request_id) {
            *existing = record;
        } else {
            self.requests.push(record);
        }
    }

    /// Projects the machines owned by terminate request `return_id`.
    pub fn machines_for_return<'a>(
        &'a self,
        return_id: &'a str,
    ) -> impl Iterator<Item = &'a MachineRecord> + 'a {
        self.machines()
            .filter(move |machine| machine.return_id.as_deref() == Some(return_id))
    }

    /// Mutable variant of [`Ledger::machines_for_return`].
    pub fn machines_for_return_mut<'a>(
        &'a mut self,
        return_id: &'a str,
    ) -> impl Iterator<Item = &'a mut MachineRecord> + 'a {
        self.machines_mut()
            .filter(move |machine| machine.return_id.as_deref() == Some(return_id))
    }

    /// Iterates every machine in the ledger.
    pub fn machines(&self) -> impl Iterator<Item = &MachineRecord> {
        self.requests
            .iter()
            .flat_map(|record| record.machines.iter())
    }

    /// Iterates every machine in the ledger mutably.
    pub fn machines_mut(&mut self) -> impl Iterator<Item = &mut MachineRecord> {
        self.requests
            .iter_mut()
            .flat_map(|record| record.machines.iter_mut())
    }

    /// Finds the first machine matching `reference`.
    pub fn find_machine_mut(&mut self, reference: &MachineRef) -> Option<&mut MachineRecord> {
        self.machines_mut()
            .find(|machine| reference.matches(machine))
    }

    /// Removes machines other than `machine_id` that still claim
    /// `private_address`, returning how many were dropped.
    ///
    /// Providers recycle private addresses, so an older record sharing the
    /// address of a newly addressed machine describes a machine that is gone.
    pub fn supersede_address(&mut self, machine_id: &str, private_address: &str) -> usize {
        let mut removed = 0;
        for record in &mut self.requests {
            let before = record.machines.len();
            record.machines.retain(|machine| {
                machine.private_ip_address.as_deref() != Some(private_address)
                    || machine.machine_id.as_deref() == Some(machine_id)
            });
            removed += before - record.machines.len();
        }
        removed
    }

    /// Drops expired requests and settled empty ones, returning how many
    /// were removed.
    ///
    /// A request is expired once its embedded timestamp is at least
    /// `retention` old, regardless of status. Requests whose identifier no
    /// longer parses carry no timestamp and are dropped as well.
    pub fn prune(&mut self, now_millis: u64, retention: Duration) -> usize {
        let before = self.requests.len();
        self.requests.retain(|record| {
            let Ok(id) = RequestId::parse(&record.request_id) else {
                warn!(request_id = %record.request_id, "dropping ledger entry with malformed id");
                return false;
            };
            let age = Duration::from_millis(now_millis.saturating_sub(id.issued_at_millis()));
            if age >= retention {
                return false;
            }
            let settled_empty = record.machines.is_empty()
                && (record.status != RequestStatus::Running || id.kind() == RequestKind::Terminate);
            !settled_empty
        });
        before - self.requests.len()
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|text| !text.trim().is_empty()))
}

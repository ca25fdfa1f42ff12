//! Reconciliation of ledger records against observed remote state.
//!
//! Each poll fetches remote state once per request, maps every tracked
//! machine to a result, issues follow-up terminations for machines that
//! failed while still present, and leaves persistence to the caller's
//! ledger transaction.

use std::fmt::Display;

use tracing::{debug, info, warn};

use crate::backend::{ControlPlane, FetchScope, NativeState, RemoteMachine, RemoteState};
use crate::clock::{Clock, millis_to_secs};
use crate::context::ProviderContext;
use crate::ledger::{
    Ledger, MachineRecord, MachineRef, MachineResult, RequestRecord, RequestStatus,
};
use crate::protocol::{MachineReport, RequestReport, ReturnCandidate};
use crate::request_id::{RequestId, RequestKind};
use crate::status::{Mapping, effective_state, map_status};

/// Message reported for a return request with nothing left to track.
pub const NO_TRACKED_MACHINES: &str = "no tracked machines for this return request";

/// Message reported for a create request nobody knows about.
pub const UNKNOWN_REQUEST: &str = "request unknown";

/// Work left over after mapping the machines of one request.
#[derive(Debug, Default)]
struct Followups {
    addressed: Vec<(String, String)>,
}

/// Drives status polls and reclaim detection for one provider instance.
#[derive(Debug)]
pub struct Reconciler<'a, P, C> {
    context: &'a ProviderContext,
    plane: &'a P,
    clock: &'a C,
}

impl<'a, P: ControlPlane, C: Clock> Reconciler<'a, P, C> {
    /// Creates a reconciler borrowing its collaborators.
    #[must_use]
    pub const fn new(context: &'a ProviderContext, plane: &'a P, clock: &'a C) -> Self {
        Self {
            context,
            plane,
            clock,
        }
    }

    /// Polls every request in `request_ids`, in order.
    ///
    /// A failure on one request is reported in its entry and never aborts
    /// the others.
    pub fn poll(&self, ledger: &mut Ledger, request_ids: &[String]) -> Vec<RequestReport> {
        let now = self.clock.now_millis();
        request_ids
            .iter()
            .map(|raw| self.poll_one(ledger, raw, now))
            .collect()
    }

    fn poll_one(&self, ledger: &mut Ledger, raw: &str, now: u64) -> RequestReport {
        match RequestId::parse(raw) {
            Ok(id) => match id.kind() {
                RequestKind::Create => self.poll_create(ledger, &id, now),
                RequestKind::Terminate => self.poll_terminate(ledger, &id, now),
            },
            Err(err) => {
                warn!(request_id = raw, error = %err, "rejecting malformed request id");
                RequestReport::failed(raw, err.to_string())
            }
        }
    }

    fn poll_create(&self, ledger: &mut Ledger, id: &RequestId, now: u64) -> RequestReport {
        let refs = ledger.find_by_id(id.as_str()).and_then(create_scope);
        let scope = refs.as_deref().map_or(FetchScope::All, FetchScope::Machines);
        let remote = match self.plane.fetch(scope) {
            Ok(remote) => remote,
            Err(err) => {
                warn!(request_id = %id, error = %err, "failed to fetch remote state");
                return fetch_failure(ledger.find_by_id(id.as_str()), id, &err);
            }
        };

        let Some(record) = recover_record(ledger, id, &remote, now) else {
            info!(request_id = %id, "create request is unknown locally and remotely");
            return RequestReport::failed(id.as_str(), UNKNOWN_REQUEST);
        };
        adopt_tagged(record, &remote, now);

        let timed_out = self.context.timeouts().is_timed_out(
            id.issued_at_millis(),
            now,
            RequestKind::Create,
        );
        let mut followups = Followups::default();
        for machine in record.machines.iter_mut().filter(|m| !m.is_returned()) {
            let observed = remote.lookup(machine);
            self.reconcile_created(id, machine, observed, timed_out, now, &mut followups);
        }
        let status = record.refresh_status();
        record.message = failure_summary(
            record
                .machines
                .iter()
                .filter(|machine| !machine.is_returned())
                .map(|machine| machine.result),
        );
        debug!(request_id = %id, ?status, "create request reconciled");
        let report = RequestReport::from(&*record);

        for (machine_id, address) in &followups.addressed {
            let removed = ledger.supersede_address(machine_id, address);
            if removed > 0 {
                info!(machine_id, address, removed, "dropped machines superseded by address reuse");
            }
        }
        report
    }

    fn reconcile_created(
        &self,
        id: &RequestId,
        machine: &mut MachineRecord,
        observed: Option<&RemoteMachine>,
        timed_out: bool,
        now: u64,
        followups: &mut Followups,
    ) {
        match machine.result {
            MachineResult::Fail => {
                if let Some(remote) = observed {
                    let winding_down = machine.termination_requested
                        && self.plane.classify(&remote.state) == NativeState::Transitional;
                    if !winding_down {
                        self.terminate_failed(id, machine);
                    }
                }
                return;
            }
            // Terminal: a vanished or stopped machine is left to reclaim detection.
            MachineResult::Succeed => return,
            MachineResult::Executing => {}
        }
        if observed.is_none() && machine.machine_id.is_none() && !timed_out {
            return;
        }

        if let Some(remote) = observed {
            absorb(machine, remote, now);
        }
        let native = observed.map(|remote| {
            effective_state(self.plane.classify(&remote.state), remote.is_addressed())
        });
        let mapping = map_status(native, RequestKind::Create, timed_out);
        apply(machine, mapping, RequestKind::Create);

        match mapping.result {
            MachineResult::Fail if observed.is_some() => self.terminate_failed(id, machine),
            MachineResult::Succeed => {
                if let (Some(machine_id), Some(address)) =
                    (&machine.machine_id, &machine.private_ip_address)
                {
                    followups
                        .addressed
                        .push((machine_id.clone(), address.clone()));
                }
            }
            _ => {}
        }
    }

    fn poll_terminate(&self, ledger: &mut Ledger, id: &RequestId, now: u64) -> RequestReport {
        let refs: Vec<MachineRef> = ledger
            .machines_for_return(id.as_str())
            .map(MachineRecord::machine_ref)
            .collect();
        if refs.is_empty() {
            debug!(request_id = %id, "return request tracks no machines");
            return RequestReport {
                request_id: id.to_string(),
                status: RequestStatus::Complete,
                message: String::from(NO_TRACKED_MACHINES),
                machines: Vec::new(),
            };
        }

        let remote = match self.plane.fetch(FetchScope::Machines(&refs)) {
            Ok(remote) => remote,
            Err(err) => {
                warn!(request_id = %id, error = %err, "failed to fetch remote state");
                return RequestReport {
                    machines: ledger
                        .machines_for_return(id.as_str())
                        .map(MachineReport::from)
                        .collect(),
                    ..RequestReport::failed(id.as_str(), fetch_failure_message(&err))
                };
            }
        };

        let timed_out = self.context.timeouts().is_timed_out(
            id.issued_at_millis(),
            now,
            RequestKind::Terminate,
        );
        let mut machines = Vec::new();
        for machine in ledger.machines_for_return_mut(id.as_str()) {
            let observed = remote.lookup(machine);
            if let Some(remote_machine) = observed {
                absorb(machine, remote_machine, now);
            }
            let native = observed.map(|remote_machine| self.plane.classify(&remote_machine.state));
            let mapping = map_status(native, RequestKind::Terminate, timed_out);
            apply(machine, mapping, RequestKind::Terminate);
            if mapping.result == MachineResult::Fail && observed.is_some() {
                self.terminate_failed(id, machine);
            }
            machines.push(MachineReport::from(&*machine));
        }

        let results = machines.iter().map(|machine| machine.result);
        RequestReport {
            request_id: id.to_string(),
            status: RequestStatus::aggregate(results.clone()),
            message: failure_summary(results),
            machines,
        }
    }

    /// Asks the control plane to terminate a failed machine and records
    /// whether it accepted. Errors are retried on the next poll.
    fn terminate_failed(&self, id: &RequestId, machine: &mut MachineRecord) {
        let reference = machine.machine_ref();
        match self.plane.terminate(&reference) {
            Ok(()) => {
                info!(
                    request_id = %id,
                    machine_id = reference.machine_id.as_deref(),
                    name = reference.name.as_deref(),
                    "requested termination of failed machine"
                );
                machine.termination_requested = true;
            }
            Err(err) => {
                warn!(
                    request_id = %id,
                    machine_id = reference.machine_id.as_deref(),
                    error = %err,
                    "termination retry failed; will retry on next poll"
                );
                machine.termination_requested = false;
            }
        }
    }

    /// Reports machines the provider reclaimed on its own.
    ///
    /// `caller` lists the machines the host factory believes it holds; an
    /// empty list considers every available tracked machine. Tracked
    /// machines that are gone remotely and unknown to a non-empty caller
    /// list are dropped from the ledger.
    ///
    /// # Errors
    ///
    /// Returns the provider error when remote state cannot be fetched; the
    /// ledger is left untouched in that case.
    pub fn return_requests(
        &self,
        ledger: &mut Ledger,
        caller: &[MachineRef],
    ) -> Result<Vec<ReturnCandidate>, P::Error> {
        let remote = self.plane.fetch(FetchScope::All)?;
        let known_to_caller =
            |machine: &MachineRecord| caller.is_empty() || caller.iter().any(|r| r.matches(machine));

        let mut candidates = Vec::new();
        for machine in ledger.machines().filter(|m| is_available(m)) {
            if known_to_caller(machine) && self.is_reclaimed(remote.lookup(machine)) {
                push_candidate(
                    &mut candidates,
                    machine.name.clone(),
                    machine.machine_id.clone().unwrap_or_default(),
                );
            }
        }
        for reference in caller {
            let tracked = ledger.machines().any(|machine| reference.matches(machine));
            if reference.is_empty() || tracked || !self.is_reclaimed(remote.find(reference)) {
                continue;
            }
            push_candidate(
                &mut candidates,
                reference.name.clone().unwrap_or_default(),
                reference.machine_id.clone().unwrap_or_default(),
            );
        }

        if !caller.is_empty() {
            let dropped = drop_forgotten(ledger, &remote, caller);
            if dropped > 0 {
                info!(dropped, "dropped machines unknown to the host factory and gone remotely");
            }
        }
        debug!(candidates = candidates.len(), "computed return candidates");
        Ok(candidates)
    }

    fn is_reclaimed(&self, observed: Option<&RemoteMachine>) -> bool {
        observed.is_none_or(|remote| self.plane.classify(&remote.state) == NativeState::Stopped)
    }
}

/// Machines that are up and not being returned.
#[must_use]
pub fn available_machines(ledger: &Ledger) -> Vec<MachineReport> {
    ledger
        .machines()
        .filter(|machine| machine.result == MachineResult::Succeed && !machine.is_returned())
        .map(MachineReport::from)
        .collect()
}

/// Reference list for a targeted fetch, or `None` when discovery by tag is
/// needed because some machine has no identifier yet.
fn create_scope(record: &RequestRecord) -> Option<Vec<MachineRef>> {
    let pending = record
        .machines
        .iter()
        .filter(|machine| !machine.is_returned());
    let mut refs = Vec::new();
    for machine in pending {
        machine.machine_id.as_ref()?;
        refs.push(machine.machine_ref());
    }
    (!record.machines.is_empty()).then_some(refs)
}

/// Returns the ledger record for `id`, rebuilding it from control-plane tags
/// when the ledger lost it.
fn recover_record<'l>(
    ledger: &'l mut Ledger,
    id: &RequestId,
    remote: &RemoteState,
    now: u64,
) -> Option<&'l mut RequestRecord> {
    if ledger.find_by_id(id.as_str()).is_none() {
        let machines: Vec<MachineRecord> = remote
            .tagged_with(id.as_str())
            .map(|observed| adopted(observed, id.as_str(), now))
            .collect();
        if machines.is_empty() {
            return None;
        }
        info!(request_id = %id, machines = machines.len(), "recovered create request from tags");
        ledger.upsert(RequestRecord {
            request_id: id.to_string(),
            machines,
            ..RequestRecord::default()
        });
    }
    ledger.find_by_id_mut(id.as_str())
}

/// Binds tagged remote machines to placeholders lacking an identifier, or
/// appends them when no placeholder is left.
fn adopt_tagged(record: &mut RequestRecord, remote: &RemoteState, now: u64) {
    let request_id = record.request_id.clone();
    for observed in remote.tagged_with(&request_id) {
        let known = record
            .machines
            .iter()
            .any(|machine| machine.machine_id.as_deref() == Some(observed.machine_id.as_str()));
        if known {
            continue;
        }
        let slot = record
            .machines
            .iter()
            .position(|m| m.machine_id.is_none() && m.name == observed.name)
            .or_else(|| {
                record
                    .machines
                    .iter()
                    .position(|m| m.machine_id.is_none() && m.name.is_empty())
            })
            .and_then(|position| record.machines.get_mut(position));
        match slot {
            Some(placeholder) => placeholder.machine_id = Some(observed.machine_id.clone()),
            None => {
                let mut machine = adopted(observed, &request_id, now);
                machine.template_id.clone_from(&record.template_id);
                machine.rc_account.clone_from(&record.rc_account);
                record.machines.push(machine);
            }
        }
        debug!(request_id, machine_id = observed.machine_id, "adopted tagged machine");
    }
}

fn adopted(observed: &RemoteMachine, request_id: &str, now: u64) -> MachineRecord {
    let mut machine = MachineRecord {
        request_id: request_id.to_owned(),
        ..MachineRecord::default()
    };
    absorb(&mut machine, observed, now);
    machine
}

/// Copies observed attributes into a ledger machine.
fn absorb(machine: &mut MachineRecord, remote: &RemoteMachine, now: u64) {
    if machine.machine_id.is_none() {
        machine.machine_id = Some(remote.machine_id.clone());
    }
    if machine.name.is_empty() {
        remote.name.clone_into(&mut machine.name);
    }
    remote.state.clone_into(&mut machine.status);
    if remote.private_address.is_some() {
        machine.private_ip_address.clone_from(&remote.private_address);
    }
    if remote.public_address.is_some() {
        machine.public_ip_address.clone_from(&remote.public_address);
    }
    if remote.zone.is_some() {
        machine.zone.clone_from(&remote.zone);
    }
    if machine.launch_time == 0 {
        let first_seen = millis_to_secs(now);
        machine.launch_time = remote.launch_time.unwrap_or(first_seen);
    }
}

fn apply(machine: &mut MachineRecord, mapping: Mapping, kind: RequestKind) {
    let native = std::mem::take(&mut machine.status);
    if machine.result != mapping.result {
        info!(
            machine_id = machine.machine_id.as_deref(),
            name = machine.name,
            %kind,
            from = ?machine.result,
            to = ?mapping.result,
            state = native,
            "machine result changed"
        );
    }
    machine.status = mapping.label.status_text(&native);
    machine.message = mapping.label.message(kind, &native);
    machine.result = mapping.result;
}

fn failure_summary(results: impl Iterator<Item = MachineResult>) -> String {
    let (failed, total) = results.fold((0_usize, 0_usize), |(failed, total), result| {
        (failed + usize::from(result == MachineResult::Fail), total + 1)
    });
    if failed == 0 {
        String::new()
    } else {
        format!("{failed} of {total} machines failed")
    }
}

fn fetch_failure_message(err: &dyn Display) -> String {
    format!("failed to query control plane: {err}")
}

fn fetch_failure(record: Option<&RequestRecord>, id: &RequestId, err: &dyn Display) -> RequestReport {
    let failed = RequestReport::failed(id.as_str(), fetch_failure_message(err));
    match record {
        Some(known) => RequestReport {
            machines: RequestReport::from(known).machines,
            ..failed
        },
        None => failed,
    }
}

const fn is_available(machine: &MachineRecord) -> bool {
    matches!(machine.result, MachineResult::Succeed)
        && !machine.is_returned()
        && machine.machine_id.is_some()
}

fn push_candidate(candidates: &mut Vec<ReturnCandidate>, machine: String, machine_id: String) {
    let duplicate = candidates
        .iter()
        .any(|existing| existing.machine == machine && existing.machine_id == machine_id);
    if !duplicate {
        candidates.push(ReturnCandidate {
            machine,
            machine_id,
        });
    }
}

fn drop_forgotten(ledger: &mut Ledger, remote: &RemoteState, caller: &[MachineRef]) -> usize {
    let mut dropped = 0;
    for record in &mut ledger.requests {
        let before = record.machines.len();
        record.machines.retain(|machine| {
            let forgotten = is_available(machine)
                && remote.lookup(machine).is_none()
                && !caller.iter().any(|reference| reference.matches(machine));
            !forgotten
        });
        dropped += before - record.machines.len();
    }
    dropped
}

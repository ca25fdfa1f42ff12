//! Issues create and terminate requests and records them in the ledger.

use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{BackendError, ControlPlane, ProvisionRequest, ProvisionedMachine};
use crate::clock::Clock;
use crate::context::ProviderContext;
use crate::ledger::{Ledger, MachineRecord, MachineRef, MachineResult, RequestRecord};
use crate::protocol::{RequestAccepted, RequestMachinesInput, ResponseStatus};
use crate::request_id::{RequestId, RequestKind};
use crate::templates::{Template, TemplateCatalog};

/// Errors raised while issuing a create request.
#[derive(Debug, Error)]
pub enum IssueError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the requested template is not in the catalog.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    /// Raised when the requested count is zero.
    #[error("machineCount must be greater than zero")]
    EmptyRequest,
    /// Raised when the requested count exceeds the template limit.
    #[error("template {template_id} allows at most {max_number} machines, requested {requested}")]
    OverTemplateLimit {
        /// Template identifier.
        template_id: String,
        /// Template `maxNumber`.
        max_number: u32,
        /// Requested count.
        requested: u32,
    },
    /// Raised when the provisioning request fails validation.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// Raised when the control plane created nothing.
    #[error("control plane rejected the create request: {0}")]
    ControlPlane(#[source] E),
}

/// Turns caller requests into control-plane calls and ledger records.
#[derive(Debug)]
pub struct Issuer<'a, P, C> {
    context: &'a ProviderContext,
    plane: &'a P,
    clock: &'a C,
}

impl<'a, P: ControlPlane, C: Clock> Issuer<'a, P, C> {
    /// Creates an issuer borrowing its collaborators.
    #[must_use]
    pub const fn new(context: &'a ProviderContext, plane: &'a P, clock: &'a C) -> Self {
        Self {
            context,
            plane,
            clock,
        }
    }

    /// Creates machines from a template and records the new request.
    ///
    /// Nothing is recorded when the control plane creates no machine.
    ///
    /// # Errors
    ///
    /// Returns [`IssueError`] when the template or count is unusable or the
    /// control plane rejects the request outright.
    pub fn request_machines(
        &self,
        ledger: &mut Ledger,
        catalog: &TemplateCatalog,
        input: &RequestMachinesInput,
    ) -> Result<RequestAccepted, IssueError<P::Error>> {
        let selection = &input.template;
        let template = catalog
            .find(&selection.template_id)
            .ok_or_else(|| IssueError::UnknownTemplate(selection.template_id.clone()))?;
        let count = self.admitted_count(template, selection.machine_count)?;

        let id = RequestId::new(RequestKind::Create, self.clock.now_millis());
        let request = ProvisionRequest::builder(template.clone())
            .count(count)
            .request_id(id.as_str())
            .rc_account(input.rc_account.clone())
            .extra_tags(input.tags.iter().cloned())
            .build()?;
        let created = self
            .plane
            .create(&request)
            .map_err(IssueError::ControlPlane)?;
        if created.len() < usize::try_from(count).unwrap_or(usize::MAX) {
            warn!(
                request_id = %id,
                requested = count,
                created = created.len(),
                "control plane created fewer machines than requested"
            );
        }

        let record = RequestRecord {
            request_id: id.to_string(),
            template_id: Some(template.template_id.clone()),
            rc_account: request.rc_account.clone(),
            machines: created
                .into_iter()
                .map(|machine| pending_machine(machine, &request))
                .collect(),
            ..RequestRecord::default()
        };
        let message = format!("requested {} machines", record.machines.len());
        info!(
            request_id = %id,
            template_id = template.template_id,
            machines = record.machines.len(),
            "issued create request"
        );
        ledger.upsert(record);

        Ok(RequestAccepted {
            request_id: Some(id.to_string()),
            status: ResponseStatus::Running,
            message,
        })
    }

    fn admitted_count(&self, template: &Template, requested: u32) -> Result<u32, IssueError<P::Error>> {
        if requested == 0 {
            return Err(IssueError::EmptyRequest);
        }
        if requested > template.max_number {
            return Err(IssueError::OverTemplateLimit {
                template_id: template.template_id.clone(),
                max_number: template.max_number,
                requested,
            });
        }
        let limit = self.context.max_machines_per_request();
        if requested > limit {
            warn!(requested, limit, "clamping machine count to the per-request limit");
            return Ok(limit);
        }
        Ok(requested)
    }

    /// Hands the referenced machines to a new terminate request and asks
    /// the control plane to terminate them.
    ///
    /// Machines already owned by another terminate request are left alone.
    /// References that match no tracked machine are terminated directly.
    /// Termination failures are logged; the next status poll retries them.
    pub fn request_return(&self, ledger: &mut Ledger, machines: &[MachineRef]) -> RequestAccepted {
        let references: Vec<&MachineRef> = machines
            .iter()
            .filter(|reference| !reference.is_empty())
            .collect();
        if references.is_empty() {
            warn!("return request names no machines");
            return RequestAccepted {
                request_id: None,
                status: ResponseStatus::Warning,
                message: String::from("no machines to return"),
            };
        }

        let id = RequestId::new(RequestKind::Terminate, self.clock.now_millis());
        let mut claimed = Vec::new();
        let mut untracked = Vec::new();
        for reference in references {
            match claim(ledger, reference, &id) {
                Claim::Claimed(machine) => claimed.push(machine),
                Claim::AlreadyReturned => {
                    info!(
                        machine_id = reference.machine_id.as_deref(),
                        name = reference.name.as_deref(),
                        "machine is already being returned"
                    );
                }
                Claim::Untracked => untracked.push(reference.clone()),
            }
        }

        for machine in claimed.iter().chain(&untracked) {
            if let Err(err) = self.plane.terminate(machine) {
                warn!(
                    request_id = %id,
                    machine_id = machine.machine_id.as_deref(),
                    name = machine.name.as_deref(),
                    error = %err,
                    "termination request failed"
                );
            }
        }
        if !untracked.is_empty() {
            info!(request_id = %id, machines = untracked.len(), "terminated untracked machines");
        }

        if claimed.is_empty() {
            return RequestAccepted {
                request_id: Some(id.to_string()),
                status: ResponseStatus::Complete,
                message: String::from("no tracked machines to return"),
            };
        }
        info!(request_id = %id, machines = claimed.len(), "issued return request");
        RequestAccepted {
            request_id: Some(id.to_string()),
            status: ResponseStatus::Running,
            message: format!("returning {} machines", claimed.len()),
        }
    }
}

enum Claim {
    Claimed(MachineRef),
    AlreadyReturned,
    Untracked,
}

fn claim(ledger: &mut Ledger, reference: &MachineRef, id: &RequestId) -> Claim {
    let mut seen = false;
    for machine in ledger
        .machines_mut()
        .filter(|machine| reference.matches(machine))
    {
        seen = true;
        if machine.is_returned() {
            continue;
        }
        machine.return_id = Some(id.to_string());
        machine.result = MachineResult::Executing;
        machine.message.clear();
        machine.termination_requested = false;
        return Claim::Claimed(machine.machine_ref());
    }
    if seen {
        Claim::AlreadyReturned
    } else {
        Claim::Untracked
    }
}

fn pending_machine(machine: ProvisionedMachine, request: &ProvisionRequest) -> MachineRecord {
    MachineRecord {
        machine_id: machine.machine_id,
        name: machine.name,
        request_id: request.request_id.clone(),
        template_id: Some(request.template.template_id.clone()),
        result: MachineResult::Executing,
        status: machine.state,
        zone: machine.zone,
        rc_account: request.rc_account.clone(),
        ..MachineRecord::default()
    }
}

#[cfg(test)]
mod tests;

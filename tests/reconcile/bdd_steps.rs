//! BDD step definitions for create request reconciliation.

use hostprov::operations::{Operation, Response};
use hostprov::protocol::{
    MachineReport, RequestMachinesInput, RequestRef, RequestStatusInput, TemplateSelection,
};
use rstest_bdd_macros::{given, then, when};
use serde::Serialize;

use super::test_helpers::ReconcileContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn wire_name(value: &impl Serialize) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|json| json.as_str().map(str::to_owned))
        .unwrap_or_default()
}

fn machines(reconcile_context: &ReconcileContext) -> Result<&[MachineReport], StepError> {
    let machines = reconcile_context.machines().map_err(StepError::Assertion)?;
    if machines.is_empty() {
        return Err(StepError::Assertion(String::from(
            "polled request carries no machines",
        )));
    }
    Ok(machines)
}

#[given("a provider offering template \"{template}\"")]
fn provider_offering_template(
    reconcile_context: ReconcileContext,
    template: String,
) -> ReconcileContext {
    reconcile_context.write_catalog(template.trim());
    reconcile_context
}

#[when("the host factory requests {count:u32} machines from \"{template}\"")]
fn host_factory_requests(
    mut reconcile_context: ReconcileContext,
    count: u32,
    template: String,
) -> ReconcileContext {
    let input = RequestMachinesInput {
        template: TemplateSelection {
            template_id: template.trim().to_owned(),
            machine_count: count,
        },
        rc_account: None,
        tags: Vec::new(),
    };
    let Response::Accepted(accepted) = reconcile_context.run(Operation::RequestMachines(input))
    else {
        panic!("requestMachines should return an acceptance");
    };
    reconcile_context.request_id = accepted.request_id;
    reconcile_context
}

#[when("the control plane reports every machine \"{state}\" with an address")]
fn plane_reports_state_with_address(
    reconcile_context: ReconcileContext,
    state: String,
) -> ReconcileContext {
    reconcile_context.plane.set_all_states(state.trim());
    reconcile_context.plane.assign_addresses();
    reconcile_context
}

#[when("the control plane reports every machine \"{state}\"")]
fn plane_reports_state(reconcile_context: ReconcileContext, state: String) -> ReconcileContext {
    reconcile_context.plane.set_all_states(state.trim());
    reconcile_context
}

#[when("the host factory polls the request after {minutes:u64} minutes")]
fn host_factory_polls(mut reconcile_context: ReconcileContext, minutes: u64) -> ReconcileContext {
    let request_id = reconcile_context
        .request_id
        .clone()
        .unwrap_or_else(|| panic!("test setup requires an issued request"));
    reconcile_context.clock.advance_minutes(minutes);
    let input = RequestStatusInput {
        requests: vec![RequestRef { request_id }],
    };
    let Response::Status(status) = reconcile_context.run(Operation::GetRequestStatus(input))
    else {
        panic!("getRequestStatus should return a status document");
    };
    reconcile_context.report = status.requests.into_iter().next();
    reconcile_context
}

#[then("the request status is \"{status}\"")]
fn request_status_is(reconcile_context: &ReconcileContext, status: String) -> Result<(), StepError> {
    let Some(report) = reconcile_context.report.as_ref() else {
        return Err(StepError::Assertion(String::from("missing report")));
    };
    let actual = wire_name(&report.status);
    if actual == status.trim() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected status {status}, got {actual}: {report:?}"
        )))
    }
}

#[then("every machine result is \"{result}\"")]
fn every_machine_result_is(
    reconcile_context: &ReconcileContext,
    result: String,
) -> Result<(), StepError> {
    let machines = machines(reconcile_context)?;
    match machines
        .iter()
        .find(|machine| wire_name(&machine.result) != result.trim())
    {
        None => Ok(()),
        Some(machine) => Err(StepError::Assertion(format!(
            "expected result {result}, got {machine:?}"
        ))),
    }
}

#[then("every machine status is \"{status}\"")]
fn every_machine_status_is(
    reconcile_context: &ReconcileContext,
    status: String,
) -> Result<(), StepError> {
    let machines = machines(reconcile_context)?;
    match machines
        .iter()
        .find(|machine| machine.status != status.trim())
    {
        None => Ok(()),
        Some(machine) => Err(StepError::Assertion(format!(
            "expected status {status}, got {machine:?}"
        ))),
    }
}

#[then("every machine is available")]
fn every_machine_is_available(reconcile_context: &ReconcileContext) -> Result<(), StepError> {
    let expected = machines(reconcile_context)?.len();
    let Response::Available(available) = reconcile_context.run(Operation::GetAvailableMachines)
    else {
        return Err(StepError::Assertion(String::from(
            "getAvailableMachines should return a machine list",
        )));
    };
    if available.machines.len() == expected
        && available
            .machines
            .iter()
            .all(|machine| machine.private_ip_address.is_some())
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected} addressed machines, got {:?}",
            available.machines
        )))
    }
}

#[then("no machine was terminated")]
fn no_machine_was_terminated(reconcile_context: &ReconcileContext) -> Result<(), StepError> {
    let terminations = reconcile_context.plane.terminations();
    if terminations.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected terminations: {terminations:?}"
        )))
    }
}

#[then("every machine was terminated once")]
fn every_machine_terminated_once(reconcile_context: &ReconcileContext) -> Result<(), StepError> {
    let machines = machines(reconcile_context)?;
    let terminations = reconcile_context.plane.terminations();
    let all_once = machines.iter().all(|machine| {
        terminations
            .iter()
            .filter(|reference| reference.machine_id == machine.machine_id)
            .count()
            == 1
    });
    if all_once && terminations.len() == machines.len() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one termination per machine, got {terminations:?}"
        )))
    }
}

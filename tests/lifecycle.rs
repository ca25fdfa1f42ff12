//! End-to-end request lifecycle against a file-backed ledger.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use hostprov::ledger::{MachineRef, MachineResult, RequestStatus};
use hostprov::operations::{Operation, Operations, Response};
use hostprov::protocol::{
    MachinesInput, RequestMachinesInput, RequestRef, RequestReport, RequestStatusInput,
    ResponseStatus, TemplateSelection,
};
use hostprov::test_support::{FakeControlPlane, FixedClock, provider_context};
use hostprov::ProviderContext;
use rstest::{fixture, rstest};
use tempfile::TempDir;

const T0: u64 = 1_700_000_000_000;

struct World {
    _tmp: TempDir,
    context: ProviderContext,
    plane: FakeControlPlane,
    clock: FixedClock,
}

impl World {
    fn run(&self, operation: Operation) -> Response {
        Operations::new(&self.context, &self.plane, &self.clock)
            .run(operation)
            .unwrap_or_else(|err| panic!("operation should succeed: {err}"))
    }

    fn request(&self, count: u32) -> String {
        let input = RequestMachinesInput {
            template: TemplateSelection {
                template_id: String::from("small"),
                machine_count: count,
            },
            rc_account: Some(String::from("acct")),
            tags: Vec::new(),
        };
        let Response::Accepted(accepted) = self.run(Operation::RequestMachines(input)) else {
            panic!("expected an acceptance");
        };
        accepted
            .request_id
            .unwrap_or_else(|| panic!("create should carry a request id"))
    }

    fn poll(&self, request_id: &str) -> RequestReport {
        let input = RequestStatusInput {
            requests: vec![RequestRef {
                request_id: request_id.to_owned(),
            }],
        };
        let Response::Status(status) = self.run(Operation::GetRequestStatus(input)) else {
            panic!("expected a status document");
        };
        status
            .requests
            .into_iter()
            .next()
            .unwrap_or_else(|| panic!("status should report the polled request"))
    }

    fn available_ids(&self) -> Vec<String> {
        let Response::Available(available) = self.run(Operation::GetAvailableMachines) else {
            panic!("expected a machine list");
        };
        available
            .machines
            .into_iter()
            .filter_map(|machine| machine.machine_id)
            .collect()
    }

    fn ledger_path(&self) -> Utf8PathBuf {
        self.context.ledger_path()
    }
}

fn by_id(machine_id: &str) -> MachineRef {
    MachineRef {
        machine_id: Some(machine_id.to_owned()),
        ..MachineRef::default()
    }
}

#[fixture]
fn world() -> World {
    let tmp = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8Path::from_path(tmp.path())
        .unwrap_or_else(|| panic!("temp path should be UTF-8"))
        .to_owned();
    fs::write(
        root.join("hostprov_templates.json"),
        r#"{"templates": [{"templateId": "small", "maxNumber": 4, "instanceType": "DEV1-S", "image": "ubuntu_noble"}]}"#,
    )
    .unwrap_or_else(|err| panic!("write catalog: {err}"));
    World {
        context: provider_context(root.as_str())
            .unwrap_or_else(|err| panic!("context should build: {err}")),
        _tmp: tmp,
        plane: FakeControlPlane::new(),
        clock: FixedClock::at(T0),
    }
}

#[rstest]
fn create_poll_return_and_release(world: World) {
    let create_id = world.request(2);
    assert!(world.ledger_path().is_file(), "ledger should be persisted");

    world.clock.advance_minutes(1);
    world.plane.set_all_states("running");
    world.plane.assign_addresses();
    assert_eq!(world.poll(&create_id).status, RequestStatus::Complete);
    assert_eq!(world.available_ids(), vec!["srv-0", "srv-1"]);

    let input = MachinesInput {
        machines: vec![by_id("srv-0")],
    };
    let Response::Accepted(accepted) = world.run(Operation::RequestReturnMachines(input)) else {
        panic!("expected an acceptance");
    };
    assert_eq!(accepted.status, ResponseStatus::Running);
    let return_id = accepted
        .request_id
        .unwrap_or_else(|| panic!("return should carry a request id"));
    assert_eq!(world.available_ids(), vec!["srv-1"]);

    world.clock.advance_minutes(1);
    assert_eq!(world.poll(&return_id).status, RequestStatus::Running);

    world.plane.remove("srv-0");
    let report = world.poll(&return_id);
    assert_eq!(report.status, RequestStatus::Complete);
    assert!(
        report
            .machines
            .iter()
            .all(|machine| machine.result == MachineResult::Succeed)
    );
    assert_eq!(world.poll(&create_id).status, RequestStatus::Complete);
}

#[rstest]
fn state_survives_between_invocations(world: World) {
    let create_id = world.request(1);

    let store = world
        .context
        .ledger_store()
        .unwrap_or_else(|err| panic!("store should open: {err}"));
    let ledger = store
        .load()
        .unwrap_or_else(|err| panic!("ledger should load: {err}"));

    let Some(record) = ledger.find_by_id(&create_id) else {
        panic!("request should be on disk");
    };
    assert_eq!(record.machines.len(), 1);
    assert_eq!(record.rc_account.as_deref(), Some("acct"));
}

#[rstest]
fn reclaimed_machines_are_reported_for_return(world: World) {
    let create_id = world.request(2);
    world.plane.set_all_states("running");
    world.plane.assign_addresses();
    world.poll(&create_id);

    world.plane.set_state("srv-1", "stopped");
    let input = MachinesInput {
        machines: vec![by_id("srv-0"), by_id("srv-1")],
    };
    let Response::Returns(returns) = world.run(Operation::GetReturnRequests(input)) else {
        panic!("expected return candidates");
    };

    let ids: Vec<_> = returns
        .requests
        .iter()
        .map(|candidate| candidate.machine_id.as_str())
        .collect();
    assert_eq!(ids, vec!["srv-1"]);
}

#[rstest]
fn expired_requests_are_pruned(world: World) {
    let create_id = world.request(1);
    world.plane.set_all_states("running");
    world.plane.assign_addresses();
    world.poll(&create_id);

    world.clock.advance_minutes(25 * 60);
    world.poll(&create_id);

    let store = world
        .context
        .ledger_store()
        .unwrap_or_else(|err| panic!("store should open: {err}"));
    let ledger = store
        .load()
        .unwrap_or_else(|err| panic!("ledger should load: {err}"));
    assert!(ledger.find_by_id(&create_id).is_none());
}

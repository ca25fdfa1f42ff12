//! Unit tests for request issuing.

use camino::Utf8Path;
use rstest::{fixture, rstest};

use super::*;
use crate::protocol::TemplateSelection;
use crate::test_support::{FakeControlPlane, FakeError, FixedClock, provider_config};

const T0: u64 = 1_700_000_000_000;

const CATALOG: &str = r#"{"templates": [
    {"templateId": "small", "maxNumber": 5, "instanceType": "DEV1-S", "image": "ubuntu_noble"}
]}"#;

struct Harness {
    context: ProviderContext,
    plane: FakeControlPlane,
    clock: FixedClock,
    catalog: TemplateCatalog,
    ledger: Ledger,
}

impl Harness {
    fn request(&mut self, count: u32) -> Result<RequestAccepted, IssueError<FakeError>> {
        let input = RequestMachinesInput {
            template: TemplateSelection {
                template_id: String::from("small"),
                machine_count: count,
            },
            rc_account: Some(String::from("acct")),
            tags: vec![String::from("team:hpc")],
        };
        let issuer = Issuer::new(&self.context, &self.plane, &self.clock);
        issuer.request_machines(&mut self.ledger, &self.catalog, &input)
    }

    fn request_return(&mut self, machines: &[MachineRef]) -> RequestAccepted {
        let issuer = Issuer::new(&self.context, &self.plane, &self.clock);
        issuer.request_return(&mut self.ledger, machines)
    }
}

fn harness_with_limit(max_machines_per_request: u32) -> Harness {
    let config = crate::config::ProviderConfig {
        max_machines_per_request,
        ..provider_config("/var/lib/hostprov")
    };
    Harness {
        context: ProviderContext::from_config(&config)
            .unwrap_or_else(|err| panic!("context should build: {err}")),
        plane: FakeControlPlane::new(),
        clock: FixedClock::at(T0),
        catalog: TemplateCatalog::parse(Utf8Path::new("templates.json"), CATALOG)
            .unwrap_or_else(|err| panic!("catalog should parse: {err}")),
        ledger: Ledger::default(),
    }
}

#[fixture]
fn harness() -> Harness {
    harness_with_limit(1000)
}

fn accepted_id(accepted: &RequestAccepted) -> String {
    accepted
        .request_id
        .clone()
        .unwrap_or_else(|| panic!("response should carry a request id: {accepted:?}"))
}

#[rstest]
fn create_records_machines_and_tags(mut harness: Harness) {
    let accepted = harness
        .request(3)
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(accepted.status, ResponseStatus::Running);
    let request_id = accepted_id(&accepted);
    let parsed = RequestId::parse(&request_id)
        .unwrap_or_else(|err| panic!("id should parse: {err}"));
    assert_eq!(parsed.kind(), RequestKind::Create);
    assert_eq!(parsed.issued_at_millis(), T0);

    let Some(record) = harness.ledger.find_by_id(&request_id) else {
        panic!("request should be recorded");
    };
    assert_eq!(record.machines.len(), 3);
    assert_eq!(record.rc_account.as_deref(), Some("acct"));
    assert!(record.machines.iter().all(|machine| {
        machine.result == MachineResult::Executing
            && machine.template_id.as_deref() == Some("small")
            && machine.request_id == request_id
    }));

    let creates = harness.plane.creates();
    let [create] = creates.as_slice() else {
        panic!("expected one create call");
    };
    assert_eq!(create.count, 3);
    assert_eq!(create.extra_tags, vec![String::from("team:hpc")]);
}

#[rstest]
#[case::zero(0)]
#[case::over_template(6)]
fn invalid_counts_are_rejected(mut harness: Harness, #[case] count: u32) {
    let Err(err) = harness.request(count) else {
        panic!("count {count} should be rejected");
    };
    assert!(matches!(
        err,
        IssueError::EmptyRequest | IssueError::OverTemplateLimit { .. }
    ));
    assert!(harness.plane.creates().is_empty());
    assert!(harness.ledger.requests.is_empty());
}

#[rstest]
fn unknown_template_is_rejected(mut harness: Harness) {
    harness.catalog = TemplateCatalog::default();
    let Err(err) = harness.request(1) else {
        panic!("unknown template should be rejected");
    };
    assert!(matches!(err, IssueError::UnknownTemplate(id) if id == "small"));
}

#[rstest]
fn count_is_clamped_to_the_provider_limit() {
    let mut harness = harness_with_limit(2);

    harness
        .request(5)
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(
        harness.plane.creates().first().map(|create| create.count),
        Some(2)
    );
}

#[rstest]
fn create_failure_records_nothing(mut harness: Harness) {
    harness.plane.fail_create(Some("quota exceeded"));

    let Err(err) = harness.request(2) else {
        panic!("create should fail");
    };

    assert!(matches!(err, IssueError::ControlPlane(_)));
    assert!(harness.ledger.requests.is_empty());
}

#[rstest]
fn return_claims_tracked_machines_and_terminates_them(mut harness: Harness) {
    harness
        .request(2)
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    harness.clock.advance_minutes(5);
    let reference = MachineRef {
        machine_id: Some(String::from("srv-0")),
        ..MachineRef::default()
    };

    let accepted = harness.request_return(&[reference]);

    assert_eq!(accepted.status, ResponseStatus::Running);
    let return_id = accepted_id(&accepted);
    let parsed = RequestId::parse(&return_id)
        .unwrap_or_else(|err| panic!("id should parse: {err}"));
    assert_eq!(parsed.kind(), RequestKind::Terminate);
    let returned: Vec<_> = harness
        .ledger
        .machines_for_return(&return_id)
        .filter_map(|machine| machine.machine_id.as_deref())
        .collect();
    assert_eq!(returned, vec!["srv-0"]);
    let terminations = harness.plane.terminations();
    let [terminated] = terminations.as_slice() else {
        panic!("expected one termination");
    };
    assert_eq!(terminated.machine_id.as_deref(), Some("srv-0"));
    assert_eq!(terminated.zone.as_deref(), Some("fr-par-1"));
}

#[rstest]
fn return_leaves_already_returned_machines_alone(mut harness: Harness) {
    harness
        .request(1)
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    let reference = MachineRef {
        name: Some(String::from("host-0")),
        ..MachineRef::default()
    };
    let first = accepted_id(&harness.request_return(std::slice::from_ref(&reference)));

    let second = harness.request_return(&[reference]);

    assert_eq!(second.status, ResponseStatus::Complete);
    assert_eq!(harness.ledger.machines_for_return(&first).count(), 1);
    assert_eq!(harness.plane.terminations().len(), 1);
}

#[rstest]
fn return_of_untracked_machine_terminates_directly(mut harness: Harness) {
    let reference = MachineRef {
        machine_id: Some(String::from("srv-stray")),
        ..MachineRef::default()
    };

    let accepted = harness.request_return(&[reference]);

    assert_eq!(accepted.status, ResponseStatus::Complete);
    assert!(accepted.request_id.is_some());
    assert_eq!(harness.plane.terminations().len(), 1);
}

#[rstest]
fn return_with_no_usable_references_warns(mut harness: Harness) {
    let accepted = harness.request_return(&[MachineRef::default()]);

    assert_eq!(accepted.status, ResponseStatus::Warning);
    assert_eq!(accepted.request_id, None);
    assert!(harness.plane.terminations().is_empty());
}

#[rstest]
fn termination_failure_still_records_the_return(mut harness: Harness) {
    harness
        .request(1)
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    harness.plane.fail_terminate(Some("conflict"));
    let reference = MachineRef {
        machine_id: Some(String::from("srv-0")),
        ..MachineRef::default()
    };

    let accepted = harness.request_return(&[reference]);

    assert_eq!(accepted.status, ResponseStatus::Running);
    assert_eq!(
        harness
            .ledger
            .machines_for_return(&accepted_id(&accepted))
            .count(),
        1
    );
}

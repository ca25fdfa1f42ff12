//! Shared fixtures and helpers for reconciliation BDD scenarios.

use std::fs;
use std::rc::Rc;

use camino::Utf8Path;
use hostprov::ProviderContext;
use hostprov::operations::{Operation, Operations, Response};
use hostprov::protocol::{MachineReport, RequestReport};
use hostprov::test_support::{FakeControlPlane, FixedClock, provider_context};
use rstest::fixture;
use tempfile::TempDir;

pub const T0: u64 = 1_700_000_000_000;

#[derive(Clone, Debug)]
pub struct ReconcileContext {
    pub workspace: Rc<TempDir>,
    pub provider: ProviderContext,
    pub plane: FakeControlPlane,
    pub clock: FixedClock,
    pub request_id: Option<String>,
    pub report: Option<RequestReport>,
}

#[fixture]
pub fn reconcile_context() -> ReconcileContext {
    let workspace = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8Path::from_path(workspace.path())
        .unwrap_or_else(|| panic!("temp path should be UTF-8"));
    let provider =
        provider_context(root.as_str()).unwrap_or_else(|err| panic!("context should build: {err}"));
    ReconcileContext {
        workspace: Rc::new(workspace),
        provider,
        plane: FakeControlPlane::new(),
        clock: FixedClock::at(T0),
        request_id: None,
        report: None,
    }
}

impl ReconcileContext {
    pub fn write_catalog(&self, template_id: &str) {
        let catalog = format!(
            r#"{{"templates": [{{"templateId": "{template_id}", "maxNumber": 10, "instanceType": "DEV1-S", "image": "ubuntu_noble"}}]}}"#
        );
        fs::write(self.provider.templates_path(), catalog)
            .unwrap_or_else(|err| panic!("write catalog: {err}"));
    }

    pub fn run(&self, operation: Operation) -> Response {
        Operations::new(&self.provider, &self.plane, &self.clock)
            .run(operation)
            .unwrap_or_else(|err| panic!("operation should succeed: {err}"))
    }

    pub fn machines(&self) -> Result<&[MachineReport], String> {
        self.report
            .as_ref()
            .map(|report| report.machines.as_slice())
            .ok_or_else(|| String::from("no request has been polled"))
    }
}

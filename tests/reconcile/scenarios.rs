//! BDD scenarios for create request reconciliation.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ReconcileContext, reconcile_context};

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Running machines with addresses complete the request"
)]
fn scenario_running_machines_complete(reconcile_context: ReconcileContext) {
    let _ = reconcile_context;
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Provisioning machines keep the request running"
)]
fn scenario_provisioning_keeps_running(reconcile_context: ReconcileContext) {
    let _ = reconcile_context;
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Machines stuck provisioning time out"
)]
fn scenario_provisioning_times_out(reconcile_context: ReconcileContext) {
    let _ = reconcile_context;
}

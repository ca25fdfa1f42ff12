//! Test support utilities shared across unit and integration tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Map;
use thiserror::Error;

use crate::backend::{
    ControlPlane, FetchScope, NativeState, ProvisionRequest, ProvisionedMachine, RemoteMachine,
    RemoteState,
};
use crate::clock::Clock;
use crate::config::{ConfigError, DEFAULT_PROVIDER_NAME, DEFAULT_TEMPLATES_FILE, ProviderConfig};
use crate::context::ProviderContext;
use crate::ledger::MachineRef;
use crate::runner::{CommandOutput, CommandRunner, RunnerError};
use crate::scaleway::classify_state;
use crate::templates::Template;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status with empty output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| RunnerError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Error returned by [`FakeControlPlane`] when a failure is injected.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("fake control plane: {0}")]
pub struct FakeError(pub String);

#[derive(Debug, Default)]
struct FakeState {
    machines: BTreeMap<String, RemoteMachine>,
    fetch_failure: Option<String>,
    create_failure: Option<String>,
    terminate_failure: Option<String>,
    defer_ids: bool,
    next_index: u32,
    fetch_calls: usize,
    creates: Vec<ProvisionRequest>,
    terminations: Vec<MachineRef>,
}

/// In-memory control plane with injectable failures and call recording.
///
/// Termination calls are recorded but do not alter remote state; tests move
/// machines between states explicitly.
#[derive(Clone, Debug, Default)]
pub struct FakeControlPlane {
    state: Rc<RefCell<FakeState>>,
}

impl FakeControlPlane {
    /// Creates an empty control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a remote machine.
    pub fn put(&self, machine: RemoteMachine) {
        self.state
            .borrow_mut()
            .machines
            .insert(machine.machine_id.clone(), machine);
    }

    /// Sets the native state of every remote machine.
    pub fn set_all_states(&self, state: &str) {
        for machine in self.state.borrow_mut().machines.values_mut() {
            state.clone_into(&mut machine.state);
        }
    }

    /// Sets the native state of one remote machine.
    pub fn set_state(&self, machine_id: &str, state: &str) {
        if let Some(machine) = self.state.borrow_mut().machines.get_mut(machine_id) {
            state.clone_into(&mut machine.state);
        }
    }

    /// Assigns addresses to every remote machine.
    pub fn assign_addresses(&self) {
        for (position, machine) in self.state.borrow_mut().machines.values_mut().enumerate() {
            machine.private_address = Some(format!("10.0.0.{}", position + 10));
        }
    }

    /// Removes a remote machine.
    pub fn remove(&self, machine_id: &str) {
        self.state.borrow_mut().machines.remove(machine_id);
    }

    /// Makes every fetch fail with `message` until cleared.
    pub fn fail_fetch(&self, message: Option<&str>) {
        self.state.borrow_mut().fetch_failure = message.map(str::to_owned);
    }

    /// Makes every create fail with `message` until cleared.
    pub fn fail_create(&self, message: Option<&str>) {
        self.state.borrow_mut().create_failure = message.map(str::to_owned);
    }

    /// Makes every terminate fail with `message` until cleared.
    pub fn fail_terminate(&self, message: Option<&str>) {
        self.state.borrow_mut().terminate_failure = message.map(str::to_owned);
    }

    /// Makes create return machines without identifiers, like a bulk API.
    pub fn defer_ids(&self, defer: bool) {
        self.state.borrow_mut().defer_ids = defer;
    }

    /// Identifiers of every remote machine.
    #[must_use]
    pub fn machine_ids(&self) -> Vec<String> {
        self.state.borrow().machines.keys().cloned().collect()
    }

    /// Number of fetch calls made so far.
    #[must_use]
    pub fn fetch_calls(&self) -> usize {
        self.state.borrow().fetch_calls
    }

    /// Create requests received so far.
    #[must_use]
    pub fn creates(&self) -> Vec<ProvisionRequest> {
        self.state.borrow().creates.clone()
    }

    /// Termination references received so far.
    #[must_use]
    pub fn terminations(&self) -> Vec<MachineRef> {
        self.state.borrow().terminations.clone()
    }
}

impl ControlPlane for FakeControlPlane {
    type Error = FakeError;

    fn fetch(&self, scope: FetchScope<'_>) -> Result<RemoteState, Self::Error> {
        let mut state = self.state.borrow_mut();
        state.fetch_calls += 1;
        if let Some(message) = state.fetch_failure.clone() {
            return Err(FakeError(message));
        }
        let machines = state.machines.values().cloned();
        Ok(match scope {
            FetchScope::All => RemoteState::from_machines(machines),
            FetchScope::Machines(refs) => RemoteState::from_machines(machines.filter(|machine| {
                refs.iter().any(|reference| {
                    reference.machine_id.as_deref() == Some(machine.machine_id.as_str())
                        || reference.name.as_deref() == Some(machine.name.as_str())
                })
            })),
        })
    }

    fn create(&self, request: &ProvisionRequest) -> Result<Vec<ProvisionedMachine>, Self::Error> {
        let mut state = self.state.borrow_mut();
        state.creates.push(request.clone());
        if let Some(message) = state.create_failure.clone() {
            return Err(FakeError(message));
        }
        let mut created = Vec::new();
        for _ in 0..request.count {
            let index = state.next_index;
            state.next_index += 1;
            let machine = RemoteMachine {
                machine_id: format!("srv-{index}"),
                name: format!("host-{index}"),
                state: String::from("starting"),
                zone: Some(String::from("fr-par-1")),
                request_id: Some(request.request_id.clone()),
                ..RemoteMachine::default()
            };
            created.push(ProvisionedMachine {
                machine_id: (!state.defer_ids).then(|| machine.machine_id.clone()),
                name: machine.name.clone(),
                state: machine.state.clone(),
                zone: machine.zone.clone(),
            });
            state.machines.insert(machine.machine_id.clone(), machine);
        }
        Ok(created)
    }

    fn terminate(&self, machine: &MachineRef) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        state.terminations.push(machine.clone());
        state
            .terminate_failure
            .clone()
            .map_or(Ok(()), |message| Err(FakeError(message)))
    }

    fn classify(&self, native_state: &str) -> NativeState {
        classify_state(native_state)
    }
}

/// Clock returning a settable instant.
#[derive(Clone, Debug, Default)]
pub struct FixedClock {
    now: Rc<Cell<u64>>,
}

impl FixedClock {
    /// Creates a clock frozen at `now_millis`.
    #[must_use]
    pub fn at(now_millis: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(now_millis)),
        }
    }

    /// Moves the clock forward.
    pub fn advance_minutes(&self, minutes: u64) {
        self.now.set(self.now.get() + minutes * 60_000);
    }
}

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        self.now.get()
    }
}

/// Provider configuration rooted at `dir` with default limits.
#[must_use]
pub fn provider_config(dir: &str) -> ProviderConfig {
    ProviderConfig {
        provider_name: String::from(DEFAULT_PROVIDER_NAME),
        work_dir: dir.to_owned(),
        conf_dir: dir.to_owned(),
        log_dir: None,
        log_level: String::from("info"),
        templates_file: String::from(DEFAULT_TEMPLATES_FILE),
        creation_timeout_minutes: 10,
        termination_timeout_minutes: 60,
        retention_hours: 24,
        max_machines_per_request: 1000,
    }
}

/// Context rooted at `dir` with default limits.
///
/// # Errors
///
/// Returns [`ConfigError`] when `dir` is blank.
pub fn provider_context(dir: &str) -> Result<ProviderContext, ConfigError> {
    ProviderContext::from_config(&provider_config(dir))
}

/// Builds a minimal template.
#[must_use]
pub fn template(template_id: &str) -> Template {
    Template {
        template_id: template_id.to_owned(),
        max_number: 10,
        instance_type: String::from("DEV1-S"),
        image: String::from("ubuntu_noble"),
        zone: None,
        tags: Vec::new(),
        attributes: Map::new(),
        extra: Map::new(),
    }
}

/// Builds a managed remote machine in `state` with a private address.
#[must_use]
pub fn remote(machine_id: &str, name: &str, state: &str) -> RemoteMachine {
    RemoteMachine {
        machine_id: machine_id.to_owned(),
        name: name.to_owned(),
        state: state.to_owned(),
        private_address: Some(format!("10.1.0.{}", name.len())),
        zone: Some(String::from("fr-par-1")),
        ..RemoteMachine::default()
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

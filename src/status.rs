//! Mapping from provider state to caller-facing machine results.

use crate::backend::NativeState;
use crate::ledger::MachineResult;
use crate::request_id::RequestKind;

/// Reason attached to a mapped result, rendered into the machine `status`
/// and `message` fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Label {
    /// Report the native state unchanged.
    Native,
    /// The create deadline passed while the machine was transitional.
    CreationTimeout,
    /// The terminate deadline passed while the machine was transitional.
    TerminationTimeout,
    /// A create poll could not find the machine.
    NotFound,
    /// A terminate poll could not find the machine.
    AlreadyDeleted,
    /// The machine settled in a state that contradicts the request.
    Incongruent,
    /// The provider reports the machine as failed.
    ProviderFailure,
}

impl Label {
    /// Value stored in the machine `status` field.
    #[must_use]
    pub fn status_text(self, native: &str) -> String {
        match self {
            Self::Native | Self::Incongruent | Self::ProviderFailure => native.to_owned(),
            Self::CreationTimeout => String::from("creation_timeout"),
            Self::TerminationTimeout => String::from("termination_timeout"),
            Self::NotFound => String::from("not_found"),
            Self::AlreadyDeleted => String::from("deleted"),
        }
    }

    /// Diagnostic placed in the machine `message` field.
    #[must_use]
    pub fn message(self, kind: RequestKind, native: &str) -> String {
        match self {
            Self::Native | Self::AlreadyDeleted => String::new(),
            Self::CreationTimeout => {
                format!("timed out waiting for machine to start (last state {native})")
            }
            Self::TerminationTimeout => {
                format!("timed out waiting for machine to terminate (last state {native})")
            }
            Self::NotFound => String::from("machine not found on the control plane"),
            Self::Incongruent => format!("machine is {native} during {kind} request"),
            Self::ProviderFailure => format!("control plane reports machine as {native}"),
        }
    }
}

/// Outcome of mapping one observation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Mapping {
    /// Caller-facing result.
    pub result: MachineResult,
    /// Reason for the result.
    pub label: Label,
}

impl Mapping {
    const fn new(result: MachineResult, label: Label) -> Self {
        Self { result, label }
    }
}

/// Downgrades a running machine without usable addressing to transitional.
#[must_use]
pub const fn effective_state(state: NativeState, addressed: bool) -> NativeState {
    match state {
        NativeState::Running if !addressed => NativeState::Transitional,
        other => other,
    }
}

/// Maps an observation to a result for a request of `kind`.
///
/// `observed` is `None` when the machine is absent from the remote state.
/// Absence fails a create request and completes a terminate request.
#[must_use]
pub const fn map_status(
    observed: Option<NativeState>,
    kind: RequestKind,
    timed_out: bool,
) -> Mapping {
    match (observed, kind) {
        (None, RequestKind::Create) => Mapping::new(MachineResult::Fail, Label::NotFound),
        (None, RequestKind::Terminate) => {
            Mapping::new(MachineResult::Succeed, Label::AlreadyDeleted)
        }
        (Some(NativeState::Transitional), RequestKind::Create) if timed_out => {
            Mapping::new(MachineResult::Fail, Label::CreationTimeout)
        }
        (Some(NativeState::Transitional), RequestKind::Terminate) if timed_out => {
            Mapping::new(MachineResult::Fail, Label::TerminationTimeout)
        }
        (Some(NativeState::Transitional), _) => {
            Mapping::new(MachineResult::Executing, Label::Native)
        }
        (Some(NativeState::Running), RequestKind::Create)
        | (Some(NativeState::Stopped), RequestKind::Terminate) => {
            Mapping::new(MachineResult::Succeed, Label::Native)
        }
        (Some(NativeState::Running), RequestKind::Terminate)
        | (Some(NativeState::Stopped), RequestKind::Create) => {
            Mapping::new(MachineResult::Fail, Label::Incongruent)
        }
        (Some(NativeState::Failed), _) => {
            Mapping::new(MachineResult::Fail, Label::ProviderFailure)
        }
    }
}

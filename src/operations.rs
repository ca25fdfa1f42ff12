//! The six host factory operations, each wrapped in its ledger transaction.

use std::io::{self, Read};

use camino::Utf8Path;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::ControlPlane;
use crate::clock::Clock;
use crate::context::ProviderContext;
use crate::issuer::{IssueError, Issuer};
use crate::ledger::{LedgerError, RequestStatus};
use crate::protocol::{
    AvailableMachinesResponse, MachinesInput, ProtocolError, RequestAccepted,
    RequestMachinesInput, RequestReport, RequestStatusInput, RequestStatusResponse,
    ResponseStatus, ReturnRequestsResponse, TemplatesResponse, parse_input,
};
use crate::reconcile::{Reconciler, available_machines};
use crate::templates::{TemplateCatalog, TemplateError};

/// One decoded host factory call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// `getAvailableTemplates`.
    GetAvailableTemplates,
    /// `requestMachines`.
    RequestMachines(RequestMachinesInput),
    /// `requestReturnMachines`.
    RequestReturnMachines(MachinesInput),
    /// `getRequestStatus`.
    GetRequestStatus(RequestStatusInput),
    /// `getReturnRequests`.
    GetReturnRequests(MachinesInput),
    /// `getAvailableMachines`.
    GetAvailableMachines,
}

/// Selector for [`Operation`] before its input is decoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperationKind {
    /// `getAvailableTemplates`.
    GetAvailableTemplates,
    /// `requestMachines`.
    RequestMachines,
    /// `requestReturnMachines`.
    RequestReturnMachines,
    /// `getRequestStatus`.
    GetRequestStatus,
    /// `getReturnRequests`.
    GetReturnRequests,
    /// `getAvailableMachines`.
    GetAvailableMachines,
}

impl OperationKind {
    /// Returns `true` when the operation reads an input document.
    #[must_use]
    pub const fn takes_input(self) -> bool {
        !matches!(self, Self::GetAvailableTemplates | Self::GetAvailableMachines)
    }
}

impl Operation {
    /// Decodes the input document for `kind`.
    ///
    /// `raw` is ignored by operations that take no input. `getReturnRequests`
    /// accepts an empty document.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the document is missing or malformed.
    pub fn decode(kind: OperationKind, raw: &str) -> Result<Self, ProtocolError> {
        Ok(match kind {
            OperationKind::GetAvailableTemplates => Self::GetAvailableTemplates,
            OperationKind::GetAvailableMachines => Self::GetAvailableMachines,
            OperationKind::RequestMachines => Self::RequestMachines(parse_input(raw)?),
            OperationKind::RequestReturnMachines => Self::RequestReturnMachines(parse_input(raw)?),
            OperationKind::GetRequestStatus => Self::GetRequestStatus(parse_input(raw)?),
            OperationKind::GetReturnRequests if raw.trim().is_empty() => {
                Self::GetReturnRequests(MachinesInput::default())
            }
            OperationKind::GetReturnRequests => Self::GetReturnRequests(parse_input(raw)?),
        })
    }
}

/// Reads an input document from `path`, or from stdin when `path` is
/// `None` or `-`.
///
/// # Errors
///
/// Returns [`ProtocolError::Read`] when the source cannot be read.
pub fn read_input(path: Option<&Utf8Path>) -> Result<String, ProtocolError> {
    match path.filter(|candidate| candidate.as_str() != "-") {
        Some(file) => {
            let read_error = |message: String| ProtocolError::Read {
                source_name: file.to_string(),
                message,
            };
            let parent = file
                .parent()
                .filter(|dir| !dir.as_str().is_empty())
                .unwrap_or_else(|| Utf8Path::new("."));
            let name = file
                .file_name()
                .ok_or_else(|| read_error(String::from("path has no file name")))?;
            let dir = Dir::open_ambient_dir(parent, ambient_authority())
                .map_err(|err| read_error(err.to_string()))?;
            dir.read_to_string(name)
                .map_err(|err| read_error(err.to_string()))
        }
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|err| ProtocolError::Read {
                    source_name: String::from("stdin"),
                    message: err.to_string(),
                })?;
            Ok(buffer)
        }
    }
}

/// Errors that abort an operation without a regular response.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Raised when the ledger cannot be read, locked, or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Raised when the template catalog is unusable.
    #[error(transparent)]
    Templates(#[from] TemplateError),
    /// Raised when the input document is unusable.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Raised when a create request is rejected before reaching the
    /// control plane.
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Raised when the control plane refuses a create request.
    #[error("control plane error: {0}")]
    ControlPlane(String),
}

impl<E: std::error::Error + 'static> From<IssueError<E>> for OperationError {
    fn from(err: IssueError<E>) -> Self {
        let message = err.to_string();
        match err {
            IssueError::ControlPlane(_) => Self::ControlPlane(message),
            _ => Self::Rejected(message),
        }
    }
}

/// Regular response document of an operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// `getAvailableTemplates`.
    Templates(TemplatesResponse),
    /// `requestMachines` and `requestReturnMachines`.
    Accepted(RequestAccepted),
    /// `getRequestStatus`.
    Status(RequestStatusResponse),
    /// `getReturnRequests`.
    Returns(ReturnRequestsResponse),
    /// `getAvailableMachines`.
    Available(AvailableMachinesResponse),
}

/// Runs the operations that never reach the control plane.
///
/// Returns `None` for operations that need one.
#[must_use]
pub fn run_offline(
    context: &ProviderContext,
    operation: &Operation,
) -> Option<Result<Response, OperationError>> {
    match operation {
        Operation::GetAvailableTemplates => Some(templates(context)),
        Operation::GetAvailableMachines => Some(available(context)),
        _ => None,
    }
}

fn templates(context: &ProviderContext) -> Result<Response, OperationError> {
    let catalog = TemplateCatalog::load(&context.templates_path())?;
    Ok(Response::Templates(TemplatesResponse {
        templates: catalog.templates,
        status: ResponseStatus::Complete,
        message: String::new(),
    }))
}

fn available(context: &ProviderContext) -> Result<Response, OperationError> {
    let ledger = context.ledger_store()?.load()?;
    Ok(Response::Available(AvailableMachinesResponse {
        machines: available_machines(&ledger),
        status: ResponseStatus::Complete,
        message: String::new(),
    }))
}

/// Runs operations against one provider instance.
#[derive(Debug)]
pub struct Operations<'a, P, C> {
    context: &'a ProviderContext,
    plane: &'a P,
    clock: &'a C,
}

impl<'a, P: ControlPlane, C: Clock> Operations<'a, P, C> {
    /// Creates an executor borrowing its collaborators.
    #[must_use]
    pub const fn new(context: &'a ProviderContext, plane: &'a P, clock: &'a C) -> Self {
        Self {
            context,
            plane,
            clock,
        }
    }

    /// Executes `operation` and returns its response.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError`] when the operation cannot produce a
    /// regular response. Per-request failures during status polls are
    /// reported inside the response instead.
    pub fn run(&self, operation: Operation) -> Result<Response, OperationError> {
        debug!(?operation, "running operation");
        match operation {
            Operation::GetAvailableTemplates => templates(self.context),
            Operation::RequestMachines(input) => self.request_machines(&input),
            Operation::RequestReturnMachines(input) => self.request_return(&input),
            Operation::GetRequestStatus(input) => self.request_status(&input),
            Operation::GetReturnRequests(input) => self.return_requests(&input),
            Operation::GetAvailableMachines => available(self.context),
        }
    }

    fn request_machines(&self, input: &RequestMachinesInput) -> Result<Response, OperationError> {
        let catalog = TemplateCatalog::load(&self.context.templates_path())?;
        let issuer = Issuer::new(self.context, self.plane, self.clock);
        let store = self.context.ledger_store()?;
        let accepted = store.transaction(self.clock.now_millis(), |ledger| {
            issuer
                .request_machines(ledger, &catalog, input)
                .map_err(OperationError::from)
        })?;
        Ok(Response::Accepted(accepted))
    }

    fn request_return(&self, input: &MachinesInput) -> Result<Response, OperationError> {
        let issuer = Issuer::new(self.context, self.plane, self.clock);
        let store = self.context.ledger_store()?;
        let accepted = store.transaction(self.clock.now_millis(), |ledger| {
            Ok::<_, OperationError>(issuer.request_return(ledger, &input.machines))
        })?;
        Ok(Response::Accepted(accepted))
    }

    fn request_status(&self, input: &RequestStatusInput) -> Result<Response, OperationError> {
        if input.requests.is_empty() {
            return Ok(Response::Status(RequestStatusResponse {
                requests: Vec::new(),
                status: ResponseStatus::Warning,
                message: String::from("no requests to poll"),
            }));
        }
        let ids: Vec<String> = input
            .requests
            .iter()
            .map(|request| request.request_id.clone())
            .collect();
        let reconciler = Reconciler::new(self.context, self.plane, self.clock);
        let store = self.context.ledger_store()?;
        let reports = store.transaction(self.clock.now_millis(), |ledger| {
            Ok::<_, OperationError>(reconciler.poll(ledger, &ids))
        })?;
        Ok(Response::Status(RequestStatusResponse {
            status: overall_status(&reports),
            message: String::new(),
            requests: reports,
        }))
    }

    fn return_requests(&self, input: &MachinesInput) -> Result<Response, OperationError> {
        let reconciler = Reconciler::new(self.context, self.plane, self.clock);
        let store = self.context.ledger_store()?;
        let outcome = store.transaction(self.clock.now_millis(), |ledger| {
            Ok::<_, OperationError>(
                reconciler
                    .return_requests(ledger, &input.machines)
                    .map_err(|err| err.to_string()),
            )
        })?;
        Ok(Response::Returns(match outcome {
            Ok(requests) => ReturnRequestsResponse {
                requests,
                status: ResponseStatus::Complete,
                message: String::new(),
            },
            Err(message) => {
                warn!(error = message, "failed to compute return requests");
                ReturnRequestsResponse {
                    requests: Vec::new(),
                    status: ResponseStatus::CompleteWithError,
                    message: format!("failed to query control plane: {message}"),
                }
            }
        }))
    }
}

fn overall_status(reports: &[RequestReport]) -> ResponseStatus {
    let worst = reports
        .iter()
        .map(|report| report.status)
        .fold(RequestStatus::Complete, |acc, status| match (acc, status) {
            (RequestStatus::CompleteWithError, _) | (_, RequestStatus::CompleteWithError) => {
                RequestStatus::CompleteWithError
            }
            (RequestStatus::Running, _) | (_, RequestStatus::Running) => RequestStatus::Running,
            _ => RequestStatus::Complete,
        });
    ResponseStatus::from(worst)
}

//! JSON documents exchanged with the host factory.
//!
//! Field names follow the host factory's camelCase conventions, including
//! its historical `rc_account` and `launchtime` spellings.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{MachineRecord, MachineRef, MachineResult, RequestRecord, RequestStatus};
use crate::templates::Template;

/// Errors raised while decoding caller input.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProtocolError {
    /// Raised when the input document cannot be read.
    #[error("failed to read input from {source_name}: {message}")]
    Read {
        /// File path or `stdin`.
        source_name: String,
        /// Operating system error message.
        message: String,
    },
    /// Raised when the input is not the expected JSON shape.
    #[error("invalid input document: {0}")]
    Parse(String),
    /// Raised when the input parses but is semantically unusable.
    #[error("invalid request: {0}")]
    Invalid(String),
}

/// Decodes an input document.
///
/// # Errors
///
/// Returns [`ProtocolError::Parse`] when `raw` is empty or malformed.
pub fn parse_input<T: DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    if raw.trim().is_empty() {
        return Err(ProtocolError::Parse(String::from("input document is empty")));
    }
    serde_json::from_str(raw).map_err(|err| ProtocolError::Parse(err.to_string()))
}

/// Template and count selected by `requestMachines`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSelection {
    /// Template to provision from.
    pub template_id: String,
    /// Number of machines requested.
    pub machine_count: u32,
}

/// Input of `requestMachines`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct RequestMachinesInput {
    /// Template selection.
    pub template: TemplateSelection,
    /// Account tag applied to the new machines.
    #[serde(default)]
    pub rc_account: Option<String>,
    /// Extra tags applied to the new machines.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Input of `requestReturnMachines` and `getReturnRequests`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct MachinesInput {
    /// Machines referenced by the caller.
    #[serde(default)]
    pub machines: Vec<MachineRef>,
}

/// One request reference inside `getRequestStatus` input.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    /// Create or return request identifier.
    pub request_id: String,
}

/// Input of `getRequestStatus`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct RequestStatusInput {
    /// Requests to poll.
    #[serde(default)]
    pub requests: Vec<RequestRef>,
}

/// Top-level status of a response document.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Work is still in progress.
    Running,
    /// The operation finished successfully.
    Complete,
    /// The operation finished with at least one failure.
    CompleteWithError,
    /// The operation did nothing because the input was unusable.
    Warning,
}

impl From<RequestStatus> for ResponseStatus {
    fn from(value: RequestStatus) -> Self {
        match value {
            RequestStatus::Running => Self::Running,
            RequestStatus::Complete => Self::Complete,
            RequestStatus::CompleteWithError => Self::CompleteWithError,
        }
    }
}

/// Per-machine entry in status and availability responses.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineReport {
    /// Provider-assigned identifier, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Hostname.
    pub name: String,
    /// Caller-facing result.
    pub result: MachineResult,
    /// Native state or reconciliation label.
    pub status: String,
    /// Private address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip_address: Option<String>,
    /// Public address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip_address: Option<String>,
    /// First-observed launch time in epoch seconds.
    #[serde(rename = "launchtime")]
    pub launch_time: u64,
    /// Diagnostic text.
    pub message: String,
    /// Account tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc_account: Option<String>,
}

impl From<&MachineRecord> for MachineReport {
    fn from(record: &MachineRecord) -> Self {
        Self {
            machine_id: record.machine_id.clone(),
            name: record.name.clone(),
            result: record.result,
            status: record.status.clone(),
            private_ip_address: record.private_ip_address.clone(),
            public_ip_address: record.public_ip_address.clone(),
            launch_time: record.launch_time,
            message: record.message.clone(),
            rc_account: record.rc_account.clone(),
        }
    }
}

/// Per-request entry in `getRequestStatus` responses.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestReport {
    /// Request identifier as supplied by the caller.
    pub request_id: String,
    /// Aggregated request status.
    pub status: RequestStatus,
    /// Request-level diagnostic.
    pub message: String,
    /// Per-machine detail.
    pub machines: Vec<MachineReport>,
}

impl RequestReport {
    /// Builds a report for a request that could not be evaluated.
    #[must_use]
    pub fn failed(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: RequestStatus::CompleteWithError,
            message: message.into(),
            machines: Vec::new(),
        }
    }
}

/// Create request report. Machines handed to a return request are left out;
/// they are reported by that request instead.
impl From<&RequestRecord> for RequestReport {
    fn from(record: &RequestRecord) -> Self {
        Self {
            request_id: record.request_id.clone(),
            status: record.status,
            message: record.message.clone(),
            machines: record
                .machines
                .iter()
                .filter(|machine| !machine.is_returned())
                .map(MachineReport::from)
                .collect(),
        }
    }
}

/// Machine the provider reclaimed on its own.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnCandidate {
    /// Hostname.
    pub machine: String,
    /// Provider-assigned identifier.
    pub machine_id: String,
}

/// Response of `getAvailableTemplates`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TemplatesResponse {
    /// Offered templates.
    pub templates: Vec<Template>,
    /// Overall status.
    pub status: ResponseStatus,
    /// Diagnostic text.
    pub message: String,
}

/// Response of `getAvailableMachines`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct AvailableMachinesResponse {
    /// Machines that are up and not being returned.
    pub machines: Vec<MachineReport>,
    /// Overall status.
    pub status: ResponseStatus,
    /// Diagnostic text.
    pub message: String,
}

/// Response of `requestMachines` and `requestReturnMachines`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestAccepted {
    /// Identifier to poll with `getRequestStatus`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Overall status.
    pub status: ResponseStatus,
    /// Diagnostic text.
    pub message: String,
}

/// Response of `getRequestStatus`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RequestStatusResponse {
    /// One entry per polled request, in input order.
    pub requests: Vec<RequestReport>,
    /// Overall status.
    pub status: ResponseStatus,
    /// Diagnostic text.
    pub message: String,
}

/// Response of `getReturnRequests`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ReturnRequestsResponse {
    /// Machines the host factory should return.
    pub requests: Vec<ReturnCandidate>,
    /// Overall status.
    pub status: ResponseStatus,
    /// Diagnostic text.
    pub message: String,
}

/// Response emitted when an operation cannot run at all.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    /// Always [`ResponseStatus::CompleteWithError`].
    pub status: ResponseStatus,
    /// Error description.
    pub message: String,
}

impl ErrorResponse {
    /// Wraps an error message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::CompleteWithError,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    fn parses_request_machines_input() {
        let input: RequestMachinesInput = parse_input(
            r#"{"template":{"templateId":"small","machineCount":3},"rc_account":"acct"}"#,
        )
        .unwrap_or_else(|err| panic!("input should parse: {err}"));

        assert_eq!(input.template.template_id, "small");
        assert_eq!(input.template.machine_count, 3);
        assert_eq!(input.rc_account.as_deref(), Some("acct"));
        assert!(input.tags.is_empty());
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("{\"template\":{}}")]
    #[case("{\"template\":{\"templateId\":\"a\",\"machineCount\":-1}}")]
    fn rejects_bad_request_machines_input(#[case] raw: &str) {
        let Err(err) = parse_input::<RequestMachinesInput>(raw) else {
            panic!("input {raw:?} should be rejected");
        };
        assert!(matches!(err, ProtocolError::Parse(_)));
    }

    #[rstest]
    fn machine_refs_accept_partial_references() {
        let input: MachinesInput =
            parse_input(r#"{"machines":[{"machineId":"srv-1"},{"name":"host-2","machineId":""}]}"#)
                .unwrap_or_else(|err| panic!("input should parse: {err}"));

        let [first, second] = input.machines.as_slice() else {
            panic!("expected two machine references");
        };
        assert_eq!(first.machine_id.as_deref(), Some("srv-1"));
        assert_eq!(first.name, None);
        assert_eq!(second.machine_id, None);
        assert_eq!(second.name.as_deref(), Some("host-2"));
    }

    #[rstest]
    fn status_report_uses_wire_names() {
        let record = MachineRecord {
            machine_id: Some(String::from("srv-1")),
            name: String::from("host-1"),
            result: MachineResult::Succeed,
            status: String::from("running"),
            private_ip_address: Some(String::from("10.0.0.1")),
            launch_time: 1_700_000_000,
            ..MachineRecord::default()
        };
        let report = RequestStatusResponse {
            requests: vec![RequestReport {
                request_id: String::from("IDCREATEabc-1"),
                status: RequestStatus::Complete,
                message: String::new(),
                machines: vec![MachineReport::from(&record)],
            }],
            status: ResponseStatus::Complete,
            message: String::new(),
        };

        let value = serde_json::to_value(&report)
            .unwrap_or_else(|err| panic!("response should serialise: {err}"));

        assert_eq!(
            value,
            json!({
                "requests": [{
                    "requestId": "IDCREATEabc-1",
                    "status": "complete",
                    "message": "",
                    "machines": [{
                        "machineId": "srv-1",
                        "name": "host-1",
                        "result": "succeed",
                        "status": "running",
                        "privateIpAddress": "10.0.0.1",
                        "launchtime": 1_700_000_000,
                        "message": ""
                    }]
                }],
                "status": "complete",
                "message": ""
            })
        );
    }
}

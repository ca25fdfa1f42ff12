//! Request identifiers with an embedded kind marker and issue timestamp.
//!
//! Identifiers keep the host factory's historical wire format so existing
//! ledgers stay readable: a kind prefix, a dash-free UUID, a `-` separator and
//! the issue time in epoch milliseconds.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Prefix used for create requests.
pub const CREATE_PREFIX: &str = "IDCREATE";

/// Prefix used for terminate (return) requests.
pub const TERMINATE_PREFIX: &str = "IDDELETE";

/// Kind of request, derived solely from the identifier prefix.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestKind {
    /// Provision new machines.
    Create,
    /// Return (terminate) existing machines.
    Terminate,
}

impl RequestKind {
    const fn prefix(self) -> &'static str {
        match self {
            Self::Create => CREATE_PREFIX,
            Self::Terminate => TERMINATE_PREFIX,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

/// Errors raised when parsing a request identifier.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestIdError {
    /// The identifier does not start with a known kind prefix.
    #[error("request id {id} has no create or terminate prefix")]
    UnknownKind {
        /// Identifier as supplied by the caller.
        id: String,
    },
    /// The identifier lacks a numeric timestamp suffix.
    #[error("request id {id} has no issue timestamp suffix")]
    MissingTimestamp {
        /// Identifier as supplied by the caller.
        id: String,
    },
}

/// Engine-assigned request identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RequestId {
    raw: String,
    kind: RequestKind,
    issued_at_millis: u64,
}

impl RequestId {
    /// Allocates a fresh identifier for `kind` issued at `now_millis`.
    #[must_use]
    pub fn new(kind: RequestKind, now_millis: u64) -> Self {
        let raw = format!(
            "{}{}-{now_millis}",
            kind.prefix(),
            Uuid::new_v4().simple()
        );
        Self {
            raw,
            kind,
            issued_at_millis: now_millis,
        }
    }

    /// Parses an identifier produced by [`RequestId::new`].
    ///
    /// # Errors
    ///
    /// Returns [`RequestIdError`] when the prefix or timestamp suffix is
    /// missing.
    pub fn parse(value: &str) -> Result<Self, RequestIdError> {
        let trimmed = value.trim();
        let kind = if trimmed.starts_with(CREATE_PREFIX) {
            RequestKind::Create
        } else if trimmed.starts_with(TERMINATE_PREFIX) {
            RequestKind::Terminate
        } else {
            return Err(RequestIdError::UnknownKind {
                id: trimmed.to_owned(),
            });
        };

        let issued_at_millis = trimmed
            .rsplit_once('-')
            .and_then(|(_, suffix)| suffix.parse::<u64>().ok())
            .ok_or_else(|| RequestIdError::MissingTimestamp {
                id: trimmed.to_owned(),
            })?;

        Ok(Self {
            raw: trimmed.to_owned(),
            kind,
            issued_at_millis,
        })
    }

    /// Returns the request kind encoded in the prefix.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Returns the issue time in epoch milliseconds.
    #[must_use]
    pub const fn issued_at_millis(&self) -> u64 {
        self.issued_at_millis
    }

    /// Returns the identifier as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

//! Serde views over `scw instance server` JSON output.

use chrono::DateTime;
use serde::Deserialize;

use crate::backend::{ProvisionedMachine, RemoteMachine};

/// Tag carried by every server this provider manages.
pub const PROVIDER_TAG: &str = "hostprov";

/// Prefix of the tag recording the owning create request.
pub const REQUEST_TAG_PREFIX: &str = "hostprov-request:";

/// Prefix of the tag recording the host factory account.
pub const ACCOUNT_TAG_PREFIX: &str = "hostprov-account:";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct ScwIp {
    #[serde(default)]
    pub(crate) address: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(crate) struct ScwServer {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) state: String,
    #[serde(default)]
    pub(crate) zone: Option<String>,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    #[serde(default)]
    pub(crate) private_ip: Option<String>,
    #[serde(default)]
    pub(crate) public_ip: Option<ScwIp>,
    #[serde(default)]
    pub(crate) public_ips: Vec<ScwIp>,
    #[serde(default)]
    pub(crate) creation_date: Option<String>,
}

impl ScwServer {
    pub(crate) fn request_tag(&self) -> Option<String> {
        self.tags.iter().find_map(|tag| {
            tag.strip_prefix(REQUEST_TAG_PREFIX)
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
        })
    }

    pub(crate) fn is_managed(&self) -> bool {
        self.tags.iter().any(|tag| tag == PROVIDER_TAG)
    }

    fn public_address(&self) -> Option<String> {
        self.public_ip
            .iter()
            .chain(self.public_ips.iter())
            .find_map(|ip| ip.address.clone())
            .filter(|address| !address.is_empty())
    }

    /// Creation time in epoch seconds, when `creation_date` is RFC 3339.
    fn launch_time(&self) -> Option<u64> {
        let created = DateTime::parse_from_rfc3339(self.creation_date.as_deref()?).ok()?;
        u64::try_from(created.timestamp()).ok()
    }

    fn private_address(&self) -> Option<String> {
        self.private_ip.clone().filter(|address| !address.is_empty())
    }

    pub(crate) fn into_remote(self) -> RemoteMachine {
        RemoteMachine {
            request_id: self.request_tag(),
            private_address: self.private_address(),
            public_address: self.public_address(),
            launch_time: self.launch_time(),
            machine_id: self.id,
            name: self.name,
            state: self.state,
            zone: self.zone,
        }
    }

    pub(crate) fn into_provisioned(self) -> ProvisionedMachine {
        ProvisionedMachine {
            machine_id: Some(self.id),
            name: self.name,
            state: self.state,
            zone: self.zone,
        }
    }
}

/// `scw ... list -o json` prints a bare array; API passthrough prints an
/// object with a `servers` field.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ServerList {
    Bare(Vec<ScwServer>),
    Wrapped { servers: Vec<ScwServer> },
}

impl ServerList {
    pub(crate) fn into_servers(self) -> Vec<ScwServer> {
        match self {
            Self::Bare(servers) | Self::Wrapped { servers } => servers,
        }
    }
}

/// `scw instance server create -o json` prints the server, or a wrapper
/// object with a `server` field.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ServerEnvelope {
    Wrapped { server: ScwServer },
    Bare(ScwServer),
}

impl ServerEnvelope {
    pub(crate) fn into_server(self) -> ScwServer {
        match self {
            Self::Wrapped { server } | Self::Bare(server) => server,
        }
    }
}

//! Immutable per-invocation provider context.

use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};

use crate::config::{ConfigError, ProviderConfig};
use crate::ledger::{LedgerError, LedgerStore};
use crate::timeout::TimeoutPolicy;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 3_600;

/// Settings and resolved paths shared by every component for the lifetime
/// of one CLI invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderContext {
    provider_name: String,
    work_dir: Utf8PathBuf,
    conf_dir: Utf8PathBuf,
    log_dir: Option<Utf8PathBuf>,
    templates_file: String,
    timeouts: TimeoutPolicy,
    retention: Duration,
    max_machines_per_request: u32,
}

impl ProviderContext {
    /// Validates `config` and resolves it into a context.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            provider_name: config.provider_name.trim().to_owned(),
            work_dir: Utf8PathBuf::from(config.work_dir.trim()),
            conf_dir: Utf8PathBuf::from(config.conf_dir.trim()),
            log_dir: config
                .log_dir
                .as_deref()
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(Utf8PathBuf::from),
            templates_file: config.templates_file.trim().to_owned(),
            timeouts: TimeoutPolicy {
                creation: Duration::from_secs(
                    config.creation_timeout_minutes.saturating_mul(SECS_PER_MINUTE),
                ),
                termination: Duration::from_secs(
                    config
                        .termination_timeout_minutes
                        .saturating_mul(SECS_PER_MINUTE),
                ),
            },
            retention: Duration::from_secs(config.retention_hours.saturating_mul(SECS_PER_HOUR)),
            max_machines_per_request: config.max_machines_per_request,
        })
    }

    /// Provider instance name.
    #[must_use]
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Directory holding the ledger.
    #[must_use]
    pub fn work_dir(&self) -> &Utf8PathBuf {
        &self.work_dir
    }

    /// Path of the ledger document.
    #[must_use]
    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.work_dir
            .join(format!("{}-db.json", self.provider_name))
    }

    /// Path of the template catalog.
    #[must_use]
    pub fn templates_path(&self) -> Utf8PathBuf {
        self.conf_dir.join(&self.templates_file)
    }

    /// Path of the provider log file, when file logging is configured.
    #[must_use]
    pub fn log_path(&self) -> Option<Utf8PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-provider.log", self.provider_name)))
    }

    /// Create and terminate deadlines.
    #[must_use]
    pub const fn timeouts(&self) -> TimeoutPolicy {
        self.timeouts
    }

    /// How long requests stay in the ledger after issue.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        self.retention
    }

    /// Upper bound on machines created by one request.
    #[must_use]
    pub const fn max_machines_per_request(&self) -> u32 {
        self.max_machines_per_request
    }

    /// Confirms that the configuration and work directories exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first unusable directory.
    pub fn check_directories(&self) -> Result<(), ConfigError> {
        for (label, dir) in [("configuration", &self.conf_dir), ("work", &self.work_dir)] {
            Dir::open_ambient_dir(dir, ambient_authority()).map_err(|err| {
                ConfigError::Invalid(format!("{label} directory {dir} is not usable: {err}"))
            })?;
        }
        Ok(())
    }

    /// Opens the ledger store for this provider instance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidPath`] when the ledger path is unusable.
    pub fn ledger_store(&self) -> Result<LedgerStore, LedgerError> {
        LedgerStore::new(&self.ledger_path(), self.retention)
    }
}

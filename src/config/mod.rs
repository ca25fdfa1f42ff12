//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default provider instance name, used for the ledger and log file names.
pub const DEFAULT_PROVIDER_NAME: &str = "scaleway";

/// Default template catalog file name, relative to the configuration dir.
pub const DEFAULT_TEMPLATES_FILE: &str = "hostprov_templates.json";

/// Engine settings shared by every operation.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HOSTPROV",
    discovery(
        app_name = "hostprov",
        env_var = "HOSTPROV_CONFIG_PATH",
        config_file_name = "hostprov.toml",
        dotfile_name = ".hostprov.toml",
        project_file_name = "hostprov.toml"
    )
)]
pub struct ProviderConfig {
    /// Provider instance name.
    #[ortho_config(default = DEFAULT_PROVIDER_NAME.to_owned())]
    pub provider_name: String,
    /// Directory holding the ledger. The host factory passes it as
    /// `PRO_DATA_DIR`.
    #[ortho_config(default = String::new())]
    pub work_dir: String,
    /// Directory holding the template catalog. The host factory passes it as
    /// `PRO_CONF_DIR`.
    #[ortho_config(default = String::new())]
    pub conf_dir: String,
    /// Directory for the provider log file; logs go to stderr when unset.
    pub log_dir: Option<String>,
    /// Default log filter when `HOSTPROV_LOG` is not set.
    #[ortho_config(default = String::from("info"))]
    pub log_level: String,
    /// Template catalog file name, relative to `conf_dir`.
    #[ortho_config(default = DEFAULT_TEMPLATES_FILE.to_owned())]
    pub templates_file: String,
    /// Minutes a create request may remain transitional.
    #[ortho_config(default = 10)]
    pub creation_timeout_minutes: u64,
    /// Minutes a terminate request may remain transitional.
    #[ortho_config(default = 60)]
    pub termination_timeout_minutes: u64,
    /// Hours a request stays in the ledger after issue.
    #[ortho_config(default = 24)]
    pub retention_hours: u64,
    /// Upper bound on machines created by one request.
    #[ortho_config(default = 1000)]
    pub max_machines_per_request: u32,
}

/// Settings for the Scaleway control plane.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Project identifier scoping every server this provider manages.
    #[ortho_config(default = String::new())]
    pub default_project_id: String,
    /// Zone used when a template does not name one. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Path to the `scw` CLI binary.
    #[ortho_config(default = "scw".to_owned())]
    pub scw_bin: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in hostprov.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }

    fn require(&self, value: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(self.missing());
        }
        Ok(())
    }

    fn require_positive(&self, value: u64) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: check {} or {} in [{}]",
                self.description, self.env_var, self.toml_key, self.section
            )));
        }
        Ok(())
    }
}

impl ProviderConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("hostprov")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide missing values via environment variables or configuration
    /// files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a duration or limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new(
            "provider name",
            "HOSTPROV_PROVIDER_NAME",
            "provider_name",
            "provider",
        )
        .require(&self.provider_name)?;
        FieldMetadata::new(
            "work directory",
            "PRO_DATA_DIR",
            "work_dir",
            "provider",
        )
        .require(&self.work_dir)?;
        FieldMetadata::new(
            "configuration directory",
            "PRO_CONF_DIR",
            "conf_dir",
            "provider",
        )
        .require(&self.conf_dir)?;
        FieldMetadata::new(
            "templates file",
            "HOSTPROV_TEMPLATES_FILE",
            "templates_file",
            "provider",
        )
        .require(&self.templates_file)?;
        FieldMetadata::new(
            "creation timeout",
            "HOSTPROV_CREATION_TIMEOUT_MINUTES",
            "creation_timeout_minutes",
            "provider",
        )
        .require_positive(self.creation_timeout_minutes)?;
        FieldMetadata::new(
            "termination timeout",
            "HOSTPROV_TERMINATION_TIMEOUT_MINUTES",
            "termination_timeout_minutes",
            "provider",
        )
        .require_positive(self.termination_timeout_minutes)?;
        FieldMetadata::new(
            "ledger retention",
            "HOSTPROV_RETENTION_HOURS",
            "retention_hours",
            "provider",
        )
        .require_positive(self.retention_hours)?;
        FieldMetadata::new(
            "per-request machine limit",
            "HOSTPROV_MAX_MACHINES_PER_REQUEST",
            "max_machines_per_request",
            "provider",
        )
        .require_positive(u64::from(self.max_machines_per_request))?;
        Ok(())
    }
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("hostprov")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        FieldMetadata::new(
            "Scaleway project ID",
            "SCW_DEFAULT_PROJECT_ID",
            "default_project_id",
            "scaleway",
        )
        .require(&self.default_project_id)?;
        FieldMetadata::new(
            "availability zone",
            "SCW_DEFAULT_ZONE",
            "default_zone",
            "scaleway",
        )
        .require(&self.default_zone)?;
        FieldMetadata::new("scw binary", "SCW_SCW_BIN", "scw_bin", "scaleway")
            .require(&self.scw_bin)?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests;

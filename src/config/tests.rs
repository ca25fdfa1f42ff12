//! Unit tests for configuration validation.

use rstest::{fixture, rstest};

use super::*;

fn base_config() -> ProviderConfig {
    ProviderConfig {
        provider_name: String::from(DEFAULT_PROVIDER_NAME),
        work_dir: String::from("/var/lib/hostprov"),
        conf_dir: String::from("/etc/hostprov"),
        log_dir: None,
        log_level: String::from("info"),
        templates_file: String::from(DEFAULT_TEMPLATES_FILE),
        creation_timeout_minutes: 10,
        termination_timeout_minutes: 60,
        retention_hours: 24,
        max_machines_per_request: 1000,
    }
}

#[fixture]
fn provider_config() -> ProviderConfig {
    base_config()
}

#[fixture]
fn scaleway_config() -> ScalewayConfig {
    ScalewayConfig {
        default_project_id: String::from("11111111-2222-3333-4444-555555555555"),
        default_zone: String::from("fr-par-1"),
        scw_bin: String::from("scw"),
    }
}

#[rstest]
fn valid_provider_config_passes(provider_config: ProviderConfig) {
    provider_config
        .validate()
        .unwrap_or_else(|err| panic!("config should validate: {err}"));
}

#[rstest]
#[case::work_dir(ProviderConfig { work_dir: String::new(), ..base_config() }, "PRO_DATA_DIR")]
#[case::conf_dir(ProviderConfig { conf_dir: String::from("  "), ..base_config() }, "PRO_CONF_DIR")]
#[case::provider(
    ProviderConfig { provider_name: String::new(), ..base_config() },
    "HOSTPROV_PROVIDER_NAME"
)]
fn missing_fields_name_their_sources(#[case] config: ProviderConfig, #[case] env_var: &str) {
    let Err(ConfigError::MissingField(message)) = config.validate() else {
        panic!("expected MissingField error");
    };
    assert!(message.contains(env_var), "error should mention {env_var}: {message}");
    assert!(
        message.contains("hostprov.toml"),
        "error should mention config file: {message}"
    );
}

#[rstest]
#[case::creation(ProviderConfig { creation_timeout_minutes: 0, ..base_config() })]
#[case::termination(ProviderConfig { termination_timeout_minutes: 0, ..base_config() })]
#[case::retention(ProviderConfig { retention_hours: 0, ..base_config() })]
#[case::limit(ProviderConfig { max_machines_per_request: 0, ..base_config() })]
fn zero_limits_are_rejected(#[case] config: ProviderConfig) {
    let Err(err) = config.validate() else {
        panic!("zero values should be rejected");
    };
    assert!(matches!(err, ConfigError::Invalid(_)), "unexpected error {err}");
}

#[rstest]
fn scaleway_config_requires_project(scaleway_config: ScalewayConfig) {
    let cfg = ScalewayConfig {
        default_project_id: String::new(),
        ..scaleway_config
    };
    let Err(ConfigError::MissingField(message)) = cfg.validate() else {
        panic!("expected MissingField error");
    };
    assert!(message.contains("SCW_DEFAULT_PROJECT_ID"));
}

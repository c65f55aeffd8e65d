use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub general: General,
    pub server: Server,
    pub provisioner: Provisioner,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct General {
    /// Log verbosity; one of ['trace', 'debug', 'info', 'warn', 'error']. RUST_LOG takes
    /// precedence when set.
    pub log_level: String,

    /// Emit logs as structured json rather than human-readable lines.
    pub log_json: bool,

    /// How long emitted events are kept before the prune loop removes them, in seconds.
    pub event_retention: u64,

    /// How often the prune loop looks for expired events, in seconds.
    pub event_prune_interval: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// Address the api service binds to, e.g. '127.0.0.1:8080'.
    pub bind_address: String,

    /// Path to the sqlite database file.
    pub storage_path: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Provisioner {
    /// Delay applied to each provisioning step in milliseconds. The step runner is a
    /// simulation placeholder; this paces it the way real provisioning work would.
    pub step_delay_ms: u64,

    /// When set, the named step fails with a descriptive error instead of completing.
    /// Dev-mode knob for exercising the failure path end to end.
    pub simulate_failure_step: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: General {
                log_level: "info".to_string(),
                log_json: false,
                event_retention: 604800,
                event_prune_interval: 3600,
            },
            server: Server {
                bind_address: "127.0.0.1:8080".to_string(),
                storage_path: "/tmp/waypost.db".to_string(),
            },
            provisioner: Provisioner {
                step_delay_ms: 2000,
                simulate_failure_step: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::parse_api_config;
    use pretty_assertions::assert_eq;

    #[test]
    /// The embedded configuration file and the in-code defaults must agree; other tests rely
    /// on Config::default() describing a freshly parsed config.
    fn embedded_defaults_match_code_defaults() {
        figment::Jail::expect_with(|_jail| {
            let parsed_config = parse_api_config(&None).unwrap();
            assert_eq!(parsed_config, Config::default());
            Ok(())
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("WAYPOST_GENERAL__LOG_LEVEL", "debug");
            jail.set_env("WAYPOST_SERVER__BIND_ADDRESS", "0.0.0.0:9000");
            jail.set_env("WAYPOST_PROVISIONER__STEP_DELAY_MS", "0");

            let parsed_config = parse_api_config(&None).unwrap();

            assert_eq!(parsed_config.general.log_level, "debug");
            assert_eq!(parsed_config.server.bind_address, "0.0.0.0:9000");
            assert_eq!(parsed_config.provisioner.step_delay_ms, 0);

            // Untouched values still come from the embedded defaults.
            assert_eq!(parsed_config.general.event_retention, 604800);
            Ok(())
        });
    }

    #[test]
    fn config_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "waypost.toml",
                r#"
                [server]
                storage_path = "/var/lib/waypost/waypost.db"
                "#,
            )?;

            let parsed_config = parse_api_config(&None).unwrap();

            assert_eq!(
                parsed_config.server.storage_path,
                "/var/lib/waypost/waypost.db"
            );
            assert_eq!(parsed_config.general.log_level, "info");
            Ok(())
        });
    }
}

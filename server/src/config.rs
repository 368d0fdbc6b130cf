// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;

use changeflow_types::config::{ConfigError, Configuration};

/// Environment variable the supervisor reads the database connection string
/// from. Deliberately kept out of the configuration file.
pub const DB_CONNECTION_STRING_ENV: &str = "CHANGEFLOW_DB_CONNECTION_STRING";

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("configuration loading error: {0}")]
    Figment(#[from] figment::Error),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// Loads the configuration file and merges `CHANGEFLOW_`-prefixed
/// environment overrides on top (nested keys separated with `__`).
pub fn load_configuration(config_file: &Path) -> Result<Configuration, ConfigLoadError> {
    let config: Configuration = Figment::from(Serialized::defaults(Configuration::default()))
        .merge(Toml::file_exact(config_file))
        .merge(
            Env::prefixed("CHANGEFLOW_")
                .split("__")
                .map(|k| k.as_str().replace('_', "-").into()),
        )
        .extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const CONFIG: &str = r#"
broker-url = "nats://broker.internal:4222"

[checkpoint]
table-name = "ingest_offsets"
request-timeout = "3s"

[[tables]]
name = "users"
poll-interval = "1s"
max-poll-interval = "8s"

[[tables]]
name = "orders"
"#;

    #[test]
    fn loads_a_toml_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("changeflow.toml", CONFIG)?;
            let config = load_configuration(Path::new("changeflow.toml")).unwrap();

            assert_eq!(config.broker_url, "nats://broker.internal:4222");
            assert_eq!(config.checkpoint.table_name, "ingest_offsets");
            assert_eq!(
                Duration::from(config.checkpoint.request_timeout),
                Duration::from_secs(3)
            );
            assert_eq!(config.tables.len(), 2);
            assert_eq!(config.tables[0].name, "users");
            assert_eq!(
                Duration::from(config.tables[0].poll_interval),
                Duration::from_secs(1)
            );
            // the second table falls back to the default cadence
            assert_eq!(
                Duration::from(config.tables[1].poll_interval),
                Duration::from_secs(5)
            );
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_the_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("changeflow.toml", CONFIG)?;
            jail.set_env("CHANGEFLOW_BROKER_URL", "nats://other:4222");
            jail.set_env("CHANGEFLOW_CHECKPOINT__TABLE_NAME", "elsewhere");

            let config = load_configuration(Path::new("changeflow.toml")).unwrap();
            assert_eq!(config.broker_url, "nats://other:4222");
            assert_eq!(config.checkpoint.table_name, "elsewhere");
            Ok(())
        });
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("empty.toml", "")?;
            let result = load_configuration(Path::new("empty.toml"));
            assert!(matches!(
                result,
                Err(ConfigLoadError::Invalid(ConfigError::NoTables))
            ));
            Ok(())
        });
    }
}

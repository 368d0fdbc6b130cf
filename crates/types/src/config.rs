// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// # Changeflow configuration
///
/// Loaded from the TOML file passed via `--config-file`. Every entry can be
/// overridden with a `CHANGEFLOW_`-prefixed environment variable. The
/// database connection string deliberately does not live here; the
/// supervisor reads it from `CHANGEFLOW_DB_CONNECTION_STRING` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Configuration {
    /// # Broker URL
    ///
    /// Address of the NATS server carrying checkpoint requests and change
    /// events.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    #[serde(default)]
    pub checkpoint: CheckpointOptions,

    /// # Tables
    ///
    /// The CDC-enabled tables to tail. Each table gets its own poller with
    /// an independent poll cadence.
    #[serde(default)]
    pub tables: Vec<TableOptions>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            broker_url: default_broker_url(),
            checkpoint: CheckpointOptions::default(),
            tables: Vec::new(),
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tables.is_empty() {
            return Err(ConfigError::NoTables);
        }
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            if table.name.is_empty() {
                return Err(ConfigError::EmptyTableName);
            }
            if !seen.insert(table.name.as_str()) {
                return Err(ConfigError::DuplicateTable(table.name.clone()));
            }
            let initial: Duration = table.poll_interval.into();
            let max: Duration = table.max_poll_interval.into();
            if initial.is_zero() || initial > max {
                return Err(ConfigError::InvalidPollInterval {
                    table: table.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// # Checkpoint options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CheckpointOptions {
    /// # Checkpoint table name
    ///
    /// Name of the relational table checkpoints are persisted in.
    #[serde(default = "default_checkpoint_table")]
    pub table_name: String,

    /// # Request timeout
    ///
    /// Upper bound on a single checkpoint load/save round-trip over the
    /// bus. Expiry is surfaced to the poller as a transient error.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: humantime::Duration,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        CheckpointOptions {
            table_name: default_checkpoint_table(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// # Table options
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TableOptions {
    /// # Table name
    pub name: String,

    /// # Poll interval
    ///
    /// Interval between polls while changes are flowing. Doubles after
    /// every empty poll, up to `max-poll-interval`.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: humantime::Duration,

    /// # Max poll interval
    ///
    /// Ceiling for the adaptive poll cadence of an idle table.
    ///
    /// Can be configured using the [`humantime`](https://docs.rs/humantime/latest/humantime/fn.parse_duration.html) format.
    #[serde_as(as = "serde_with::DisplayFromStr")]
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval: humantime::Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no tables configured; nothing to tail")]
    NoTables,
    #[error("a configured table has an empty name")]
    EmptyTableName,
    #[error("table '{0}' is configured more than once")]
    DuplicateTable(String),
    #[error("table '{table}': poll-interval must be non-zero and <= max-poll-interval")]
    InvalidPollInterval { table: String },
}

fn default_broker_url() -> String {
    "nats://127.0.0.1:4222".to_owned()
}

fn default_checkpoint_table() -> String {
    "cdc_offsets".to_owned()
}

fn default_request_timeout() -> humantime::Duration {
    Duration::from_secs(2).into()
}

fn default_poll_interval() -> humantime::Duration {
    Duration::from_secs(5).into()
}

fn default_max_poll_interval() -> humantime::Duration {
    Duration::from_secs(120).into()
}

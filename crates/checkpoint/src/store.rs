// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;

use changeflow_types::lsn::InvalidLsn;
use changeflow_types::Lsn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored position for table '{table}' is invalid: {source}")]
    Corrupt {
        table: String,
        #[source]
        source: InvalidLsn,
    },
}

/// Durable `table -> last-processed-position` mapping.
///
/// Different tables never collide by construction and the same table is
/// written by exactly one poller, so implementations only need per-statement
/// atomicity. Callers must ensure saved positions are non-decreasing; the
/// store does not enforce monotonicity.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Creates the backing table if absent. Idempotent.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Returns the stored position, or `None` if the table has never been
    /// checkpointed.
    async fn load(&self, table: &str) -> Result<Option<Lsn>, StoreError>;

    /// Atomically upserts `(table, position, now)`.
    async fn save(&self, table: &str, position: Lsn) -> Result<(), StoreError>;
}

/// Checkpoint store backed by a Postgres table:
///
/// ```sql
/// table_name TEXT PRIMARY KEY,
/// last_lsn   BYTEA NOT NULL,
/// updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// ```
///
/// Driver errors surface to the caller unretried; retry policy lives with
/// the pollers.
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
    table: String,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool, checkpoint_table: impl Into<String>) -> Self {
        PostgresCheckpointStore {
            pool,
            table: checkpoint_table.into(),
        }
    }

    fn create_statement(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             table_name TEXT PRIMARY KEY, \
             last_lsn BYTEA NOT NULL, \
             updated_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            quote_ident(&self.table)
        )
    }

    fn load_statement(&self) -> String {
        format!(
            "SELECT last_lsn FROM {} WHERE table_name = $1",
            quote_ident(&self.table)
        )
    }

    fn save_statement(&self) -> String {
        format!(
            "INSERT INTO {} (table_name, last_lsn, updated_at) \
             VALUES ($1, $2, now()) \
             ON CONFLICT (table_name) \
             DO UPDATE SET last_lsn = EXCLUDED.last_lsn, updated_at = now()",
            quote_ident(&self.table)
        )
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(&self.create_statement())
            .execute(&self.pool)
            .await?;
        debug!(table = %self.table, "Initialized checkpoint table");
        Ok(())
    }

    async fn load(&self, table: &str) -> Result<Option<Lsn>, StoreError> {
        let row = sqlx::query(&self.load_statement())
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let bytes: Vec<u8> = row.try_get("last_lsn")?;
                let lsn = Lsn::try_from(bytes.as_slice()).map_err(|source| StoreError::Corrupt {
                    table: table.to_owned(),
                    source,
                })?;
                Ok(Some(lsn))
            }
        }
    }

    async fn save(&self, table: &str, position: Lsn) -> Result<(), StoreError> {
        sqlx::query(&self.save_statement())
            .bind(table)
            .bind(position.as_bytes().as_slice())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Quotes a SQL identifier. Positions and table-name values are always bound
/// as parameters; this is only for the checkpoint table identifier, which
/// cannot be bound.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// In-memory store used by tests and as a stand-in where durability is not
/// required.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    positions: Mutex<HashMap<String, Lsn>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load(&self, table: &str) -> Result<Option<Lsn>, StoreError> {
        Ok(self.positions.lock().unwrap().get(table).copied())
    }

    async fn save(&self, table: &str, position: Lsn) -> Result<(), StoreError> {
        self.positions
            .lock()
            .unwrap()
            .insert(table.to_owned(), position);
        Ok(())
    }
}

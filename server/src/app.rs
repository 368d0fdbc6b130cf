// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use changeflow_checkpoint::{
    CheckpointService, CheckpointStore, NatsCheckpointClient, PostgresCheckpointStore,
    ServiceError, StoreError,
};
use changeflow_ingest::{
    CdcReader, InvalidBackoff, NatsEventPublisher, PollBackoff, PollerBuildError,
    ReaderBuildError, TablePoller,
};
use changeflow_types::config::Configuration;

use crate::config::DB_CONNECTION_STRING_ENV;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("database connection string is not set; export {DB_CONNECTION_STRING_ENV}")]
    MissingConnectionString,
    #[error("failed to connect to the source database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to connect to the broker: {0}")]
    Broker(#[from] async_nats::ConnectError),
}

#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    #[error("failed to initialize the checkpoint store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to start the checkpoint service: {0}")]
    CheckpointService(#[from] ServiceError),
    #[error(transparent)]
    Backoff(#[from] InvalidBackoff),
    #[error(transparent)]
    Reader(#[from] ReaderBuildError),
    #[error(transparent)]
    Poller(#[from] PollerBuildError),
    #[error("task panicked: {0}")]
    TaskPanic(#[from] tokio::task::JoinError),
}

/// The supervisor: owns the shared database pool and bus connection, starts
/// the checkpoint service and one table poller per configured table, and
/// awaits them all.
pub struct Application {
    config: Configuration,
    db: PgPool,
    nats: async_nats::Client,
}

impl Application {
    pub async fn create(config: Configuration) -> Result<Self, BuildError> {
        let connection_string = std::env::var(DB_CONNECTION_STRING_ENV)
            .map_err(|_| BuildError::MissingConnectionString)?;
        let db = PgPoolOptions::new()
            .max_connections(config.tables.len() as u32 + 2)
            .connect(&connection_string)
            .await?;
        info!("Connected to the source database");

        let nats = async_nats::connect(config.broker_url.as_str()).await?;
        info!(url = %config.broker_url, "Connected to the broker");

        Ok(Application { config, db, nats })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), ApplicationError> {
        let store = PostgresCheckpointStore::new(
            self.db.clone(),
            self.config.checkpoint.table_name.as_str(),
        );
        store.initialize().await?;

        let mut tasks = JoinSet::new();

        // the service must be subscribed before the first poller asks for
        // its initial position
        let service = CheckpointService::new(self.nats.clone(), store)
            .subscribe()
            .await?;
        tasks.spawn({
            let cancel = cancel.clone();
            service.run(cancel)
        });

        for table in &self.config.tables {
            let backoff = PollBackoff::new(
                table.poll_interval.into(),
                table.max_poll_interval.into(),
            )?;
            let reader = CdcReader::create(self.db.clone(), table.name.clone()).await?;
            let publisher = NatsEventPublisher::new(self.nats.clone());
            let checkpoints = NatsCheckpointClient::new(
                self.nats.clone(),
                self.config.checkpoint.request_timeout.into(),
            );
            let poller = TablePoller::create(
                table.name.clone(),
                reader,
                publisher,
                checkpoints,
                backoff,
            )
            .await?;
            tasks.spawn({
                let cancel = cancel.clone();
                poller.run(cancel)
            });
        }

        info!(tables = self.config.tables.len(), "Changeflow is running");

        let mut first_panic = None;
        while let Some(result) = tasks.join_next().await {
            if let Err(join_error) = result {
                error!(%join_error, "A pipeline task panicked, shutting down");
                cancel.cancel();
                first_panic.get_or_insert(join_error);
            }
        }

        // all tasks have observed cancellation; release shared resources
        if let Err(err) = self.nats.flush().await {
            warn!(%err, "Failed to flush the bus connection during shutdown");
        }
        self.db.close().await;

        match first_panic {
            Some(join_error) => Err(ApplicationError::TaskPanic(join_error)),
            None => Ok(()),
        }
    }
}

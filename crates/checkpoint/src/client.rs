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

use async_trait::async_trait;
use tracing::debug;

use changeflow_types::checkpoint::{
    LoadCheckpointRequest, LoadCheckpointResponse, SaveCheckpointRequest, SaveCheckpointResponse,
};
use changeflow_types::lsn::InvalidLsn;
use changeflow_types::{subjects, Lsn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("checkpoint request timed out after {0:?}")]
    Timeout(Duration),
    #[error("bus request failed: {0}")]
    Request(#[from] async_nats::RequestError),
    #[error("checkpoint message codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("checkpoint service reported: {0}")]
    Remote(String),
    #[error("checkpoint reply carried an invalid position: {0}")]
    Position(#[from] InvalidLsn),
}

/// The pollers' view of checkpoint persistence.
///
/// Kept as a trait so pollers can be exercised against an in-memory
/// implementation; the production implementation goes through the bus.
#[async_trait]
pub trait Checkpoints: Send + Sync {
    /// Fetches the last persisted position for `table`; the origin position
    /// if the table was never checkpointed.
    async fn load(&self, table: &str) -> Result<Lsn, ClientError>;

    /// Persists `position` for `table`. Returns only once the service has
    /// acknowledged the write as durable.
    async fn save(&self, table: &str, position: Lsn) -> Result<(), ClientError>;
}

/// Checkpoint access over bus request/reply.
///
/// The extra hop (instead of the poller writing to the database directly)
/// keeps persistence relocatable behind the subject names.
#[derive(Clone)]
pub struct NatsCheckpointClient {
    client: async_nats::Client,
    timeout: Duration,
}

impl NatsCheckpointClient {
    pub fn new(client: async_nats::Client, timeout: Duration) -> Self {
        NatsCheckpointClient { client, timeout }
    }

    async fn request(&self, subject: &'static str, payload: Vec<u8>) -> Result<bytes::Bytes, ClientError> {
        let request = self.client.request(subject, payload.into());
        let message = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))??;
        Ok(message.payload)
    }
}

#[async_trait]
impl Checkpoints for NatsCheckpointClient {
    async fn load(&self, table: &str) -> Result<Lsn, ClientError> {
        let payload = serde_json::to_vec(&LoadCheckpointRequest {
            table_name: table.to_owned(),
        })?;
        let reply = self.request(subjects::CHECKPOINT_LOAD, payload).await?;
        let response: LoadCheckpointResponse = serde_json::from_slice(&reply)?;
        if let Some(error) = response.error {
            return Err(ClientError::Remote(error));
        }
        let position = Lsn::try_from(response.last_lsn.as_slice())?;
        debug!(table, %position, "Loaded checkpoint");
        Ok(position)
    }

    async fn save(&self, table: &str, position: Lsn) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(&SaveCheckpointRequest::new(table, position))?;
        let reply = self.request(subjects::CHECKPOINT_SAVE, payload).await?;
        let response: SaveCheckpointResponse = serde_json::from_slice(&reply)?;
        if let Some(error) = response.error {
            return Err(ClientError::Remote(error));
        }
        debug!(table, %position, "Saved checkpoint");
        Ok(())
    }
}

// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Request/reply endpoint exposing the checkpoint store over the bus.
//!
//! One subscriber task per subject, each dispatching requests synchronously
//! against the shared store. Running multiple instances is safe; concurrent
//! writers for the same table are excluded at the supervisor level, not
//! here.

use std::sync::Arc;

use async_nats::{Client, Subject, Subscriber};
use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use changeflow_types::checkpoint::{
    LoadCheckpointRequest, LoadCheckpointResponse, SaveCheckpointRequest, SaveCheckpointResponse,
};
use changeflow_types::{subjects, Lsn};

use crate::metric_definitions::{
    describe_metrics, CHECKPOINT_REQUESTS, CHECKPOINT_REQUEST_FAILURES,
};
use crate::store::CheckpointStore;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to subscribe to '{subject}': {source}")]
    Subscribe {
        subject: &'static str,
        #[source]
        source: async_nats::SubscribeError,
    },
}

pub struct CheckpointService<S> {
    client: Client,
    store: Arc<S>,
}

/// A [`CheckpointService`] whose subscriptions are established. Requests
/// sent after [`CheckpointService::subscribe`] returned are guaranteed to be
/// seen by [`run`](RunningCheckpointService::run).
pub struct RunningCheckpointService<S> {
    client: Client,
    store: Arc<S>,
    load_subscription: Subscriber,
    save_subscription: Subscriber,
}

impl<S> CheckpointService<S>
where
    S: CheckpointStore + 'static,
{
    pub fn new(client: Client, store: S) -> Self {
        CheckpointService {
            client,
            store: Arc::new(store),
        }
    }

    /// Establishes the per-subject subscriptions. Failure here is fatal for
    /// the process: a pipeline without checkpoint persistence cannot make
    /// durable progress.
    pub async fn subscribe(self) -> Result<RunningCheckpointService<S>, ServiceError> {
        describe_metrics();

        let load_subscription = self
            .client
            .subscribe(subjects::CHECKPOINT_LOAD)
            .await
            .map_err(|source| ServiceError::Subscribe {
                subject: subjects::CHECKPOINT_LOAD,
                source,
            })?;
        let save_subscription = self
            .client
            .subscribe(subjects::CHECKPOINT_SAVE)
            .await
            .map_err(|source| ServiceError::Subscribe {
                subject: subjects::CHECKPOINT_SAVE,
                source,
            })?;

        Ok(RunningCheckpointService {
            client: self.client,
            store: self.store,
            load_subscription,
            save_subscription,
        })
    }
}

impl<S> RunningCheckpointService<S>
where
    S: CheckpointStore + 'static,
{
    /// Serves both checkpoint subjects until cancellation, one task per
    /// subject. Everything past subscription is contained and logged, never
    /// propagated.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Checkpoint service is listening for requests");

        let loads = tokio::spawn(serve_loads(
            self.client.clone(),
            Arc::clone(&self.store),
            self.load_subscription,
            cancel.clone(),
        ));
        let saves = tokio::spawn(serve_saves(
            self.client,
            self.store,
            self.save_subscription,
            cancel,
        ));

        for handle in [loads, saves] {
            if let Err(join_error) = handle.await {
                error!(%join_error, "Checkpoint subscriber panicked");
            }
        }

        info!("Checkpoint service stopped");
    }
}

async fn serve_loads<S: CheckpointStore>(
    client: Client,
    store: Arc<S>,
    mut subscription: Subscriber,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            maybe = subscription.next() => match maybe {
                Some(message) => message,
                // subscription ended, e.g. connection closed for good
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let Some(reply) = message.reply else {
            warn!(
                subject = subjects::CHECKPOINT_LOAD,
                "Ignoring checkpoint request without reply subject"
            );
            continue;
        };

        if let Some(response) = load_reply(store.as_ref(), &message.payload).await {
            respond(&client, subjects::CHECKPOINT_LOAD, reply, &response).await;
        }
    }
}

async fn serve_saves<S: CheckpointStore>(
    client: Client,
    store: Arc<S>,
    mut subscription: Subscriber,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            maybe = subscription.next() => match maybe {
                Some(message) => message,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let Some(reply) = message.reply else {
            warn!(
                subject = subjects::CHECKPOINT_SAVE,
                "Ignoring checkpoint request without reply subject"
            );
            continue;
        };

        if let Some(response) = save_reply(store.as_ref(), &message.payload).await {
            respond(&client, subjects::CHECKPOINT_SAVE, reply, &response).await;
        }
    }
}

async fn respond<R: Serialize>(client: &Client, subject: &'static str, reply: Subject, response: &R) {
    let payload = match serde_json::to_vec(response) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(subject, %err, "Failed to encode checkpoint reply");
            return;
        }
    };
    if let Err(err) = client.publish(reply, payload.into()).await {
        warn!(subject, %err, "Failed to send checkpoint reply");
    }
}

/// Builds the reply for a `checkpoint.load` request, or `None` if the
/// request cannot be parsed (the caller's timeout covers the dropped reply).
async fn load_reply<S: CheckpointStore>(
    store: &S,
    payload: &[u8],
) -> Option<LoadCheckpointResponse> {
    let request: LoadCheckpointRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "Dropping malformed checkpoint load request");
            return None;
        }
    };
    counter!(CHECKPOINT_REQUESTS, "subject" => subjects::CHECKPOINT_LOAD).increment(1);

    Some(match store.load(&request.table_name).await {
        Ok(Some(lsn)) => LoadCheckpointResponse::position(lsn),
        Ok(None) => {
            debug!(
                table = %request.table_name,
                "No checkpoint recorded yet, replying with origin"
            );
            LoadCheckpointResponse::position(Lsn::ORIGIN)
        }
        Err(err) => {
            counter!(CHECKPOINT_REQUEST_FAILURES, "subject" => subjects::CHECKPOINT_LOAD)
                .increment(1);
            warn!(table = %request.table_name, %err, "Failed to load checkpoint");
            LoadCheckpointResponse::failure(err.to_string())
        }
    })
}

/// Builds the reply for a `checkpoint.save` request.
async fn save_reply<S: CheckpointStore>(
    store: &S,
    payload: &[u8],
) -> Option<SaveCheckpointResponse> {
    let request: SaveCheckpointRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, "Dropping malformed checkpoint save request");
            return None;
        }
    };
    counter!(CHECKPOINT_REQUESTS, "subject" => subjects::CHECKPOINT_SAVE).increment(1);

    let position = match Lsn::try_from(request.last_lsn.as_slice()) {
        Ok(position) => position,
        Err(err) => {
            return Some(SaveCheckpointResponse::failure(format!(
                "invalid position for table {}: {err}",
                request.table_name
            )));
        }
    };

    Some(match store.save(&request.table_name, position).await {
        Ok(()) => {
            debug!(table = %request.table_name, %position, "Saved checkpoint");
            SaveCheckpointResponse::ok()
        }
        Err(err) => {
            counter!(CHECKPOINT_REQUEST_FAILURES, "subject" => subjects::CHECKPOINT_SAVE)
                .increment(1);
            warn!(table = %request.table_name, %err, "Failed to save checkpoint");
            SaveCheckpointResponse::failure(err.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::store::{InMemoryCheckpointStore, StoreError};

    struct FailingStore;

    #[async_trait]
    impl CheckpointStore for FailingStore {
        async fn initialize(&self) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn load(&self, _table: &str) -> Result<Option<Lsn>, StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn save(&self, _table: &str, _position: Lsn) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }
    }

    fn load_request(table: &str) -> Vec<u8> {
        serde_json::to_vec(&LoadCheckpointRequest {
            table_name: table.to_owned(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_table_loads_as_origin_without_error() {
        let store = InMemoryCheckpointStore::new();
        let response = load_reply(&store, &load_request("users")).await.unwrap();
        assert_eq!(response.last_lsn, Lsn::ORIGIN.to_vec());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn load_returns_saved_position() {
        let store = InMemoryCheckpointStore::new();
        let lsn = Lsn::from_hex("00000000000000000005").unwrap();
        let request = serde_json::to_vec(&SaveCheckpointRequest::new("users", lsn)).unwrap();
        let saved = save_reply(&store, &request).await.unwrap();
        assert!(saved.error.is_none());

        let response = load_reply(&store, &load_request("users")).await.unwrap();
        assert_eq!(response.last_lsn, lsn.to_vec());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn malformed_requests_get_no_reply() {
        let store = InMemoryCheckpointStore::new();
        assert!(load_reply(&store, b"not json").await.is_none());
        assert!(save_reply(&store, b"{\"table_name\":5}").await.is_none());
    }

    #[tokio::test]
    async fn save_rejects_wrong_length_position() {
        let store = InMemoryCheckpointStore::new();
        let request = serde_json::to_vec(&serde_json::json!({
            "table_name": "users",
            // 4 bytes instead of 10
            "last_lsn": "AAAAAA==",
        }))
        .unwrap();
        let response = save_reply(&store, &request).await.unwrap();
        assert!(response.error.unwrap().contains("invalid position"));
        assert!(store.load("users").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_failures_travel_in_the_error_field() {
        let response = load_reply(&FailingStore, &load_request("users"))
            .await
            .unwrap();
        assert!(response.error.is_some());
        assert!(response.last_lsn.is_empty());

        let request = serde_json::to_vec(&SaveCheckpointRequest::new(
            "users",
            Lsn::from_hex("00000000000000000001").unwrap(),
        ))
        .unwrap();
        let response = save_reply(&FailingStore, &request).await.unwrap();
        assert!(response.error.is_some());
    }
}

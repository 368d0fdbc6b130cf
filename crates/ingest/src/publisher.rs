// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use async_trait::async_trait;
use tracing::trace;

use changeflow_types::{subjects, ChangeEvent};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to encode change event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to hand change event to the bus: {0}")]
    Publish(#[from] async_nats::PublishError),
}

/// Destination for change events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Hands one event to the bus. Success means local hand-off to the
    /// client, not broker-acknowledged delivery.
    async fn publish(&self, event: &ChangeEvent) -> Result<(), SinkError>;
}

/// Publishes change events as JSON on a fixed subject.
#[derive(Clone)]
pub struct NatsEventPublisher {
    client: async_nats::Client,
    subject: String,
}

impl NatsEventPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        NatsEventPublisher {
            client,
            subject: subjects::CDC_EVENT.to_owned(),
        }
    }
}

#[async_trait]
impl EventSink for NatsEventPublisher {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;
        trace!(
            table = %event.metadata.table,
            position = %event.position(),
            subject = %self.subject,
            "Published change event"
        );
        Ok(())
    }
}

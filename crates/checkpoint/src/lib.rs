// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable per-table progress tracking: the checkpoint store, the bus
//! service wrapping it, and the poller-side client.

pub mod client;
mod metric_definitions;
pub mod service;
pub mod store;

pub use client::{Checkpoints, ClientError, NatsCheckpointClient};
pub use service::{CheckpointService, RunningCheckpointService, ServiceError};
pub use store::{CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore, StoreError};

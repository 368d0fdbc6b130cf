// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! CDC ingestion: the per-table reader, the adaptive poll backoff, the
//! event publisher, and the polling loop tying them together.

pub mod backoff;
mod metric_definitions;
pub mod poller;
pub mod publisher;
pub mod reader;

pub use backoff::{InvalidBackoff, PollBackoff};
pub use poller::{PollerBuildError, TablePoller, TickOutcome};
pub use publisher::{EventSink, NatsEventPublisher, SinkError};
pub use reader::{CdcReader, ChangeBatch, ChangeSource, ReaderBuildError, SourceError};

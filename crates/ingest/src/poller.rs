// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-table polling loop.
//!
//! Delivery is at-least-once: events are published before the position is
//! persisted, so a crash between the two re-delivers the batch on the next
//! run. Downstream consumers deduplicate on `metadata.position`.

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use changeflow_checkpoint::{Checkpoints, ClientError};
use changeflow_types::Lsn;

use crate::backoff::PollBackoff;
use crate::metric_definitions::{
    describe_metrics, FAILED_TICKS, PUBLISHED_EVENTS, TABLE_POLLS,
};
use crate::publisher::EventSink;
use crate::reader::ChangeSource;

#[derive(Debug, thiserror::Error)]
pub enum PollerBuildError {
    #[error("failed to load initial position for table '{table}': {source}")]
    InitialPosition {
        table: String,
        #[source]
        source: ClientError,
    },
}

/// What one tick did; drives the backoff controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A batch was published and its position persisted.
    Published(usize),
    /// The poll returned no changes.
    Empty,
    /// A transient failure; the position did not advance.
    Failed,
}

/// Long-running poll loop for one table: fetch, publish, advance, persist,
/// sleep.
///
/// `last_position` is written by exactly this poller; everything else reads
/// it through the checkpoint store.
pub struct TablePoller<Source, Sink, C> {
    table: String,
    source: Source,
    sink: Sink,
    checkpoints: C,
    backoff: PollBackoff,
    last_position: Lsn,
}

impl<Source, Sink, C> TablePoller<Source, Sink, C>
where
    Source: ChangeSource,
    Sink: EventSink,
    C: Checkpoints,
{
    /// Builds the poller and loads its starting position over the bus.
    /// Failure here is fatal for startup; a poller that cannot learn where
    /// to resume must not run.
    pub async fn create(
        table: impl Into<String>,
        source: Source,
        sink: Sink,
        checkpoints: C,
        backoff: PollBackoff,
    ) -> Result<Self, PollerBuildError> {
        let table = table.into();
        let last_position =
            checkpoints
                .load(&table)
                .await
                .map_err(|source| PollerBuildError::InitialPosition {
                    table: table.clone(),
                    source,
                })?;
        info!(table = %table, position = %last_position, "Resuming CDC ingestion");
        Ok(TablePoller {
            table,
            source,
            sink,
            checkpoints,
            backoff,
            last_position,
        })
    }

    /// Runs until cancellation. Errors inside the loop are contained and
    /// logged; the loop never exits on its own.
    pub async fn run(mut self, cancel: CancellationToken) {
        describe_metrics();
        info!(table = %self.table, "Starting table poller");

        while !cancel.is_cancelled() {
            self.poll_once().await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff.current()) => {}
            }
        }

        info!(table = %self.table, "Table poller stopped");
    }

    /// One poll plus the backoff update it implies.
    async fn poll_once(&mut self) -> TickOutcome {
        let outcome = self.tick().await;
        match outcome {
            TickOutcome::Published(count) => {
                counter!(PUBLISHED_EVENTS, "table" => self.table.clone()).increment(count as u64);
                self.backoff.on_nonempty();
            }
            TickOutcome::Empty => {
                self.backoff.on_empty();
                debug!(
                    table = %self.table,
                    next_poll = ?self.backoff.current(),
                    "No changes found"
                );
            }
            TickOutcome::Failed => {
                counter!(FAILED_TICKS, "table" => self.table.clone()).increment(1);
                self.backoff.on_error();
            }
        }
        outcome
    }

    /// fetch -> publish-all -> advance -> persist. Any failure leaves
    /// `last_position` at its pre-tick value so the next tick refetches and
    /// republishes the same batch.
    async fn tick(&mut self) -> TickOutcome {
        counter!(TABLE_POLLS, "table" => self.table.clone()).increment(1);

        let batch = match self.source.fetch(self.last_position).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(table = %self.table, %err, "Failed to fetch changes");
                return TickOutcome::Failed;
            }
        };

        if batch.changes.is_empty() {
            return TickOutcome::Empty;
        }

        for event in &batch.changes {
            if let Err(err) = self.sink.publish(event).await {
                warn!(
                    table = %self.table,
                    position = %event.position(),
                    %err,
                    "Failed to publish change event"
                );
                return TickOutcome::Failed;
            }
        }

        let published = batch.changes.len();
        let previous = self.last_position;
        self.last_position = batch.next_position;

        if let Err(err) = self.checkpoints.save(&self.table, self.last_position).await {
            warn!(
                table = %self.table,
                position = %self.last_position,
                %err,
                "Failed to persist checkpoint"
            );
            // the batch gets republished next tick; at-least-once
            self.last_position = previous;
            return TickOutcome::Failed;
        }

        debug!(
            table = %self.table,
            position = %self.last_position,
            published,
            "Advanced checkpoint"
        );
        TickOutcome::Published(published)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use indexmap::IndexMap;

    use changeflow_types::{ChangeEvent, OperationKind};

    use super::*;
    use crate::reader::{ChangeBatch, SourceError};
    use crate::publisher::SinkError;

    fn lsn(suffix: u8) -> Lsn {
        let mut bytes = [0u8; 10];
        bytes[9] = suffix;
        Lsn::from(bytes)
    }

    fn event(position: Lsn, operation: OperationKind) -> ChangeEvent {
        let mut data = IndexMap::new();
        data.insert("name".to_owned(), Some("Alice".to_owned()));
        ChangeEvent::new("users", position, operation, data)
    }

    fn batch(events: Vec<ChangeEvent>) -> ChangeBatch {
        let next_position = events.last().unwrap().position();
        ChangeBatch {
            changes: events,
            next_position,
        }
    }

    /// Serves scripted fetch results; empty forever once the script runs
    /// out.
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<ChangeBatch, SourceError>>>,
    }

    impl ScriptedSource {
        fn push(&self, result: Result<ChangeBatch, SourceError>) {
            self.script.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl ChangeSource for &ScriptedSource {
        async fn fetch(&self, after: Lsn) -> Result<ChangeBatch, SourceError> {
            match self.script.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(ChangeBatch::empty(after)),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<ChangeEvent>>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl EventSink for &RecordingSink {
        async fn publish(&self, event: &ChangeEvent) -> Result<(), SinkError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(SinkError::Encode(serde_json::Error::io(
                    std::io::Error::other("sink unavailable"),
                )));
            }
            self.published.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeCheckpoints {
        positions: Mutex<HashMap<String, Lsn>>,
        fail_saves: AtomicBool,
    }

    impl FakeCheckpoints {
        fn stored(&self, table: &str) -> Option<Lsn> {
            self.positions.lock().unwrap().get(table).copied()
        }
    }

    #[async_trait]
    impl Checkpoints for &FakeCheckpoints {
        async fn load(&self, table: &str) -> Result<Lsn, ClientError> {
            Ok(self.stored(table).unwrap_or(Lsn::ORIGIN))
        }

        async fn save(&self, table: &str, position: Lsn) -> Result<(), ClientError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(ClientError::Timeout(Duration::from_secs(2)));
            }
            self.positions
                .lock()
                .unwrap()
                .insert(table.to_owned(), position);
            Ok(())
        }
    }

    async fn poller<'a>(
        source: &'a ScriptedSource,
        sink: &'a RecordingSink,
        checkpoints: &'a FakeCheckpoints,
    ) -> TablePoller<&'a ScriptedSource, &'a RecordingSink, &'a FakeCheckpoints> {
        let backoff = PollBackoff::new(Duration::from_secs(1), Duration::from_secs(8)).unwrap();
        TablePoller::create("users", source, sink, checkpoints, backoff)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cold_start_with_no_rows() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        let mut poller = poller(&source, &sink, &checkpoints).await;
        assert_eq!(poller.last_position, Lsn::ORIGIN);

        let outcome = poller.poll_once().await;

        assert_eq!(outcome, TickOutcome::Empty);
        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(checkpoints.stored("users"), None);
        assert_eq!(poller.backoff.current(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn single_insert_publishes_persists_and_resets_backoff() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        let position = lsn(0x05);
        source.push(Ok(batch(vec![event(position, OperationKind::Insert)])));

        let mut poller = poller(&source, &sink, &checkpoints).await;
        // grow the interval first so the reset is observable
        poller.backoff.on_empty();

        let outcome = poller.poll_once().await;

        assert_eq!(outcome, TickOutcome::Published(1));
        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].metadata.operation_type, OperationKind::Insert);
        assert_eq!(
            published[0].metadata.position.to_string(),
            "00000000000000000005"
        );
        assert_eq!(checkpoints.stored("users"), Some(position));
        assert_eq!(poller.last_position, position);
        assert_eq!(poller.backoff.current(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn mixed_batch_publishes_in_order() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        source.push(Ok(batch(vec![
            event(lsn(0x01), OperationKind::Delete),
            event(lsn(0x02), OperationKind::Update),
            event(lsn(0x03), OperationKind::Insert),
        ])));

        let mut poller = poller(&source, &sink, &checkpoints).await;
        poller.poll_once().await;

        let published = sink.published.lock().unwrap();
        let positions: Vec<_> = published.iter().map(|e| e.position()).collect();
        assert_eq!(positions, vec![lsn(0x01), lsn(0x02), lsn(0x03)]);
        assert_eq!(checkpoints.stored("users"), Some(lsn(0x03)));
    }

    #[tokio::test]
    async fn checkpoint_advances_past_trailing_skipped_rows() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        // the row at ..05 decoded to no event (unknown operation code), so
        // the batch carries a next_position beyond its last change
        source.push(Ok(ChangeBatch {
            changes: vec![event(lsn(0x04), OperationKind::Insert)],
            next_position: lsn(0x05),
        }));

        let mut poller = poller(&source, &sink, &checkpoints).await;
        poller.poll_once().await;

        assert_eq!(sink.published.lock().unwrap().len(), 1);
        assert_eq!(checkpoints.stored("users"), Some(lsn(0x05)));
    }

    #[tokio::test]
    async fn publish_failure_keeps_position_then_recovers() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        let failing = batch(vec![event(lsn(0x06), OperationKind::Insert)]);
        source.push(Ok(failing.clone()));
        source.push(Ok(failing));
        sink.fail_next.store(true, Ordering::SeqCst);

        let mut poller = poller(&source, &sink, &checkpoints).await;

        let outcome = poller.poll_once().await;
        assert_eq!(outcome, TickOutcome::Failed);
        assert_eq!(checkpoints.stored("users"), None);
        assert_eq!(poller.last_position, Lsn::ORIGIN);
        // failure keeps the interval
        assert_eq!(poller.backoff.current(), Duration::from_secs(1));

        let outcome = poller.poll_once().await;
        assert_eq!(outcome, TickOutcome::Published(1));
        assert_eq!(checkpoints.stored("users"), Some(lsn(0x06)));
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persist_failure_rolls_the_position_back() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        let the_batch = batch(vec![event(lsn(0x07), OperationKind::Update)]);
        source.push(Ok(the_batch.clone()));
        source.push(Ok(the_batch));
        checkpoints.fail_saves.store(true, Ordering::SeqCst);

        let mut poller = poller(&source, &sink, &checkpoints).await;

        let outcome = poller.poll_once().await;
        assert_eq!(outcome, TickOutcome::Failed);
        assert_eq!(poller.last_position, Lsn::ORIGIN);
        assert_eq!(checkpoints.stored("users"), None);

        // once the service is back the same batch goes through again
        checkpoints.fail_saves.store(false, Ordering::SeqCst);
        let outcome = poller.poll_once().await;
        assert_eq!(outcome, TickOutcome::Published(1));
        assert_eq!(checkpoints.stored("users"), Some(lsn(0x07)));
        // republished: at-least-once, deduplicated downstream by position
        assert_eq!(sink.published.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fetch_error_keeps_backoff_and_position() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        source.push(Err(SourceError::Database(sqlx::Error::PoolClosed)));

        let mut poller = poller(&source, &sink, &checkpoints).await;
        poller.backoff.on_empty();
        poller.backoff.on_empty();

        let outcome = poller.poll_once().await;

        assert_eq!(outcome, TickOutcome::Failed);
        assert_eq!(poller.last_position, Lsn::ORIGIN);
        assert_eq!(poller.backoff.current(), Duration::from_secs(4));
        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn backoff_decays_and_recovers_across_polls() {
        let (source, sink, checkpoints): (ScriptedSource, RecordingSink, FakeCheckpoints) = Default::default();
        // empty, empty, empty are served by the exhausted script
        let mut poller = poller(&source, &sink, &checkpoints).await;

        let mut observed = Vec::new();
        for _ in 0..3 {
            poller.poll_once().await;
            observed.push(poller.backoff.current());
        }
        source.push(Ok(batch(vec![event(lsn(0x08), OperationKind::Insert)])));
        poller.poll_once().await;
        observed.push(poller.backoff.current());

        assert_eq!(
            observed,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(1),
            ]
        );
    }

    #[tokio::test]
    async fn resumes_from_the_stored_position() {
        let (source, sink, checkpoints) = <(
            ScriptedSource,
            RecordingSink,
            FakeCheckpoints,
        )>::default();
        (&checkpoints).save("users", lsn(0x0a)).await.unwrap();

        let poller = poller(&source, &sink, &checkpoints).await;
        assert_eq!(poller.last_position, lsn(0x0a));
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancellation() {
        let source = Arc::new(ScriptedSource::default());
        let sink = Arc::new(RecordingSink::default());
        let checkpoints = Arc::new(FakeCheckpoints::default());

        let backoff = PollBackoff::new(Duration::from_secs(1), Duration::from_secs(8)).unwrap();
        let poller = TablePoller::create(
            "users",
            ArcSource(Arc::clone(&source)),
            ArcSink(Arc::clone(&sink)),
            ArcCheckpoints(Arc::clone(&checkpoints)),
            backoff,
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    struct ArcSource(Arc<ScriptedSource>);
    struct ArcSink(Arc<RecordingSink>);
    struct ArcCheckpoints(Arc<FakeCheckpoints>);

    #[async_trait]
    impl ChangeSource for ArcSource {
        async fn fetch(&self, after: Lsn) -> Result<ChangeBatch, SourceError> {
            (&*self.0).fetch(after).await
        }
    }

    #[async_trait]
    impl EventSink for ArcSink {
        async fn publish(&self, event: &ChangeEvent) -> Result<(), SinkError> {
            (&*self.0).publish(event).await
        }
    }

    #[async_trait]
    impl Checkpoints for ArcCheckpoints {
        async fn save(&self, table: &str, position: Lsn) -> Result<(), ClientError> {
            (&*self.0).save(table, position).await
        }

        async fn load(&self, table: &str) -> Result<Lsn, ClientError> {
            (&*self.0).load(table).await
        }
    }
}

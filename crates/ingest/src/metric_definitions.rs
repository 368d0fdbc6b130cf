// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use metrics::{describe_counter, Unit};

pub const TABLE_POLLS: &str = "changeflow.ingest.polls.total";
pub const PUBLISHED_EVENTS: &str = "changeflow.ingest.published_events.total";
pub const FAILED_TICKS: &str = "changeflow.ingest.failed_ticks.total";

pub(crate) fn describe_metrics() {
    describe_counter!(
        TABLE_POLLS,
        Unit::Count,
        "Number of CDC polls issued, labeled by table"
    );
    describe_counter!(
        PUBLISHED_EVENTS,
        Unit::Count,
        "Number of change events published, labeled by table"
    );
    describe_counter!(
        FAILED_TICKS,
        Unit::Count,
        "Number of poll ticks that ended in a transient failure, labeled by table"
    );
}

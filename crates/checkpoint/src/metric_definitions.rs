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

pub const CHECKPOINT_REQUESTS: &str = "changeflow.checkpoint.requests.total";
pub const CHECKPOINT_REQUEST_FAILURES: &str = "changeflow.checkpoint.request_failures.total";

pub(crate) fn describe_metrics() {
    describe_counter!(
        CHECKPOINT_REQUESTS,
        Unit::Count,
        "Number of checkpoint load/save requests served, labeled by subject"
    );
    describe_counter!(
        CHECKPOINT_REQUEST_FAILURES,
        Unit::Count,
        "Number of checkpoint requests that failed against the store, labeled by subject"
    );
}

// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Well-known bus subjects.

/// Request/reply subject for loading a table's checkpoint.
pub const CHECKPOINT_LOAD: &str = "checkpoint.load";

/// Request/reply subject for persisting a table's checkpoint.
pub const CHECKPOINT_SAVE: &str = "checkpoint.save";

/// Subject change events are published on.
pub const CDC_EVENT: &str = "cdc.event";

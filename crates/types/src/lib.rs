// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Core types shared across the changeflow pipeline: log positions, change
//! events, checkpoint wire messages, and configuration.

pub mod change;
pub mod checkpoint;
pub mod config;
pub mod lsn;
pub mod subjects;

pub use change::{ChangeEvent, ChangeMetadata, OperationKind};
pub use lsn::{InvalidLsn, Lsn, LSN_LEN};

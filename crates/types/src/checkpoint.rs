// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Wire messages of the checkpoint request/reply protocol.
//!
//! Both subjects use correlated request/reply: a save must be acknowledged
//! because a poller only advances once it knows the write is durable. LSN
//! bytes travel base64-encoded inside JSON bodies; the optional `error`
//! field carries a remote failure back to the requester.

use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;

use crate::lsn::Lsn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadCheckpointRequest {
    pub table_name: String,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadCheckpointResponse {
    #[serde_as(as = "Base64")]
    pub last_lsn: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoadCheckpointResponse {
    /// A reply carrying a position. Unknown tables reply with
    /// [`Lsn::ORIGIN`] and no error so that first-time callers start
    /// cleanly.
    pub fn position(lsn: Lsn) -> Self {
        LoadCheckpointResponse {
            last_lsn: lsn.to_vec(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        LoadCheckpointResponse {
            last_lsn: Vec::new(),
            error: Some(error.into()),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveCheckpointRequest {
    pub table_name: String,
    #[serde_as(as = "Base64")]
    pub last_lsn: Vec<u8>,
}

impl SaveCheckpointRequest {
    pub fn new(table_name: impl Into<String>, lsn: Lsn) -> Self {
        SaveCheckpointRequest {
            table_name: table_name.into(),
            last_lsn: lsn.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveCheckpointResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SaveCheckpointResponse {
    pub fn ok() -> Self {
        SaveCheckpointResponse { error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        SaveCheckpointResponse {
            error: Some(error.into()),
        }
    }
}

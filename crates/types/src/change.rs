// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::lsn::Lsn;

/// The kind of row mutation a change record describes.
///
/// The discriminants are the operation codes of the CDC projection. Codes
/// outside this set (e.g. update before-images) carry no event and are
/// skipped by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Delete,
    Insert,
    Update,
}

impl OperationKind {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(OperationKind::Delete),
            2 => Some(OperationKind::Insert),
            4 => Some(OperationKind::Update),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            OperationKind::Delete => 1,
            OperationKind::Insert => 2,
            OperationKind::Update => 4,
        }
    }
}

/// Where and what a change event originated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub table: String,
    pub position: Lsn,
    pub operation_type: OperationKind,
    pub operation_code: i32,
}

/// A single captured row mutation, ready to be published.
///
/// `data` maps column name to the column's textual value (or `None` for SQL
/// NULL) and preserves the source table's column declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub metadata: ChangeMetadata,
    pub data: IndexMap<String, Option<String>>,
}

impl ChangeEvent {
    pub fn new(
        table: impl Into<String>,
        position: Lsn,
        operation: OperationKind,
        data: IndexMap<String, Option<String>>,
    ) -> Self {
        ChangeEvent {
            metadata: ChangeMetadata {
                table: table.into(),
                position,
                operation_type: operation,
                operation_code: operation.code(),
            },
            data,
        }
    }

    pub fn position(&self) -> Lsn {
        self.metadata.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_event() -> ChangeEvent {
        let mut data = IndexMap::new();
        data.insert("id".to_owned(), Some("1".to_owned()));
        data.insert("name".to_owned(), Some("Alice".to_owned()));
        data.insert("nickname".to_owned(), None);
        ChangeEvent::new(
            "users",
            Lsn::from_hex("00000000000000000005").unwrap(),
            OperationKind::Insert,
            data,
        )
    }

    #[test]
    fn operation_code_table() {
        assert_eq!(OperationKind::from_code(1), Some(OperationKind::Delete));
        assert_eq!(OperationKind::from_code(2), Some(OperationKind::Insert));
        assert_eq!(OperationKind::from_code(4), Some(OperationKind::Update));
        // 3 is the update before-image, 0/5 are unknown; none yield events.
        assert_eq!(OperationKind::from_code(3), None);
        assert_eq!(OperationKind::from_code(0), None);
        assert_eq!(OperationKind::from_code(5), None);
    }

    #[test]
    fn event_json_shape() {
        let json = serde_json::to_value(insert_event()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "metadata": {
                    "table": "users",
                    "position": "00000000000000000005",
                    "operation_type": "Insert",
                    "operation_code": 2,
                },
                "data": {
                    "id": "1",
                    "name": "Alice",
                    "nickname": null,
                }
            })
        );
    }

    #[test]
    fn data_keys_keep_declaration_order() {
        let serialized = serde_json::to_string(&insert_event()).unwrap();
        let id = serialized.find("\"id\"").unwrap();
        let name = serialized.find("\"name\"").unwrap();
        let nickname = serialized.find("\"nickname\"").unwrap();
        assert!(id < name && name < nickname);
    }

    #[test]
    fn serde_round_trip() {
        let event = insert_event();
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: ChangeEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, event);
    }
}

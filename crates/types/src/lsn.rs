// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;

use hex::FromHex;

/// Width of a log sequence number in bytes. All positions handled by the
/// pipeline have exactly this length; comparison is only meaningful between
/// positions of equal length.
pub const LSN_LEN: usize = 10;

/// A position in the source database's change log.
///
/// The value is opaque to the pipeline: it is never interpreted, only
/// compared. `Ord` is lexicographic over the fixed-width byte array, which
/// matches the ordering of the source log. The external representation is
/// lower-case hex without prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lsn([u8; LSN_LEN]);

impl Lsn {
    /// The all-zero position used when no checkpoint exists yet. Every valid
    /// log position compares strictly greater than this.
    pub const ORIGIN: Lsn = Lsn([0; LSN_LEN]);

    pub fn as_bytes(&self) -> &[u8; LSN_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn from_hex(s: &str) -> Result<Self, InvalidLsn> {
        let bytes = <[u8; LSN_LEN]>::from_hex(s).map_err(|_| InvalidLsn::Hex(s.to_owned()))?;
        Ok(Lsn(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidLsn {
    #[error("expected {LSN_LEN} bytes, got {0}")]
    Length(usize),
    #[error("not a {LSN_LEN}-byte hex string: '{0}'")]
    Hex(String),
}

impl From<[u8; LSN_LEN]> for Lsn {
    fn from(bytes: [u8; LSN_LEN]) -> Self {
        Lsn(bytes)
    }
}

impl TryFrom<&[u8]> for Lsn {
    type Error = InvalidLsn;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; LSN_LEN] = bytes
            .try_into()
            .map_err(|_| InvalidLsn::Length(bytes.len()))?;
        Ok(Lsn(bytes))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", hex::encode(self.0))
    }
}

impl FromStr for Lsn {
    type Err = InvalidLsn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::from_hex(s)
    }
}

impl serde::Serialize for Lsn {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Lsn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

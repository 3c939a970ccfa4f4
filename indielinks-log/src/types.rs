// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of indielinks.
//
// indielinks is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// indielinks is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with indielinks.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Basic types used throughout [indielinks-log]
//!
//! I generally loathe these sorts of "types" or "entities" modules, but the request & response
//! types below are shared between the library, the reference node and the integration tests, so
//! it seemed best to collect them in one place.
//!
//! [indielinks-log]: crate

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Type for naming nodes in the cluster
pub type NodeId = u64;

/// Position of an entry within one key's log
///
/// Offsets are unique & strictly increasing within a key, but need not be contiguous on any given
/// replica (an entry may still be in flight from a peer).
pub type Offset = u64;

/// The opaque payload carried by each log entry
pub type Value = serde_json::Value;

/// A single log entry
///
/// On the wire, an [Entry] is a two-element array: `[offset, value]`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(from = "(Offset, Value)", into = "(Offset, Value)")]
pub struct Entry {
    pub offset: Offset,
    pub value: Value,
}

impl Entry {
    pub fn new(offset: Offset, value: impl Into<Value>) -> Entry {
        Entry {
            offset,
            value: value.into(),
        }
    }
}

impl From<(Offset, Value)> for Entry {
    fn from((offset, value): (Offset, Value)) -> Self {
        Entry { offset, value }
    }
}

impl From<Entry> for (Offset, Value) {
    fn from(entry: Entry) -> Self {
        (entry.offset, entry.value)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   requests & their responses                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Append `msg` to the log named by `key`; the node will allocate the offset
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SendRequest {
    pub key: String,
    pub msg: Value,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SendResponse {
    pub offset: Offset,
}

/// Peer-to-peer replication of an entry that has already been assigned an offset
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SyncRequest {
    pub key: String,
    pub msg: Value,
    pub offset: Offset,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SyncResponse {}

/// Read entries from one or more logs, beginning at the given offsets
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PollRequest {
    pub offsets: HashMap<String, Offset>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PollResponse {
    pub msgs: HashMap<String, Vec<Entry>>,
}

/// Record the highest offset consumed, per key
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CommitOffsetsRequest {
    pub offsets: HashMap<String, Offset>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CommitOffsetsResponse {}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ListCommittedOffsetsRequest {
    pub keys: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ListCommittedOffsetsResponse {
    pub offsets: HashMap<String, Offset>,
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    #[test]
    fn entries_are_pairs() {
        let rsp = PollResponse {
            msgs: HashMap::from([(
                "x".to_owned(),
                vec![Entry::new(0, 10), Entry::new(1, 20)],
            )]),
        };
        assert_eq!(
            serde_json::to_value(&rsp).unwrap(),
            json!({"msgs": {"x": [[0, 10], [1, 20]]}})
        );
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(serde_json::from_value::<Entry>(json!([-1, 10])).is_err());
        assert!(serde_json::from_value::<Entry>(json!({"offset": 1})).is_err());
        assert!(serde_json::from_value::<SendRequest>(json!({"msg": 1})).is_err());
    }
}

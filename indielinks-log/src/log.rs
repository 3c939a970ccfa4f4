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

//! # In-memory log storage
//!
//! Each node keeps, per key, a vector of [Entry]s sorted by offset. Entries can arrive out of
//! order (replication from different peers races), so every insertion is a binary-search insert;
//! readers may always assume the vector is sorted.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::types::{Entry, Offset, Value};

/// Default maximum number of entries returned per key by [LogStore::poll]
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Outcome of [LogStore::insert]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Insertion {
    /// The entry was new
    Inserted,
    /// We already had an entry at this offset; nothing changed
    Duplicate,
}

/// The per-node log contents
///
/// No synchronization here; callers are expected to serialize access (see [LogNode]).
///
/// [LogNode]: crate::node::LogNode
#[derive(Clone, Debug)]
pub struct LogStore {
    logs: BTreeMap<String, Vec<Entry>>,
    page_size: usize,
}

impl Default for LogStore {
    fn default() -> Self {
        LogStore::new(DEFAULT_PAGE_SIZE)
    }
}

impl LogStore {
    pub fn new(page_size: usize) -> LogStore {
        LogStore {
            logs: BTreeMap::new(),
            // A page size of zero would make `poll` useless
            page_size: page_size.max(1),
        }
    }
    pub fn page_size(&self) -> usize {
        self.page_size
    }
    /// Insert `value` at `offset` in the log for `key`, creating the log if need be
    ///
    /// Inserting an offset that's already present is a no-op, whatever the value: entries are
    /// never mutated once written, and the only way to see the same offset twice is a retried
    /// replication message.
    pub fn insert(&mut self, key: &str, offset: Offset, value: Value) -> Insertion {
        let log = self.logs.entry(key.to_owned()).or_default();
        match log.binary_search_by_key(&offset, |entry| entry.offset) {
            Ok(_) => {
                debug!("Offset {offset} already present in {key}; ignoring");
                Insertion::Duplicate
            }
            Err(idx) => {
                if idx < log.len() {
                    debug!("Out-of-order insert of {offset} into {key} at {idx}");
                }
                log.insert(idx, Entry { offset, value });
                Insertion::Inserted
            }
        }
    }
    /// Read at most one page of entries from each requested log
    ///
    /// For every key in `offsets` that names an existing log, return the entries with offsets
    /// greater than or equal to the given offset, in ascending order, up to the page size. Keys for
    /// which we have no log are omitted from the result altogether; a log with nothing at or past
    /// the requested offset yields an empty page.
    pub fn poll(&self, offsets: &HashMap<String, Offset>) -> HashMap<String, Vec<Entry>> {
        offsets
            .iter()
            .filter_map(|(key, start)| {
                self.logs
                    .get(key)
                    .map(|log| (key.clone(), self.page(log, *start)))
            })
            .collect()
    }
    fn page(&self, log: &[Entry], start: Offset) -> Vec<Entry> {
        let idx = log.partition_point(|entry| entry.offset < start);
        log[idx..]
            .iter()
            .take(self.page_size)
            .cloned()
            .collect()
    }
    /// Borrow the entire log for `key`, if we have one
    pub fn log(&self, key: &str) -> Option<&[Entry]> {
        self.logs.get(key).map(|log| log.as_slice())
    }
    /// The number of entries in the log for `key`; zero if we have no such log
    pub fn len(&self, key: &str) -> usize {
        self.logs.get(key).map_or(0, Vec::len)
    }
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.logs.keys().map(|key| key.as_str())
    }
    /// The number of logs on this node
    pub fn num_keys(&self) -> usize {
        self.logs.len()
    }
    /// The total number of entries, across all logs, on this node
    pub fn num_entries(&self) -> usize {
        self.logs.values().map(|log| log.len()).sum()
    }
}

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

//! # indielinks-log
//!
//! A replicated, append-only log, partitioned by key.
//!
//! Clients `send` values to any node; the node allocates the next offset for that key, appends the
//! value locally & pushes it to the rest of the cluster. Clients `poll` any node for entries at or
//! past a given offset, and record how far they've read via `commit_offsets`.
//!
//! Log *contents* are held in memory on every node & are only eventually consistent (replication
//! is a bounded, best-effort push). Offset allocation and commit marks, on the other hand, are
//! linearizable: both are kept in a [ConsistentStore] shared by the whole cluster.
//!
//! The crate knows nothing of how nodes talk to one another or to the store: the application
//! supplies a [ClientFactory] and a [ConsistentStore].
//!
//! [ConsistentStore]: store::ConsistentStore
//! [ClientFactory]: network::ClientFactory

pub mod log;
pub mod network;
pub mod node;
pub mod offsets;
pub mod replicate;
pub mod store;
pub mod types;

pub use node::{Configuration, LogNode, Metrics};
pub use types::{Entry, NodeId, Offset, Value};

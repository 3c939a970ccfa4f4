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

//! # Offset allocation & commit tracking
//!
//! Both of these are thin layers over [optimistic_update]: the allocator bumps a per-key counter
//! in the consistent store, and the commit tracker ratchets a per-key high-watermark. They share
//! one store, so each namespaces its keys.

use std::collections::HashMap;

use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    store::{self, ConsistentStore, RetryPolicy, Update, optimistic_update},
    types::Offset,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to allocate an offset for log {key}: {source}"))]
    Allocate { key: String, source: store::Error },
    #[snafu(display("Log {key} has exhausted its offsets"))]
    Exhausted { key: String },
    #[snafu(display("Failed to commit offset {offset} for log {key}: {source}"))]
    Commit {
        key: String,
        offset: Offset,
        source: store::Error,
    },
    #[snafu(display("Failed to read the committed offset for log {key}: {source}"))]
    ListCommits { key: String, source: store::Error },
}

impl Error {
    /// True if this error is down to losing too many compare-and-swap races, rather than a failure
    /// of the store itself
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Error::Allocate {
                source: store::Error::Contention { .. },
                ..
            } | Error::Commit {
                source: store::Error::Contention { .. },
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn offset_key(key: &str) -> String {
    format!("offset/{key}")
}

fn commit_key(key: &str) -> String {
    format!("commit/{key}")
}

/// Hands out strictly increasing offsets, per log key, agreed upon cluster-wide
///
/// The store holds the last offset allocated for each key; the first allocation for a key yields
/// zero.
#[derive(Clone, Debug, Default)]
pub struct OffsetAllocator {
    policy: RetryPolicy,
}

impl OffsetAllocator {
    pub fn new(policy: RetryPolicy) -> OffsetAllocator {
        OffsetAllocator { policy }
    }
    /// Claim the next offset for `key`
    ///
    /// The offset returned is ours alone: no other caller, on this node or any other, will ever be
    /// handed the same value for the same key.
    #[instrument(level = "debug", skip(self, store))]
    pub async fn allocate<S>(&self, store: &S, key: &str) -> Result<Offset>
    where
        S: ConsistentStore + Sync + ?Sized,
    {
        match optimistic_update(store, &offset_key(key), &self.policy, |last| {
            last.map_or(Some(0), |last| last.checked_add(1))
        })
        .await
        .context(AllocateSnafu { key })?
        {
            Update::Updated(offset) => Ok(offset),
            Update::Unchanged(_) => ExhaustedSnafu { key }.fail(),
        }
    }
}

/// Records, per key, the highest offset a consumer has acknowledged
///
/// Commits only ever move forward: committing an offset at or below the current mark is accepted
/// and ignored.
#[derive(Clone, Debug, Default)]
pub struct CommitTracker {
    policy: RetryPolicy,
}

impl CommitTracker {
    pub fn new(policy: RetryPolicy) -> CommitTracker {
        CommitTracker { policy }
    }
    /// Advance the commit mark for `key` to `offset`, if that's an advance; return the mark as it
    /// stands afterward
    #[instrument(level = "debug", skip(self, store))]
    pub async fn commit<S>(&self, store: &S, key: &str, offset: Offset) -> Result<Offset>
    where
        S: ConsistentStore + Sync + ?Sized,
    {
        match optimistic_update(store, &commit_key(key), &self.policy, |current| {
            match current {
                Some(current) if current >= offset => None,
                _ => Some(offset),
            }
        })
        .await
        .context(CommitSnafu { key, offset })?
        {
            Update::Updated(offset) => Ok(offset),
            Update::Unchanged(current) => {
                debug!("Commit of {offset} for {key} superseded by {current:?}");
                Ok(current.unwrap_or(offset))
            }
        }
    }
    /// Apply [commit](CommitTracker::commit) to every pair in `offsets`, stopping at the first
    /// failure
    pub async fn commit_all<S>(&self, store: &S, offsets: &HashMap<String, Offset>) -> Result<()>
    where
        S: ConsistentStore + Sync + ?Sized,
    {
        for (key, offset) in offsets {
            self.commit(store, key, *offset).await?;
        }
        Ok(())
    }
    /// Look-up the commit marks for `keys`; keys that have never been committed are omitted
    pub async fn list<S>(&self, store: &S, keys: &[String]) -> Result<HashMap<String, Offset>>
    where
        S: ConsistentStore + Sync + ?Sized,
    {
        let mut marks = HashMap::new();
        for key in keys {
            if let Some(offset) = store::read(store, &commit_key(key))
                .await
                .context(ListCommitsSnafu { key })?
            {
                marks.insert(key.clone(), offset);
            }
        }
        Ok(marks)
    }
}

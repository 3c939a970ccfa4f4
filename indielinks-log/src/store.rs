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

//! # The consistent store
//!
//! The log contents live only in memory on each node, but the cluster still needs to *agree* on
//! two things: which offset goes to which append, and how far each consumer has read. Both are
//! pushed down to a linearizable key-value store shared by the whole cluster. This module defines
//! the interface [indielinks-log] expects of that store ([ConsistentStore]), an in-process
//! implementation ([MemoryStore]), and the one retry loop everything else builds on
//! ([optimistic_update]).
//!
//! [indielinks-log]: crate

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, Snafu};
use tracing::{debug, error};

use std::error::Error as StdError;

pub type StdResult<T, E> = std::result::Result<T, E>;

/// Type-erased error from a [ConsistentStore] implementation
pub type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Gave up updating {key} after {attempts} compare-and-swap attempts"))]
    Contention {
        key: String,
        attempts: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("The consistent store failed while operating on {key}: {source}"))]
    Store {
        key: String,
        source: BoxedError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wrap an implementation's error so it can serve as the source of an [Error]
fn boxed<E: StdError + Send + Sync + 'static>(err: E) -> BoxedError {
    Box::new(err)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  the store abstraction itself                                  //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A linearizable key-value store mapping strings to integers
///
/// The application provides an implementation of this trait to [LogNode]. Whatever the
/// implementation, it *must* be linearizable across the whole cluster: [compare_and_swap] is the
/// single source of truth for offset allocation.
///
/// [LogNode]: crate::node::LogNode
/// [compare_and_swap]: ConsistentStore::compare_and_swap
#[async_trait]
pub trait ConsistentStore {
    type ErrorType: StdError + Send + Sync + 'static;
    /// Read the value stored under `key`; `None` means there is no such key
    async fn read(&self, key: &str) -> StdResult<Option<u64>, Self::ErrorType>;
    /// Unconditionally store `value` under `key`
    async fn write(&self, key: &str, value: u64) -> StdResult<(), Self::ErrorType>;
    /// Replace the value at `key` with `new`, but only if it is currently `expected`
    ///
    /// `expected` of `None` means "the key is absent"; that can only match when `create_if_absent`
    /// is set. Returns `Ok(false)` when the precondition didn't hold; `Err` is reserved for
    /// failures of the store itself.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        new: u64,
        create_if_absent: bool,
    ) -> StdResult<bool, Self::ErrorType>;
}

/// An in-process, linearizable [ConsistentStore]
///
/// Every operation takes a single (synchronous) lock, so operations are trivially linearizable
/// within the process. That makes this suitable for unit tests, and for the one node in a cluster
/// that serves as the store authority for its peers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, u64>>,
}

/// [MemoryStore] has no failure modes of its own, save a poisoned lock
#[derive(Debug, Snafu)]
#[snafu(display("The in-memory store's lock was poisoned"))]
pub struct PoisonedStore;

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
    fn map(&self) -> StdResult<std::sync::MutexGuard<'_, HashMap<String, u64>>, PoisonedStore> {
        self.map.lock().map_err(|_| PoisonedStore)
    }
}

#[async_trait]
impl ConsistentStore for MemoryStore {
    type ErrorType = PoisonedStore;
    async fn read(&self, key: &str) -> StdResult<Option<u64>, PoisonedStore> {
        Ok(self.map()?.get(key).copied())
    }
    async fn write(&self, key: &str, value: u64) -> StdResult<(), PoisonedStore> {
        self.map()?.insert(key.to_owned(), value);
        Ok(())
    }
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        new: u64,
        create_if_absent: bool,
    ) -> StdResult<bool, PoisonedStore> {
        let mut map = self.map()?;
        let current = map.get(key).copied();
        let swap = match (current, expected) {
            (None, _) => create_if_absent && expected.is_none(),
            (Some(current), Some(expected)) => current == expected,
            (Some(_), None) => false,
        };
        if swap {
            map.insert(key.to_owned(), new);
        }
        Ok(swap)
    }
}

/// Blanket implementation for [Arc](std::sync::Arc)s; if `T` is a [ConsistentStore], then so is
/// `Arc<T>`.
#[async_trait]
impl<T: ConsistentStore + Send + Sync> ConsistentStore for std::sync::Arc<T> {
    type ErrorType = T::ErrorType;
    async fn read(&self, key: &str) -> StdResult<Option<u64>, Self::ErrorType> {
        self.as_ref().read(key).await
    }
    async fn write(&self, key: &str, value: u64) -> StdResult<(), Self::ErrorType> {
        self.as_ref().write(key, value).await
    }
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        new: u64,
        create_if_absent: bool,
    ) -> StdResult<bool, Self::ErrorType> {
        self.as_ref()
            .compare_and_swap(key, expected, new, create_if_absent)
            .await
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      optimistic updates                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// How hard to try when a compare-and-swap loses a race
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RetryPolicy {
    #[serde(rename = "max-attempts")]
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay: Duration::from_millis(1),
        }
    }
}

/// Result of a successful [optimistic_update]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Update {
    /// The store now holds this value, and we're the ones who put it there
    Updated(u64),
    /// The transform declined to write; the store held this value at the time
    Unchanged(Option<u64>),
}

/// Read `key`, mapping any failure of the store into an [Error]
pub async fn read<S>(store: &S, key: &str) -> Result<Option<u64>>
where
    S: ConsistentStore + Sync + ?Sized,
{
    store
        .read(key)
        .await
        .map_err(|err| StoreSnafu { key }.into_error(boxed(err)))
}

/// Apply a pure transform to the value stored at `key`, retrying on lost races
///
/// Each attempt reads the current value, hands it to `transform`, and, if that yields a new value,
/// tries to compare-and-swap the observed value for it. Losing the race costs one attempt and a
/// pause of `policy.delay`. The store's own failures aren't retried.
pub async fn optimistic_update<S, F>(
    store: &S,
    key: &str,
    policy: &RetryPolicy,
    transform: F,
) -> Result<Update>
where
    S: ConsistentStore + Sync + ?Sized,
    F: Fn(Option<u64>) -> Option<u64>,
{
    for attempt in 1..=policy.max_attempts {
        let observed = read(store, key).await?;
        let Some(new) = transform(observed) else {
            return Ok(Update::Unchanged(observed));
        };
        if store
            .compare_and_swap(key, observed, new, observed.is_none())
            .await
            .map_err(|err| StoreSnafu { key }.into_error(boxed(err)))?
        {
            return Ok(Update::Updated(new));
        }
        debug!("Lost the race on {key} ({observed:?} -> {new}), attempt {attempt}");
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    error!(
        "Ran out of retries updating {key} after {} attempts",
        policy.max_attempts
    );
    ContentionSnafu {
        key,
        attempts: policy.max_attempts,
    }
    .fail()
}

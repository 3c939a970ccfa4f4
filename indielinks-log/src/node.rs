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

//! # A single [indielinks-log] cluster member
//!
//! [LogNode] ties the pieces together: it owns this node's [LogStore], allocates offsets & tracks
//! commits through the [ConsistentStore], and hands freshly-appended entries to the [Replicator].
//!
//! All mutation of, and reads from, the local logs happen under one per-node lock. In particular,
//! "allocate an offset, then append at that offset" is atomic with respect to every other local
//! operation, so a client that's been told its offset can immediately poll this node & see its
//! entry. The lock is released before replication begins.
//!
//! [indielinks-log]: crate

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu, ensure};
use tap::Pipe;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::{
    log::{DEFAULT_PAGE_SIZE, Insertion, LogStore},
    network::ClientFactory,
    offsets::{self, CommitTracker, OffsetAllocator},
    replicate::{self, Replication, Replicator},
    store::{ConsistentStore, RetryPolicy},
    types::{
        CommitOffsetsRequest, CommitOffsetsResponse, Entry, ListCommittedOffsetsRequest,
        ListCommittedOffsetsResponse, NodeId, Offset, PollRequest, PollResponse, SendRequest,
        SendResponse, SyncRequest, SyncResponse, Value,
    },
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Malformed request: {reason}"))]
    MalformedRequest {
        reason: String,
        backtrace: Backtrace,
    },
    #[snafu(display("{source}"))]
    Offsets { source: offsets::Error },
}

impl Error {
    /// True if the operation failed because it lost too many races for the consistent store; the
    /// caller may reasonably retry
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Offsets { source } if source.is_contention())
    }
    /// True if the request was rejected before anything was attempted
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::MalformedRequest { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn validate_key(key: &str) -> Result<()> {
    ensure!(
        !key.is_empty(),
        MalformedRequestSnafu {
            reason: "log keys may not be empty"
        }
    );
    Ok(())
}

fn validate_keys<'a>(mut keys: impl Iterator<Item = &'a String>) -> Result<()> {
    keys.try_for_each(|key| validate_key(key))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [indielinks-log] node configuration
///
/// Outside of the ID for this node, the configuration should be uniform across the cluster.
///
/// [indielinks-log]: crate
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Configuration {
    // The ID for *this* node
    #[serde(rename = "this-node")]
    pub this_node: NodeId,
    // Maximum number of entries returned per key per poll
    #[serde(rename = "page-size")]
    pub page_size: usize,
    // Governs both offset allocation & commits
    pub allocation: RetryPolicy,
    pub replication: replicate::Config,
}

/// Suitable for a single-node cluster only
impl Default for Configuration {
    fn default() -> Self {
        Self {
            this_node: 0,
            page_size: DEFAULT_PAGE_SIZE,
            allocation: RetryPolicy::default(),
            replication: replicate::Config::default(),
        }
    }
}

impl Configuration {
    pub fn builder(this_node: NodeId) -> ConfigurationBuilder {
        ConfigurationBuilder::new(this_node)
    }
}

pub struct ConfigurationBuilder {
    this_node: NodeId,
    page_size: usize,
    allocation: RetryPolicy,
    replication: replicate::Config,
}

impl ConfigurationBuilder {
    pub fn new(this_node: NodeId) -> ConfigurationBuilder {
        ConfigurationBuilder {
            this_node,
            page_size: DEFAULT_PAGE_SIZE,
            allocation: RetryPolicy::default(),
            replication: replicate::Config::default(),
        }
    }
    pub fn build(self) -> Configuration {
        Configuration {
            this_node: self.this_node,
            page_size: self.page_size,
            allocation: self.allocation,
            replication: self.replication,
        }
    }
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
    pub fn allocation(mut self, allocation: RetryPolicy) -> Self {
        self.allocation = allocation;
        self
    }
    pub fn replication(mut self, replication: replicate::Config) -> Self {
        self.replication = replication;
        self
    }
}

/// A point-in-time summary of a node's activity
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Metrics {
    pub id: NodeId,
    #[serde(rename = "num-keys")]
    pub num_keys: usize,
    #[serde(rename = "num-entries")]
    pub num_entries: usize,
    pub sends: u64,
    pub syncs: u64,
    #[serde(rename = "replications-delivered")]
    pub replications_delivered: u64,
    #[serde(rename = "replications-unavailable")]
    pub replications_unavailable: u64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            LogNode                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct LogNodeInner<S, F> {
    id: NodeId,
    store: S,
    factory: Mutex<F>,
    logs: Mutex<LogStore>,
    allocator: OffsetAllocator,
    tracker: CommitTracker,
    replicator: Replicator,
    sends: AtomicU64,
    syncs: AtomicU64,
}

/// The current process' membership in an [indielinks-log] cluster
///
/// [LogNode] is a cheaply clonable handle; clones all refer to the same node.
///
/// [indielinks-log]: crate
pub struct LogNode<S, F> {
    inner: Arc<LogNodeInner<S, F>>,
}

impl<S, F> Clone for LogNode<S, F> {
    fn clone(&self) -> Self {
        LogNode {
            inner: self.inner.clone(),
        }
    }
}

impl<S, F> LogNode<S, F>
where
    S: ConsistentStore + Send + Sync + 'static,
    F: ClientFactory + Send + 'static,
    F::LogClient: Send + 'static,
{
    /// Create a new node; `store` must be shared (logically, at least) by every member of the
    /// cluster, and `factory` must know about all of them
    pub fn new(config: Configuration, store: S, factory: F) -> LogNode<S, F> {
        info!(
            "Creating log node {} (page size {})",
            config.this_node, config.page_size
        );
        LogNode {
            inner: Arc::new(LogNodeInner {
                id: config.this_node,
                store,
                factory: Mutex::new(factory),
                logs: Mutex::new(LogStore::new(config.page_size)),
                allocator: OffsetAllocator::new(config.allocation.clone()),
                tracker: CommitTracker::new(config.allocation),
                replicator: Replicator::new(config.replication),
                sends: AtomicU64::new(0),
                syncs: AtomicU64::new(0),
            }),
        }
    }
    pub fn id(&self) -> NodeId {
        self.inner.id
    }
    /// Append `msg` to the log for `key` on behalf of a client
    ///
    /// On success, the entry is visible to polls on this node & its offset is returned along with
    /// a handle on its replication to the rest of the cluster. Replication failures never surface
    /// here.
    #[instrument(level = "debug", skip(self, msg))]
    pub async fn send(&self, key: &str, msg: Value) -> Result<(Offset, Replication)> {
        validate_key(key)?;
        let offset = {
            let mut logs = self.inner.logs.lock().await;
            let offset = self
                .inner
                .allocator
                .allocate(&self.inner.store, key)
                .await
                .context(OffsetsSnafu)?;
            logs.insert(key, offset, msg.clone());
            offset
        };
        self.inner.sends.fetch_add(1, Ordering::Relaxed);
        debug!("Appended {key}@{offset}");

        let replication = self
            .inner
            .replicator
            .replicate(
                &mut *self.inner.factory.lock().await,
                SyncRequest {
                    key: key.to_owned(),
                    msg,
                    offset,
                },
            )
            .await;
        Ok((offset, replication))
    }
    /// Append `msg` to the log for `key` at an offset already allocated elsewhere in the cluster
    ///
    /// Re-delivery of an entry we already hold is harmless. Entries accepted here are never
    /// passed on.
    #[instrument(level = "debug", skip(self, msg))]
    pub async fn sync(&self, key: &str, offset: Offset, msg: Value) -> Result<Insertion> {
        validate_key(key)?;
        let insertion = self.inner.logs.lock().await.insert(key, offset, msg);
        self.inner.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(insertion)
    }
    /// Read up to one page of entries from each of the requested logs
    pub async fn poll(
        &self,
        offsets: &HashMap<String, Offset>,
    ) -> Result<HashMap<String, Vec<Entry>>> {
        validate_keys(offsets.keys())?;
        Ok(self.inner.logs.lock().await.poll(offsets))
    }
    /// Advance the commit marks for each of the given keys
    #[instrument(level = "debug", skip(self))]
    pub async fn commit_offsets(&self, offsets: &HashMap<String, Offset>) -> Result<()> {
        validate_keys(offsets.keys())?;
        let _logs = self.inner.logs.lock().await;
        self.inner
            .tracker
            .commit_all(&self.inner.store, offsets)
            .await
            .context(OffsetsSnafu)
    }
    /// Look-up the commit marks for `keys`; keys never committed are omitted
    pub async fn list_committed_offsets(&self, keys: &[String]) -> Result<HashMap<String, Offset>> {
        validate_keys(keys.iter())?;
        let _logs = self.inner.logs.lock().await;
        self.inner
            .tracker
            .list(&self.inner.store, keys)
            .await
            .context(OffsetsSnafu)
    }
    pub async fn metrics(&self) -> Metrics {
        let (num_keys, num_entries) = self
            .inner
            .logs
            .lock()
            .await
            .pipe(|logs| (logs.num_keys(), logs.num_entries()));
        let stats = self.inner.replicator.stats();
        Metrics {
            id: self.inner.id,
            num_keys,
            num_entries,
            sends: self.inner.sends.load(Ordering::Relaxed),
            syncs: self.inner.syncs.load(Ordering::Relaxed),
            replications_delivered: stats.delivered(),
            replications_unavailable: stats.unavailable(),
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                   wire-level entry points                                  //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Serve a client's [SendRequest]; replication proceeds in the background
    pub async fn handle_send(&self, req: SendRequest) -> Result<SendResponse> {
        let (offset, replication) = self.send(&req.key, req.msg).await?;
        replication.detach();
        Ok(SendResponse { offset })
    }
    pub async fn handle_sync(&self, req: SyncRequest) -> Result<SyncResponse> {
        self.sync(&req.key, req.offset, req.msg).await?;
        Ok(SyncResponse {})
    }
    pub async fn handle_poll(&self, req: PollRequest) -> Result<PollResponse> {
        self.poll(&req.offsets)
            .await
            .map(|msgs| PollResponse { msgs })
    }
    pub async fn handle_commit_offsets(
        &self,
        req: CommitOffsetsRequest,
    ) -> Result<CommitOffsetsResponse> {
        self.commit_offsets(&req.offsets).await?;
        Ok(CommitOffsetsResponse {})
    }
    pub async fn handle_list_committed_offsets(
        &self,
        req: ListCommittedOffsetsRequest,
    ) -> Result<ListCommittedOffsetsResponse> {
        self.list_committed_offsets(&req.keys)
            .await
            .map(|offsets| ListCommittedOffsetsResponse { offsets })
    }
}

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

//! # Pushing new entries to peers
//!
//! Once a node has appended an entry on behalf of a client, it pushes that entry to every other
//! member of the cluster. Each peer gets its own task, which retries a bounded number of times and
//! gives up quietly (well, with a warning) if the peer stays unreachable. Nothing here can fail the
//! client's write, and nothing here ever retracts an entry.
//!
//! The tasks for one entry are gathered into a [JoinSet] & driven by a supervising task; the caller
//! gets a [Replication], a future resolving to a [ReplicationReport] once every peer has either
//! acknowledged the entry or been given up on. Callers that don't care can simply
//! [detach](Replication::detach) it.

use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::Poll,
    time::Duration,
};

use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    network::{Client, ClientFactory},
    types::{NodeId, Offset, SyncRequest},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The replication supervisor failed to complete: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Replication tuning parameters
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Maximum number of times we'll try any one peer
    #[serde(rename = "max-attempts")]
    pub max_attempts: usize,
    /// Time allowed for any single attempt
    #[serde(rename = "attempt-timeout")]
    pub attempt_timeout: Duration,
    /// Pause between attempts to the same peer
    pub pause: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_timeout: Duration::from_secs(1),
            pause: Duration::from_millis(50),
        }
    }
}

/// How replication of one entry to one peer turned out
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PeerOutcome {
    /// The peer acknowledged the entry on the `attempts`th try
    Delivered { attempts: usize },
    /// We gave up on this peer
    Unavailable { attempts: usize, last_error: String },
}

impl PeerOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PeerOutcome::Delivered { .. })
    }
}

/// The result of pushing one entry to all peers
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplicationReport {
    pub key: String,
    pub offset: Offset,
    pub outcomes: BTreeMap<NodeId, PeerOutcome>,
}

impl ReplicationReport {
    /// True if every peer acknowledged the entry (vacuously so for a single-node cluster)
    pub fn all_delivered(&self) -> bool {
        self.outcomes.values().all(PeerOutcome::is_delivered)
    }
    /// The peers we gave up on
    pub fn unavailable(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_delivered())
            .map(|(id, _)| *id)
    }
}

/// Running totals across all replications performed by a node
#[derive(Debug, Default)]
pub struct ReplicationStats {
    delivered: AtomicU64,
    unavailable: AtomicU64,
}

impl ReplicationStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
    pub fn unavailable(&self) -> u64 {
        self.unavailable.load(Ordering::Relaxed)
    }
    fn record(&self, outcome: &PeerOutcome) {
        match outcome {
            PeerOutcome::Delivered { .. } => self.delivered.fetch_add(1, Ordering::Relaxed),
            PeerOutcome::Unavailable { .. } => self.unavailable.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// An in-flight replication of a single entry
///
/// This is a [Future] resolving to the [ReplicationReport]; dropping it does *not* cancel the
/// replication (the work is owned by a spawned task).
#[pin_project]
#[derive(Debug)]
pub struct Replication {
    #[pin]
    supervisor: JoinHandle<ReplicationReport>,
}

impl Future for Replication {
    type Output = std::result::Result<ReplicationReport, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.supervisor.poll(cx)
    }
}

impl Replication {
    /// Wait for every peer to be either reached or given up on
    pub async fn wait(self) -> Result<ReplicationReport> {
        self.supervisor.await.context(JoinSnafu)
    }
    /// Let the replication run to completion unobserved; the supervisor will log the outcome
    pub fn detach(self) {
        // Dropping a `JoinHandle` detaches the task
    }
}

/// Pushes entries to the rest of the cluster
#[derive(Debug, Default)]
pub struct Replicator {
    config: Config,
    stats: Arc<ReplicationStats>,
}

impl Replicator {
    pub fn new(config: Config) -> Replicator {
        Replicator {
            config,
            stats: Arc::new(ReplicationStats::default()),
        }
    }
    pub fn stats(&self) -> &ReplicationStats {
        &self.stats
    }
    /// Begin pushing `req` to every node `factory` knows about, other than this one
    ///
    /// This returns as soon as the per-peer tasks have been spawned.
    pub async fn replicate<F>(&self, factory: &mut F, req: SyncRequest) -> Replication
    where
        F: ClientFactory,
        F::LogClient: Send + 'static,
    {
        let this_node = factory.this_node();
        let peers = factory
            .node_ids()
            .await
            .into_iter()
            .filter(|id| *id != this_node)
            .collect::<Vec<NodeId>>();
        debug!(
            "Replicating {}@{} from node {this_node} to {peers:?}",
            req.key, req.offset
        );

        let mut tasks = JoinSet::new();
        for peer in peers {
            let client = factory.new_client(peer).await;
            tasks.spawn(push(client, peer, req.clone(), self.config.clone()));
        }

        Replication {
            supervisor: tokio::spawn(supervise(
                tasks,
                req.key,
                req.offset,
                self.stats.clone(),
            )),
        }
    }
}

/// Drive replication of one entry to one peer
async fn push<C: Client>(
    mut client: C,
    peer: NodeId,
    req: SyncRequest,
    config: Config,
) -> (NodeId, PeerOutcome) {
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=max_attempts {
        match tokio::time::timeout(config.attempt_timeout, client.replicate(req.clone())).await {
            Ok(Ok(())) => {
                debug!(
                    "Node {peer} acknowledged {}@{} on attempt {attempt}",
                    req.key, req.offset
                );
                return (peer, PeerOutcome::Delivered { attempts: attempt });
            }
            Ok(Err(err)) => {
                debug!("Attempt {attempt} to replicate to node {peer} failed: {err}");
                last_error = err.to_string();
            }
            Err(_) => {
                debug!("Attempt {attempt} to replicate to node {peer} timed out");
                last_error = format!("timed out after {:?}", config.attempt_timeout);
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(config.pause).await;
        }
    }

    warn!(
        "Giving up replicating {}@{} to node {peer} after {max_attempts} attempts: {last_error}",
        req.key, req.offset
    );
    (
        peer,
        PeerOutcome::Unavailable {
            attempts: max_attempts,
            last_error,
        },
    )
}

async fn supervise(
    mut tasks: JoinSet<(NodeId, PeerOutcome)>,
    key: String,
    offset: Offset,
    stats: Arc<ReplicationStats>,
) -> ReplicationReport {
    let mut outcomes = BTreeMap::new();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((peer, outcome)) => {
                stats.record(&outcome);
                outcomes.insert(peer, outcome);
            }
            Err(err) => error!("A replication task for {key}@{offset} failed to complete: {err}"),
        }
    }

    let report = ReplicationReport {
        key,
        offset,
        outcomes,
    };
    if report.all_delivered() {
        debug!(
            "{}@{} replicated to {} peer(s)",
            report.key,
            report.offset,
            report.outcomes.len()
        );
    } else {
        info!(
            "{}@{} could not be replicated to {:?}",
            report.key,
            report.offset,
            report.unavailable().collect::<Vec<_>>()
        );
    }
    report
}

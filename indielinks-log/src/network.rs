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

//! # [indielinks-log] client-side networking
//!
//! [indielinks-log] nodes push newly appended entries to one another. This module defines the
//! *messages* cluster nodes need to exchange, but the *application* will need to provide an
//! implementation of the network transport (and of cluster membership).
//!
//! [indielinks-log]: crate

use async_trait::async_trait;

use crate::types::{NodeId, SyncRequest};

use std::error::Error as StdError;

pub type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                indielinks-log client abstraction                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A trait defining the client-side behavior for [indielinks-log](crate) cluster members
///
/// The application is expected to provide an implementation for this trait, along with
/// [ClientFactory], and to provide the latter implementation to [indielinks-log] through the
/// [LogNode] constructor.
///
/// [indielinks-log]: crate
/// [LogNode]: crate::node::LogNode
///
/// Nb that the target of these requests is assumed to be encoded into the implementor.
#[async_trait]
pub trait Client {
    type ErrorType: StdError + Send + Sync + 'static;
    /// Ask the target node to add an entry, at an offset that's already been allocated, to its log
    ///
    /// Implementations needn't worry about timeouts; the caller imposes its own.
    async fn replicate(&mut self, req: SyncRequest) -> StdResult<(), Self::ErrorType>;
}

/// A trait defining the interface for a factory creating connections between [indielinks-log]
/// cluster members
///
/// The implementor is responsible both for knowing who's in the cluster & for producing [Client]
/// implementations connected to those members on demand.
///
/// [indielinks-log]: crate
#[async_trait]
pub trait ClientFactory {
    type LogClient: Client;
    /// The ID of the node on which we're running
    fn this_node(&self) -> NodeId;
    /// All members of the cluster, *including* this node
    async fn node_ids(&self) -> Vec<NodeId>;
    async fn new_client(&mut self, target: NodeId) -> Self::LogClient;
}

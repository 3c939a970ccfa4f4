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

//! # indielinks-log-test
//!
//! Wire types shared between the reference node & the integration tests. The log's own requests &
//! responses live in [indielinks_log::types]; what's here is the key-value API the store authority
//! serves to its peers.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct KvReadRequest {
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct KvReadResponse {
    pub value: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct KvWriteRequest {
    pub key: String,
    pub value: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct KvWriteResponse {}

/// Compare-and-swap; `from` of `None` means "the key must be absent"
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct KvCasRequest {
    pub key: String,
    pub from: Option<u64>,
    pub to: u64,
    #[serde(rename = "create-if-absent", default)]
    pub create_if_absent: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct KvCasResponse {
    pub swapped: bool,
}

/// The body of any non-2xx response from the reference node
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

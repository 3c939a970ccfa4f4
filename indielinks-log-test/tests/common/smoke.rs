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

//! Smoke tests run against a live cluster
//!
//! Each test uses its own log keys, since they all share one cluster.

use std::{
    collections::HashMap,
    thread,
    time::{Duration, Instant},
};

use http::{StatusCode, header::CONTENT_TYPE};
use itertools::Itertools;
use libtest_mimic::Failed;
use reqwest::blocking::{Client, ClientBuilder};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::debug;

use indielinks_log::{
    Metrics, Offset,
    types::{
        CommitOffsetsRequest, CommitOffsetsResponse, ListCommittedOffsetsRequest,
        ListCommittedOffsetsResponse, PollRequest, PollResponse, SendRequest, SendResponse,
    },
};
use indielinks_log_test::ErrorResponse;

use super::Configuration;

fn client() -> Result<Client, Failed> {
    Ok(ClientBuilder::new()
        .user_agent("indielinks-log-test/0.0.1")
        .timeout(Duration::from_secs(5))
        .build()?)
}

fn post<Req: Serialize, Rsp: DeserializeOwned>(
    client: &Client,
    port: u16,
    path: &str,
    req: &Req,
) -> Result<Rsp, Failed> {
    Ok(client
        .post(format!("http://127.0.0.1:{port}{path}"))
        .header(CONTENT_TYPE, "application/json")
        .json(req)
        .send()?
        .error_for_status()?
        .json::<Rsp>()?)
}

fn send(client: &Client, port: u16, key: &str, msg: serde_json::Value) -> Result<Offset, Failed> {
    post::<_, SendResponse>(
        client,
        port,
        "/log/send",
        &SendRequest {
            key: key.to_owned(),
            msg,
        },
    )
    .map(|rsp| rsp.offset)
}

fn poll(client: &Client, port: u16, key: &str, from: Offset) -> Result<PollResponse, Failed> {
    post(
        client,
        port,
        "/log/poll",
        &PollRequest {
            offsets: HashMap::from([(key.to_owned(), from)]),
        },
    )
}

/// Poll `key` on the node at `port` until it holds `count` entries; replication is asynchronous
fn poll_until(
    client: &Client,
    port: u16,
    key: &str,
    count: usize,
) -> Result<PollResponse, Failed> {
    let start = Instant::now();
    loop {
        let rsp = poll(client, port, key, 0)?;
        if rsp.msgs.get(key).map_or(0, Vec::len) >= count {
            return Ok(rsp);
        }
        if start.elapsed() > Duration::from_secs(10) {
            return Err(format!("{port} never saw {count} entries for {key}; last saw {rsp:?}").into());
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn get_metrics(client: &Client, port: u16) -> Result<Metrics, Failed> {
    Ok(client
        .get(format!("http://127.0.0.1:{port}/admin/metrics"))
        .send()?
        .error_for_status()?
        .json::<Metrics>()?)
}

pub fn end_to_end(config: Configuration) -> Result<(), Failed> {
    let client = client()?;
    let first = config.port(0);
    let last = config.port(config.cluster_size - 1);

    debug!("Sending two messages to \"x\", via different nodes");
    assert_eq!(send(&client, first, "x", json!(10))?, 0);
    assert_eq!(send(&client, last, "x", json!(20))?, 1);

    let rsp = poll_until(&client, first, "x", 2)?;
    assert_eq!(
        serde_json::to_value(&rsp)?,
        json!({"msgs": {"x": [[0, 10], [1, 20]]}})
    );

    debug!("Committing through one node & reading back through another");
    post::<_, CommitOffsetsResponse>(
        &client,
        last,
        "/log/commit_offsets",
        &CommitOffsetsRequest {
            offsets: HashMap::from([("x".to_owned(), 1)]),
        },
    )?;
    let rsp = post::<_, ListCommittedOffsetsResponse>(
        &client,
        first,
        "/log/list_committed_offsets",
        &ListCommittedOffsetsRequest {
            keys: vec!["x".to_owned(), "never-committed".to_owned()],
        },
    )?;
    assert_eq!(rsp.offsets, HashMap::from([("x".to_owned(), 1)]));

    Ok(())
}

pub fn concurrent_sends(config: Configuration) -> Result<(), Failed> {
    const KEY: &str = "concurrent";
    const THREADS: u16 = 8;
    const PER_THREAD: u64 = 5;

    let handles = (0..THREADS)
        .map(|i| {
            let port = config.port(i % config.cluster_size);
            thread::spawn(move || -> Result<Vec<Offset>, Failed> {
                let client = client()?;
                (0..PER_THREAD)
                    .map(|j| send(&client, port, KEY, json!([i, j])))
                    .collect()
            })
        })
        .collect::<Vec<_>>();
    let mut offsets = Vec::new();
    for handle in handles {
        offsets.extend(handle.join().map_err(|_| "sender thread panicked")??);
    }

    let total = THREADS as u64 * PER_THREAD;
    assert!(offsets.iter().all_unique());
    assert_eq!(
        offsets.into_iter().sorted().collect::<Vec<_>>(),
        (0..total).collect::<Vec<_>>()
    );

    // Every node eventually holds every entry, in order
    let client = client()?;
    for id in 0..config.cluster_size {
        let rsp = poll_until(&client, config.port(id), KEY, total as usize)?;
        assert!(
            rsp.msgs[KEY]
                .iter()
                .map(|entry| entry.offset)
                .eq(0..total)
        );
    }

    Ok(())
}

pub fn malformed_requests(config: Configuration) -> Result<(), Failed> {
    let client = client()?;
    let port = config.port(0);

    let check = |path: &str, body: serde_json::Value| -> Result<(), Failed> {
        let rsp = client
            .post(format!("http://127.0.0.1:{port}{path}"))
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()?;
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST, "{path} {body}");
        let err = rsp.json::<ErrorResponse>()?;
        debug!("{path} {body} => {}", err.error);
        Ok(())
    };

    check("/log/send", json!({"key": "", "msg": 1}))?;
    check("/log/send", json!({"msg": 1}))?;
    check("/log/sync", json!({"key": "k", "msg": 1, "offset": -1}))?;
    check("/log/poll", json!({"offsets": {"": 0}}))?;
    check("/log/commit_offsets", json!({"offsets": {"k": "one"}}))?;
    check("/log/list_committed_offsets", json!({"keys": [""]}))?;

    // None of that should have created a log
    assert!(poll(&client, port, "", 0).is_err());
    assert!(poll(&client, port, "k", 0)?.msgs.is_empty());

    Ok(())
}

pub fn metrics(config: Configuration) -> Result<(), Failed> {
    let client = client()?;
    let metrics = (0..config.cluster_size)
        .map(|id| get_metrics(&client, config.port(id)))
        .collect::<Result<Vec<_>, Failed>>()?;
    for (id, metrics) in metrics.iter().enumerate() {
        assert_eq!(metrics.id, id as u64);
    }
    // With every node up, nothing should have been given up on
    assert!(metrics.iter().all(|m| m.replications_unavailable == 0));
    assert!(metrics.iter().map(|m| m.sends).sum::<u64>() > 0);
    Ok(())
}

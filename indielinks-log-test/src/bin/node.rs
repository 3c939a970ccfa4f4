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

//! # indielinks-log-node
//!
//! Reference [indielinks-log](indielinks_log) cluster member, serving the log API over HTTP.
//!
//! Peers are named on the command line (`--peer ID=ADDR`, repeated). One node in the cluster acts
//! as the store authority, serving its in-memory key-value store under `/kv`; every node (the
//! authority included) reaches that store over HTTP at `--store`, which defaults to the node's own
//! address.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    response::IntoResponse,
    routing::{get, post},
};
use bpaf::{Parser, construct};
use http::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tap::{Pipe, Tap};
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::Notify,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, error, info, subscriber::set_global_default, warn};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use indielinks_log::{
    Configuration, LogNode, NodeId,
    log::DEFAULT_PAGE_SIZE,
    network::{Client, ClientFactory},
    node,
    store::{ConsistentStore, MemoryStore},
    types::{
        CommitOffsetsRequest, ListCommittedOffsetsRequest, PollRequest, SendRequest, SyncRequest,
    },
};
use indielinks_log_test::{
    ErrorResponse, KvCasRequest, KvCasResponse, KvReadRequest, KvReadResponse, KvWriteRequest,
    KvWriteResponse,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("RPC to {url} failed: {source}"))]
    Rpc {
        url: String,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("When deserializing the response from {url}: {source}"))]
    RpcDe {
        url: String,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("RPC to {url} returned an error status: {source}"))]
    RpcStatus {
        url: String,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown node ID {id}"))]
    UnknownNode { id: NodeId, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

/// POST `body` to `path` on `addr` & deserialize the response
async fn post_json<Req, Rsp>(
    client: &reqwest::Client,
    addr: SocketAddr,
    path: &str,
    body: &Req,
) -> Result<Rsp>
where
    Req: Serialize + Sync,
    Rsp: DeserializeOwned,
{
    let url = format!("http://{addr}{path}");
    client
        .post(&url)
        .json(body)
        .send()
        .await
        .context(RpcSnafu { url: &url })?
        .tap(|rsp| debug!("POST {url}: {}", rsp.status()))
        .error_for_status()
        .context(RpcStatusSnafu { url: &url })?
        .json::<Rsp>()
        .await
        .context(RpcDeSnafu { url })
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                              talking to peers & the store authority                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
struct HttpClientFactory {
    this_node: NodeId,
    peers: BTreeMap<NodeId, SocketAddr>,
    client: reqwest::Client,
}

#[async_trait]
impl ClientFactory for HttpClientFactory {
    type LogClient = HttpClient;
    fn this_node(&self) -> NodeId {
        self.this_node
    }
    async fn node_ids(&self) -> Vec<NodeId> {
        self.peers
            .keys()
            .copied()
            .chain(std::iter::once(self.this_node))
            .collect::<BTreeSet<NodeId>>()
            .into_iter()
            .collect()
    }
    async fn new_client(&mut self, target: NodeId) -> HttpClient {
        HttpClient {
            id: target,
            addr: self.peers.get(&target).copied(),
            client: self.client.clone(),
        }
    }
}

struct HttpClient {
    id: NodeId,
    addr: Option<SocketAddr>,
    client: reqwest::Client,
}

#[async_trait]
impl Client for HttpClient {
    type ErrorType = Error;
    async fn replicate(&mut self, req: SyncRequest) -> Result<()> {
        let addr = self.addr.context(UnknownNodeSnafu { id: self.id })?;
        post_json::<_, serde_json::Value>(&self.client, addr, "/log/sync", &req)
            .await
            .map(|_| ())
    }
}

/// The cluster's consistent store, as served by the store authority
struct HttpStore {
    addr: SocketAddr,
    client: reqwest::Client,
}

#[async_trait]
impl ConsistentStore for HttpStore {
    type ErrorType = Error;
    async fn read(&self, key: &str) -> Result<Option<u64>> {
        post_json::<_, KvReadResponse>(
            &self.client,
            self.addr,
            "/kv/read",
            &KvReadRequest {
                key: key.to_owned(),
            },
        )
        .await
        .map(|rsp| rsp.value)
    }
    async fn write(&self, key: &str, value: u64) -> Result<()> {
        post_json::<_, KvWriteResponse>(
            &self.client,
            self.addr,
            "/kv/write",
            &KvWriteRequest {
                key: key.to_owned(),
                value,
            },
        )
        .await
        .map(|_| ())
    }
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        new: u64,
        create_if_absent: bool,
    ) -> Result<bool> {
        post_json::<_, KvCasResponse>(
            &self.client,
            self.addr,
            "/kv/cas",
            &KvCasRequest {
                key: key.to_owned(),
                from: expected,
                to: new,
                create_if_absent,
            },
        )
        .await
        .map(|rsp| rsp.swapped)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          HTTP plumbing                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone)]
struct AppState {
    node: LogNode<HttpStore, HttpClientFactory>,
    kv: Arc<MemoryStore>,
}

fn log_status(err: &node::Error) -> StatusCode {
    if err.is_malformed() {
        StatusCode::BAD_REQUEST
    } else if err.is_contention() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn respond<T, E>(
    result: StdResult<T, E>,
    status: impl FnOnce(&E) -> StatusCode,
) -> axum::response::Response
where
    T: Serialize,
    E: std::error::Error,
{
    match result {
        Ok(rsp) => (StatusCode::OK, Json(rsp)).into_response(),
        Err(err) => {
            let status = status(&err);
            if status.is_server_error() {
                error!("{err:?}");
            } else {
                warn!("{err}");
            }
            (
                status,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Bodies that don't even deserialize never reach the node
fn reject(rejection: JsonRejection) -> axum::response::Response {
    warn!("Rejecting a malformed request: {rejection}");
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: rejection.body_text(),
        }),
    )
        .into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            log API                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn log_send(
    State(state): State<AppState>,
    req: StdResult<Json<SendRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => respond(state.node.handle_send(req).await, log_status),
        Err(rejection) => reject(rejection),
    }
}

async fn log_sync(
    State(state): State<AppState>,
    req: StdResult<Json<SyncRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => respond(state.node.handle_sync(req).await, log_status),
        Err(rejection) => reject(rejection),
    }
}

async fn log_poll(
    State(state): State<AppState>,
    req: StdResult<Json<PollRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => respond(state.node.handle_poll(req).await, log_status),
        Err(rejection) => reject(rejection),
    }
}

async fn log_commit_offsets(
    State(state): State<AppState>,
    req: StdResult<Json<CommitOffsetsRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => respond(state.node.handle_commit_offsets(req).await, log_status),
        Err(rejection) => reject(rejection),
    }
}

async fn log_list_committed_offsets(
    State(state): State<AppState>,
    req: StdResult<Json<ListCommittedOffsetsRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => respond(
            state.node.handle_list_committed_offsets(req).await,
            log_status,
        ),
        Err(rejection) => reject(rejection),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                         KV API -- only meaningful on the store authority                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

async fn kv_read(
    State(state): State<AppState>,
    req: StdResult<Json<KvReadRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => state
            .kv
            .read(&req.key)
            .await
            .map(|value| KvReadResponse { value })
            .pipe(|result| respond(result, |_| StatusCode::INTERNAL_SERVER_ERROR)),
        Err(rejection) => reject(rejection),
    }
}

async fn kv_write(
    State(state): State<AppState>,
    req: StdResult<Json<KvWriteRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => state
            .kv
            .write(&req.key, req.value)
            .await
            .map(|_| KvWriteResponse {})
            .pipe(|result| respond(result, |_| StatusCode::INTERNAL_SERVER_ERROR)),
        Err(rejection) => reject(rejection),
    }
}

async fn kv_cas(
    State(state): State<AppState>,
    req: StdResult<Json<KvCasRequest>, JsonRejection>,
) -> axum::response::Response {
    match req {
        Ok(Json(req)) => state
            .kv
            .compare_and_swap(&req.key, req.from, req.to, req.create_if_absent)
            .await
            .map(|swapped| KvCasResponse { swapped })
            .pipe(|result| respond(result, |_| StatusCode::INTERNAL_SERVER_ERROR)),
        Err(rejection) => reject(rejection),
    }
}

async fn admin_metrics(State(state): State<AppState>) -> axum::response::Response {
    Json(state.node.metrics().await).into_response()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             main()                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug)]
struct Options {
    no_color: bool,
    verbose: bool,
    page_size: usize,
    store: Option<SocketAddr>,
    peers: Vec<(NodeId, SocketAddr)>,
    id: NodeId,
    addr: SocketAddr,
}

fn parse_peer(s: String) -> StdResult<(NodeId, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=ADDR, got '{s}'"))?;
    Ok((
        id.parse::<NodeId>()
            .map_err(|err| format!("bad node ID '{id}': {err}"))?,
        addr.parse::<SocketAddr>()
            .map_err(|err| format!("bad socket address '{addr}': {err}"))?,
    ))
}

fn options() -> impl Parser<Options> {
    construct!(Options {
        no_color(bpaf::short('c').long("no-color").help("Disable logging in color").switch()),
        verbose(bpaf::short('v').long("verbose").help("Increase the verbosity").switch()),
        page_size(bpaf::long("page-size")
            .help("Maximum number of entries returned per key per poll")
            .argument::<usize>("N")
            .fallback(DEFAULT_PAGE_SIZE)),
        store(bpaf::long("store")
            .help("Address of the store authority; defaults to this node")
            .argument::<SocketAddr>("ADDR")
            .optional()),
        peers(bpaf::long("peer")
            .help("Another cluster member, as ID=ADDR; may be given more than once")
            .argument::<String>("ID=ADDR")
            .parse(parse_peer)
            .many()),
        id(bpaf::positional::<NodeId>("ID").help("Node ID, expressed as an unsigned integer")),
        addr(bpaf::positional::<SocketAddr>("SOCKADDR").help("Address on which to listen")),
    })
}

#[tokio::main]
async fn main() {
    let opts = options().to_options().run();
    set_global_default(
        Registry::default()
            .with(
                fmt::Layer::default()
                    .compact()
                    .with_ansi(!opts.no_color)
                    .with_writer(io::stdout),
            )
            .with(
                EnvFilter::builder()
                    .with_default_directive(if opts.verbose {
                        Level::DEBUG.into()
                    } else {
                        Level::INFO.into()
                    })
                    .from_env()
                    .expect("Failed to retrieve RUST_LOG"),
            ),
    )
    .expect("Failed to set the global default tracing subscriber");

    info!("Logging initialized");

    let client = reqwest::Client::builder()
        .user_agent("indielinks-log-node/0.0.1")
        .timeout(Duration::from_secs(5))
        .build()
        .expect("Failed to build an HTTP client");

    let store = opts.store.unwrap_or(opts.addr);
    info!(
        "Node {} at {} with peers {:?}; store authority at {store}",
        opts.id, opts.addr, opts.peers
    );

    let state = AppState {
        node: LogNode::new(
            Configuration::builder(opts.id)
                .page_size(opts.page_size)
                .build(),
            HttpStore {
                addr: store,
                client: client.clone(),
            },
            HttpClientFactory {
                this_node: opts.id,
                peers: opts.peers.iter().copied().collect(),
                client,
            },
        ),
        kv: Arc::new(MemoryStore::new()),
    };

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to subscribe to SIGTERMs");
    let nfy = Arc::new(Notify::new());

    let mut server = axum::serve(
        TcpListener::bind(opts.addr)
            .await
            .expect("Failed to bind the given address-- is someone already listening?"),
        Router::new()
            .route("/healthcheck", get(|| async move { "GOOD" }))
            .route("/log/send", post(log_send))
            .route("/log/sync", post(log_sync))
            .route("/log/poll", post(log_poll))
            .route("/log/commit_offsets", post(log_commit_offsets))
            .route(
                "/log/list_committed_offsets",
                post(log_list_committed_offsets),
            )
            .route("/kv/read", post(kv_read))
            .route("/kv/write", post(kv_write))
            .route("/kv/cas", post(kv_cas))
            .route("/admin/metrics", get(admin_metrics))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(
                        DefaultMakeSpan::new()
                            .include_headers(true)
                            .level(Level::INFO),
                    )
                    .on_response(
                        DefaultOnResponse::new()
                            .include_headers(true)
                            .level(Level::INFO),
                    ),
            )
            .with_state(state),
    )
    .with_graceful_shutdown({
        let nfy = nfy.clone();
        || async move { nfy.notified().await }
    }())
    .into_future();

    info!(
        "Serving requests at http://{}; healthcheck endpoint at http://{}/healthcheck",
        opts.addr, opts.addr
    );

    tokio::select! {
        result = &mut server => {
            if let Err(err) = result {
                error!("Server exited unexpectedly: {err:#?}");
            }
        },
        _ = sigterm.recv() => {
            info!("Received SIGTERM; shutting down...");
            nfy.notify_one();
            if let Err(err) = server.await {
                error!("On server shutdown: {err:#?}");
            } else {
                info!("Received SIGTERM; shutting down...done.");
            }
        }
    }

    info!("Good-bye.");
}

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

//! # The [indielinks-log] Integration Test Framework
//!
//! [indielinks-log]: indielinks_log

use std::{
    env, fs,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use libtest_mimic::Failed;
use serde::Deserialize;
use snafu::{IntoError, ResultExt, Snafu};
use tap::Pipe;
use tracing::{Level, debug, info};

pub mod smoke;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to run {command}; stdout was '{stdout}' & stderr was '{stderr}'."))]
    Command {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[snafu(display("Failed to parse {pth}: {source}"))]
    De {
        pth: String,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to read INDIELINKS_LOG_TEST_CONFIG: {source}"))]
    Env { source: std::env::VarError },
    #[snafu(display("Failed to build an HTTP client: {source}"))]
    HttpClient { source: reqwest::Error },
    #[snafu(display("Node {id} didn't become healthy within {timeout:?}"))]
    Unhealthy { id: u64, timeout: Duration },
    #[snafu(display("Failed to execute {command}: {source}"))]
    Process {
        command: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to read {pth}: {source}"))]
    Read { pth: String, source: std::io::Error },
}

type Result<T> = std::result::Result<T, Error>;

pub fn run(cmd: &str, args: &[&str], rust_log: Option<&str>) -> Result<()> {
    let mut command = Command::new(cmd);
    command.args(args);
    if let Some(rust_log) = rust_log {
        command.env("RUST_LOG", rust_log);
    }

    let output = command.output().context(ProcessSnafu {
        command: cmd.to_string(),
    })?;
    if output.status.success() {
        Ok(())
    } else {
        CommandSnafu {
            command: cmd.to_string(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout),
            stderr: String::from_utf8_lossy(&output.stderr),
        }
        .fail()
    }
}

/// Common [indielinks-log] test configuration
///
/// [indielinks-log]: indielinks_log
#[derive(Clone, Debug, Deserialize)]
pub struct Configuration {
    #[serde(rename = "no-setup")]
    pub no_setup: bool,
    #[serde(rename = "no-teardown")]
    pub no_teardown: bool,
    pub logging: bool,
    #[serde(deserialize_with = "de_level::deserialize")]
    pub log_level: Level,
    /// Node `i` listens on `base_port + i`; node 0 is the store authority
    pub base_port: u16,
    #[serde(rename = "cluster-size")]
    pub cluster_size: u16,
}

mod de_level {
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer};
    use tracing::Level;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Level::from_str(&s).map_err(|_| {
            serde::de::Error::custom(format!("{} cannot be interepreted as a log level", s))
        })
    }
}

impl Configuration {
    /// Obtain a [Configuration]
    ///
    /// Check the `INDIELINKS_LOG_TEST_CONFIG` environment variable; if defined, attempt to parse a
    /// [Configuration] from the file named therein; else return a default instance.
    pub fn new() -> Result<Configuration> {
        match env::var("INDIELINKS_LOG_TEST_CONFIG") {
            Ok(f) => fs::read_to_string(&f)
                .context(ReadSnafu { pth: f.clone() })?
                .pipe(|s| toml::from_str::<Configuration>(&s))
                .context(DeSnafu { pth: f.clone() }),
            Err(env::VarError::NotPresent) => Ok(Configuration::default()),
            Err(err) => Err(EnvSnafu.into_error(err)),
        }
    }
    pub fn port(&self, id: u16) -> u16 {
        self.base_port + id
    }
}

impl Default for Configuration {
    /// Default configuration
    ///
    /// When invoked with a bare `cargo test` (i.e. without `INDIELINKS_LOG_TEST_CONFIG` set), this
    /// is the configuration that will be used, so be sure the tests will pass with it.
    fn default() -> Self {
        Configuration {
            no_setup: false,
            no_teardown: false,
            logging: false,
            log_level: Level::INFO,
            base_port: 20900,
            cluster_size: 3,
        }
    }
}

pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(Configuration) -> std::result::Result<(), Failed>,
}

inventory::collect!(Test);

/// A cluster of `indielinks-log-node` processes running on localhost
pub struct Cluster {
    nodes: Vec<Child>,
}

impl Cluster {
    /// Launch `config.cluster_size` nodes & wait for all of them to answer their healthchecks
    pub fn start(config: &Configuration) -> Result<Cluster> {
        let addr = |id: u16| format!("127.0.0.1:{}", config.port(id));
        let mut cluster = Cluster { nodes: Vec::new() };
        for id in 0..config.cluster_size {
            let mut command = Command::new(env!("CARGO_BIN_EXE_indielinks-log-node"));
            command.args(["-c", "--store", addr(0).as_str()]);
            for peer in (0..config.cluster_size).filter(|peer| *peer != id) {
                command.args(["--peer", format!("{peer}={}", addr(peer)).as_str()]);
            }
            command.args([id.to_string(), addr(id)]);
            if config.logging {
                command.env("RUST_LOG", config.log_level.as_str());
            } else {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
            debug!("Launching node {id}: {command:?}");
            cluster.nodes.push(command.spawn().context(ProcessSnafu {
                command: "indielinks-log-node".to_owned(),
            })?);
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(500))
            .build()
            .context(HttpClientSnafu)?;
        for id in 0..config.cluster_size {
            wait_for_health(&client, id, config.port(id), Duration::from_secs(10))?;
        }
        info!("{} node cluster is up", config.cluster_size);
        Ok(cluster)
    }
    /// Ask each node to shut down gracefully, then reap it
    pub fn stop(mut self) {
        for node in self.nodes.iter_mut() {
            let pid = node.id().to_string();
            if run("kill", &["-TERM", pid.as_str()], None).is_err() {
                let _ = node.kill();
            }
            let _ = node.wait();
        }
        self.nodes.clear();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // Don't leave orphans behind if we bail out of setup part-way
        for node in self.nodes.iter_mut() {
            let _ = node.kill();
            let _ = node.wait();
        }
    }
}

fn wait_for_health(
    client: &reqwest::blocking::Client,
    id: u16,
    port: u16,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if client
            .get(format!("http://127.0.0.1:{port}/healthcheck"))
            .send()
            .is_ok_and(|rsp| rsp.status().is_success())
        {
            debug!("Node {id} is healthy");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
    UnhealthySnafu {
        id: id as u64,
        timeout,
    }
    .fail()
}

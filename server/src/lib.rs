// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mix network directory authority.
//!
//! One authority process runs three cooperating pieces: dropshot HTTP
//! servers for descriptor uploads and document fetches, an epoch
//! scheduler that turns wall-clock time into phase transitions, and a
//! consensus worker that drafts, exchanges, and publishes directory
//! documents.

mod config;
mod context;
mod http_entrypoints;
mod scheduler;
mod state;
mod state_machine;
mod storage;
#[cfg(test)]
mod test_helpers;
mod worker;

pub use config::Config;
pub use context::ServerContext;

use anyhow::{anyhow, bail, Context};
use camino::Utf8Path;
use dirauth_common::epochtime::{EpochClock, SystemClock};
use dirauth_common::pki::IdentityKeypair;
use dropshot::{ConfigDropshot, HandlerTaskMode};
use futures::stream::FuturesUnordered;
use futures::{Future, FutureExt, StreamExt};
use slog::{info, o, Logger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::fs::DirBuilderExt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::scheduler::EpochScheduler;
use crate::state::State;
use crate::state_machine::PhaseStateMachine;
use crate::storage::FsStore;
use crate::worker::{Worker, WorkerCommand};

/// Run the OpenAPI generator for the API; which emits the OpenAPI spec
/// to stdout.
pub fn run_openapi() -> anyhow::Result<()> {
    http_entrypoints::api()
        .openapi("Mixnet Directory Authority API", "0.0.1")
        .description("API for descriptor uploads and directory documents")
        .write(&mut std::io::stdout())
        .context("writing OpenAPI spec")?;
    Ok(())
}

type HttpServer = dropshot::HttpServer<ServerContext>;
type HttpServerShutdownFut =
    Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

pub struct Server {
    /// dropshot servers for requests from nodes and peer authorities,
    /// keyed by the address they actually bound
    http_servers: HashMap<SocketAddr, HttpServer>,
    /// collection of `wait_for_shutdown` futures for each server inserted
    /// into `http_servers`
    all_servers_shutdown: FuturesUnordered<HttpServerShutdownFut>,
    /// flipping this to true stops the scheduler and worker tasks
    shutdown_tx: watch::Sender<bool>,
    scheduler_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
}

impl Server {
    /// Start a directory authority server.
    pub async fn start(config: Config, log: &Logger) -> anyhow::Result<Server> {
        config.validate().context("invalid configuration")?;
        info!(log, "setting up directory authority server");

        ensure_data_dir(&config.server.data_dir).with_context(|| {
            format!("initializing data directory {}", config.server.data_dir)
        })?;
        let key_path = config.server.data_dir.join("identity.key");
        let keypair = IdentityKeypair::load_or_generate(&key_path)
            .context("loading identity key")?;
        info!(log, "authority identity"; "identity" => %keypair.public());

        let store = Arc::new(
            FsStore::new(&config.server.data_dir, log)
                .context("initializing on-disk store")?,
        );
        let clock: Arc<dyn EpochClock> = Arc::new(SystemClock);
        let state =
            Arc::new(State::new(&config, Arc::clone(&clock), store, log));
        state.initialize().await.context("reloading persisted state")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // Transition hooks just forward to the worker; a command sent
        // after the worker is gone is dropped on the floor, which only
        // happens during shutdown.
        let mut machine = {
            let vote_tx = command_tx.clone();
            let finalize_tx = command_tx;
            PhaseStateMachine::new(
                clock.now().elapsed,
                Box::new(move || {
                    let _ = vote_tx.send(WorkerCommand::DraftVote);
                }),
                Box::new(move || {
                    let _ = finalize_tx.send(WorkerCommand::Finalize);
                }),
                log,
            )
            .context("initializing phase state machine")?
        };

        let scheduler = EpochScheduler::new(Arc::clone(&clock), log);
        let scheduler_task = tokio::spawn({
            let shutdown = shutdown_rx.clone();
            async move { scheduler.run(&mut machine, shutdown).await }
        });

        let worker = Worker::new(
            Arc::clone(&state),
            clock,
            keypair,
            &config,
            command_rx,
            shutdown_rx,
            log,
        )
        .context("initializing peer clients")?;
        let worker_task = tokio::spawn(worker.run());

        let apictx = ServerContext { state };
        let mut http_servers =
            HashMap::with_capacity(config.server.addresses.len());
        let all_servers_shutdown = FuturesUnordered::new();

        for &addr in &config.server.addresses {
            let dropshot = ConfigDropshot {
                bind_address: SocketAddr::V6(addr),
                request_body_max_bytes: config.dropshot.request_body_max_bytes,
                default_handler_task_mode: HandlerTaskMode::Detached,
                log_headers: Vec::new(),
            };
            let http_server = dropshot::HttpServerStarter::new(
                &dropshot,
                http_entrypoints::api(),
                apictx.clone(),
                &log.new(o!("component" => "dropshot")),
            )
            .map_err(|error| anyhow!("initializing http server: {}", error))?
            .start();

            all_servers_shutdown.push(http_server.wait_for_shutdown().boxed());

            let local_addr = http_server.local_addr();
            if http_servers.insert(local_addr, http_server).is_some() {
                bail!("duplicate listening address: {addr}");
            }
        }

        Ok(Server {
            http_servers,
            all_servers_shutdown,
            shutdown_tx,
            scheduler_task,
            worker_task,
        })
    }

    /// Addresses the HTTP servers actually bound, in no particular order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.http_servers.keys().copied().collect()
    }

    /// Wait for the server to shut down
    ///
    /// Note that this doesn't initiate a graceful shutdown, so if you call
    /// this immediately after calling `start()`, the program will block
    /// indefinitely or until something else initiates a graceful shutdown.
    pub async fn wait_for_finish(&mut self) -> anyhow::Result<()> {
        while let Some(result) = self.all_servers_shutdown.next().await {
            result.map_err(|error| anyhow!("http server failed: {error}"))?;
        }
        Ok(())
    }

    /// Gracefully shut down: close the HTTP servers first so no new
    /// requests land on the state, then stop the scheduler and worker.
    pub async fn close(mut self) -> anyhow::Result<()> {
        for (addr, server) in self.http_servers.drain() {
            server.close().await.map_err(|error| {
                anyhow!("closing http server {addr}: {error}")
            })?;
        }
        let _ = self.shutdown_tx.send(true);
        self.scheduler_task.await.context("scheduler task panicked")?;
        self.worker_task.await.context("worker task panicked")?;
        Ok(())
    }
}

// The data directory holds the identity key, so it must be 0700. A
// pre-existing directory with looser permissions is rejected rather than
// silently tightened.
fn ensure_data_dir(dir: &Utf8Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(dir)?;
    let mode = std::fs::metadata(dir)?.permissions().mode() & 0o777;
    if mode != 0o700 {
        bail!("data directory has mode {mode:o}, expected 700");
    }
    Ok(())
}

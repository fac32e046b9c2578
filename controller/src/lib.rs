// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request gateway for copy-on-write virtual machines, its HTTP API
//! server, and a simulated deployment to run them against

mod app;
mod config;
mod context;
pub mod http_entrypoints;
pub mod sim;

pub use app::{Controller, ControllerServices};
pub use config::{Config, LoadError, QuotaConfig, SimConfig};
pub use context::ServerContext;

use cowvm_common::FileKv;
use dropshot::HttpServer;
use sim::SimDeployment;
use slog::{info, o, Drain, Logger};
use std::io;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to initialize logger")]
    InitializeLogger(#[source] io::Error),
    #[error("failed to start simulated hosts")]
    StartHosts(#[source] cowvm_host_agent::StartError),
    #[error("failed to initialize HTTP server")]
    InitializeHttpServer(#[source] dropshot::BuildError),
}

/// The gateway's HTTP server running in front of a simulated deployment.
pub struct SimServer {
    pub deployment: SimDeployment,
    pub controller: Arc<Controller>,
    pub http_server: HttpServer<Arc<ServerContext>>,
}

impl SimServer {
    pub async fn start(
        config: &Config,
        log: &Logger,
    ) -> Result<SimServer, StartError> {
        let deployment = SimDeployment::start(log, &config.topic, &config.sim)
            .map_err(StartError::StartHosts)?;
        let controller = Arc::new(Controller::new(
            log,
            &config.topic,
            config.quota.clone(),
            deployment.controller_services(),
        ));
        let context = ServerContext::new(log, Arc::clone(&controller));
        let http_server = dropshot::ServerBuilder::new(
            http_entrypoints::api(),
            context,
            log.new(o!("component" => "dropshot")),
        )
        .config(config.dropshot.clone())
        .start()
        .map_err(StartError::InitializeHttpServer)?;
        Ok(SimServer { deployment, controller, http_server })
    }

    /// Wait for the server to shut down
    pub async fn wait_for_finish(self) -> Result<(), String> {
        self.http_server.wait_for_shutdown().await
    }

    pub async fn close(self) -> Result<(), String> {
        self.http_server.close().await
    }
}

/// Runs the simulated deployment described by `config` until the HTTP server
/// stops.
pub async fn run_sim(config: Config) -> Result<(), anyhow::Error> {
    let log = config
        .log
        .to_logger("cowvm-sim")
        .map_err(StartError::InitializeLogger)?;
    let log = Logger::root(log.fuse(), o!(FileKv));
    let server = SimServer::start(&config, &log).await?;
    info!(log, "serving";
        "local_addr" => %server.http_server.local_addr(),
        "hosts" => server.deployment.host_names().count(),
    );
    server.wait_for_finish().await.map_err(anyhow::Error::msg)
}

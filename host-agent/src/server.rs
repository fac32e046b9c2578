// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the host agent

use crate::agent::HostAgent;
use crate::config::{Config, HypervisorConfig};
use crate::hypervisor::{self, Hypervisor};
use crate::lifecycle::{AgentServices, LifecycleEngine};
use crate::reconciler::Reconciler;
use crate::route::RouteResolver;
use camino::Utf8PathBuf;
use cowvm_common::api::HostName;
use cowvm_common::services::RequestHandler;
use slog::{info, o, Logger};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create instances directory \"{path}\": {err}")]
    InstancesDir {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// A running host agent.
///
/// The caller connects [`Server::handler`] to the transport so that requests
/// for this host reach it.
pub struct Server {
    agent: Arc<HostAgent>,
    reconciler: Reconciler,
}

impl Server {
    /// Starts an agent with the hypervisor driver named in `config`.
    pub async fn start(
        log: &Logger,
        config: &Config,
        services: AgentServices,
        routes: Arc<dyn RouteResolver>,
    ) -> Result<Server, StartError> {
        if let HypervisorConfig::Libvirt { instances_path, .. } =
            &config.hypervisor
        {
            tokio::fs::create_dir_all(instances_path).await.map_err(
                |err| StartError::InstancesDir {
                    path: instances_path.clone(),
                    err,
                },
            )?;
        }
        let hypervisor = hypervisor::from_config(
            log,
            &config.hypervisor,
            Arc::clone(&services.artifacts),
        );
        Server::start_with_hypervisor(log, config, services, hypervisor, routes)
    }

    /// Starts an agent around an already built hypervisor driver.
    pub fn start_with_hypervisor(
        log: &Logger,
        config: &Config,
        services: AgentServices,
        hypervisor: Arc<dyn Hypervisor>,
        routes: Arc<dyn RouteResolver>,
    ) -> Result<Server, StartError> {
        if config.reconcile_period_secs == 0 {
            return Err(StartError::InvalidConfig(String::from(
                "reconcile_period_secs must be positive",
            )));
        }
        if config.worker_pool.workers == 0 {
            return Err(StartError::InvalidConfig(String::from(
                "worker_pool.workers must be positive",
            )));
        }
        let log = log.new(o!("host" => config.host.to_string()));
        info!(log, "starting host agent";
            "hypervisor" => %hypervisor.kind(),
            "topic" => &config.topic,
        );

        let engine = Arc::new(LifecycleEngine::new(
            &log, config, services, hypervisor, routes,
        ));
        let reconciler = Reconciler::start(
            &log,
            config.host.clone(),
            Arc::clone(engine.migrations()),
            config.reconcile_period(),
        );
        let agent = Arc::new(HostAgent::new(&log, engine));
        Ok(Server { agent, reconciler })
    }

    pub fn host(&self) -> &HostName {
        self.agent.engine().host()
    }

    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::clone(&self.agent) as Arc<dyn RequestHandler>
    }

    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        self.agent.engine()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}

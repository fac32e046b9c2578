// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A bounded pool of workers for long-running lifecycle jobs.
//!
//! Jobs report their outcome only by writing instance state, so the pool
//! never hands results back to whoever submitted the job.

use serde::{Deserialize, Serialize};
use slog::{debug, error, o, Logger};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct WorkerPoolConfig {
    /// Jobs allowed to run at the same time.
    pub workers: usize,
    /// Jobs allowed to wait for a worker before submissions are refused.
    pub queue_depth: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig { workers: 8, queue_depth: 64 }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("worker pool queue is full")]
    QueueFull,

    #[error("worker pool is shut down")]
    Closed,
}

impl From<Error> for cowvm_common::api::Error {
    fn from(err: Error) -> Self {
        cowvm_common::api::Error::unavail(&err.to_string())
    }
}

pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    runner_handle: tokio::task::JoinHandle<()>,
}

impl WorkerPool {
    pub fn new(log: &Logger, config: &WorkerPoolConfig) -> WorkerPool {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let runner = WorkerPoolRunner {
            log: log.new(o!("component" => "WorkerPool")),
            rx,
            semaphore: Arc::new(Semaphore::new(config.workers.max(1))),
            set: JoinSet::new(),
        };
        let runner_handle = tokio::spawn(runner.run());
        WorkerPool { tx, runner_handle }
    }

    /// Queues `job` without waiting for it to start.
    pub fn submit<F>(&self, job: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.try_send(Box::pin(job)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => Error::Closed,
        })
    }

    /// Stops accepting jobs and waits for queued and running ones to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.runner_handle.await;
    }
}

struct WorkerPoolRunner {
    log: Logger,
    rx: mpsc::Receiver<Job>,
    semaphore: Arc<Semaphore>,
    set: JoinSet<()>,
}

impl WorkerPoolRunner {
    async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            // Hold the job in the queue until a worker is free.
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await
            {
                Ok(permit) => permit,
                Err(_) => break,
            };
            while let Some(result) = self.set.try_join_next() {
                self.reap(result);
            }
            self.set.spawn(async move {
                job.await;
                drop(permit);
            });
        }
        debug!(self.log, "worker pool closed; draining");
        while let Some(result) = self.set.join_next().await {
            self.reap(result);
        }
    }

    fn reap(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(err) = result {
            error!(self.log, "worker pool job failed"; "error" => %err);
        }
    }
}

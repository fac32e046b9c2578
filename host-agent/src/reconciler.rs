// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that resolves migrations left behind by lost messages or
//! a restart of this agent

use crate::migration::{MigrationTracker, ReconcileSummary};
use cowvm_common::api::HostName;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ActivationReason {
    Timeout,
    Signaled,
}

/// What the most recent pass did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReconcilerStatus {
    /// Number of completed passes.
    pub iteration: u64,
    pub last_reason: Option<ActivationReason>,
    /// Whether the last pass failed to list instances.
    pub last_failed: bool,
}

/// Handle to the reconciliation task. Dropping it stops the task.
pub struct Reconciler {
    notify: Arc<Notify>,
    status_rx: watch::Receiver<ReconcilerStatus>,
    handle: JoinHandle<()>,
}

impl Reconciler {
    /// Starts reconciling `host` every `period`, beginning immediately.
    pub fn start(
        log: &Logger,
        host: HostName,
        tracker: Arc<MigrationTracker>,
        period: Duration,
    ) -> Reconciler {
        let notify = Arc::new(Notify::new());
        let (status_tx, status_rx) = watch::channel(ReconcilerStatus::default());
        let exec = ReconcilerExec {
            log: log.new(o!("component" => "Reconciler")),
            host,
            tracker,
            period,
            notify: Arc::clone(&notify),
            status_tx,
        };
        let handle = tokio::spawn(exec.run());
        Reconciler { notify, status_rx, handle }
    }

    /// Runs a pass as soon as possible.
    pub fn activate(&self) {
        self.notify.notify_one();
    }

    pub fn status(&self) -> ReconcilerStatus {
        self.status_rx.borrow().clone()
    }

    /// Waits until at least `iteration` passes have completed.
    pub async fn wait_for_iteration(&self, iteration: u64) {
        let mut rx = self.status_rx.clone();
        // The sender only goes away when the task stops.
        let _ = rx.wait_for(|status| status.iteration >= iteration).await;
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ReconcilerExec {
    log: Logger,
    host: HostName,
    tracker: Arc<MigrationTracker>,
    period: Duration,
    notify: Arc<Notify>,
    status_tx: watch::Sender<ReconcilerStatus>,
}

impl ReconcilerExec {
    async fn run(self) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.activate(ActivationReason::Timeout).await;
                },

                _ = self.notify.notified() => {
                    self.activate(ActivationReason::Signaled).await;
                }
            }
        }
    }

    async fn activate(&self, reason: ActivationReason) {
        debug!(self.log, "activating"; "reason" => %reason);
        let failed = match self.tracker.reconcile(&self.host).await {
            Ok(summary) => {
                self.report(&summary);
                false
            }
            Err(err) => {
                warn!(self.log, "reconciliation failed"; "error" => %err);
                true
            }
        };
        self.status_tx.send_modify(|status| {
            status.iteration += 1;
            status.last_reason = Some(reason);
            status.last_failed = failed;
        });
    }

    fn report(&self, summary: &ReconcileSummary) {
        if summary.is_empty() {
            return;
        }
        info!(self.log, "reconciled migrations";
            "activated" => ?summary.activated,
            "failed" => ?summary.failed,
            "incoming_cleared" => ?summary.incoming_cleared,
        );
    }
}

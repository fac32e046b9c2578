// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{Error, HostName, HostRequest, HostResponse};
use crate::services::{Queue, RequestHandler, Transport};
use async_trait::async_trait;
use rand::seq::IteratorRandom;
use slog::{o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    handlers: BTreeMap<(String, HostName), Arc<dyn RequestHandler>>,
    unreachable: BTreeSet<HostName>,
}

/// Delivers messages to handlers registered in the same process.
///
/// Casts are handled on a spawned task. A cast to the bare topic goes to one
/// reachable host chosen at random.
pub struct SimTransport {
    log: Logger,
    inner: Mutex<Inner>,
}

impl SimTransport {
    pub fn new(log: &Logger) -> SimTransport {
        SimTransport {
            log: log.new(o!("component" => "SimTransport")),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Makes `host` consume its queue on `topic`.
    pub fn register(
        &self,
        topic: &str,
        host: HostName,
        handler: Arc<dyn RequestHandler>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .handlers
            .insert((topic.to_string(), host), handler);
    }

    /// While set, every delivery to `host` fails as unavailable.
    pub fn set_host_unreachable(&self, host: &HostName, unreachable: bool) {
        let mut inner = self.inner.lock().unwrap();
        if unreachable {
            inner.unreachable.insert(host.clone());
        } else {
            inner.unreachable.remove(host);
        }
    }

    fn resolve(
        &self,
        queue: &Queue,
    ) -> Result<(HostName, Arc<dyn RequestHandler>), Error> {
        let inner = self.inner.lock().unwrap();
        let topic = queue.topic();
        let host = match queue.host() {
            Some(host) => {
                if inner.unreachable.contains(host) {
                    return Err(Error::unavail(&format!(
                        "host {} is unreachable",
                        host
                    )));
                }
                host.clone()
            }
            None => inner
                .handlers
                .keys()
                .filter(|(t, h)| t == topic && !inner.unreachable.contains(h))
                .map(|(_, h)| h.clone())
                .choose(&mut rand::thread_rng())
                .ok_or_else(|| {
                    Error::unavail(&format!("no host consumes {}", topic))
                })?,
        };
        let handler = inner
            .handlers
            .get(&(topic.to_string(), host.clone()))
            .cloned()
            .ok_or_else(|| {
                Error::unavail(&format!("no consumer on queue {}", queue))
            })?;
        Ok((host, handler))
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn cast(
        &self,
        queue: &Queue,
        request: HostRequest,
    ) -> Result<(), Error> {
        let (host, handler) = self.resolve(queue)?;
        let log = self.log.new(o!(
            "host" => host.to_string(),
            "method" => request.to_string(),
            "instance_id" => request.instance_id().to_string(),
        ));
        tokio::spawn(async move {
            if let Err(error) = handler.handle(request).await {
                warn!(log, "cast request failed"; "error" => %error);
            }
        });
        Ok(())
    }

    async fn call(
        &self,
        queue: &Queue,
        request: HostRequest,
        timeout: Duration,
    ) -> Result<HostResponse, Error> {
        let (host, handler) = self.resolve(queue)?;
        let method = request.to_string();
        match tokio::time::timeout(timeout, handler.handle(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::unavail(&format!(
                "timed out after {:?} waiting for {} on host {}",
                timeout, method, host
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Counter {
        handled: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl RequestHandler for Counter {
        async fn handle(
            &self,
            _request: HostRequest,
        ) -> Result<HostResponse, Error> {
            tokio::time::sleep(self.delay).await;
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(HostResponse::Ack)
        }
    }

    fn request() -> HostRequest {
        HostRequest::PrepareNetwork { instance_id: Uuid::new_v4() }
    }

    #[tokio::test]
    async fn test_call_and_unreachable_host() {
        let log = Logger::root(slog::Discard, o!());
        let transport = SimTransport::new(&log);
        let h1 = HostName::from("h1");
        let counter = Arc::new(Counter {
            handled: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        transport.register("cowvm", h1.clone(), counter.clone());
        let queue = Queue::Host { topic: "cowvm".into(), host: h1.clone() };

        let response = transport
            .call(&queue, request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response, HostResponse::Ack);
        assert_eq!(counter.handled.load(Ordering::SeqCst), 1);

        transport.set_host_unreachable(&h1, true);
        let error = transport
            .call(&queue, request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(error.retryable());
        assert!(transport
            .cast(&Queue::Topic("cowvm".into()), request())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let log = Logger::root(slog::Discard, o!());
        let transport = SimTransport::new(&log);
        let h1 = HostName::from("h1");
        transport.register(
            "cowvm",
            h1.clone(),
            Arc::new(Counter {
                handled: AtomicUsize::new(0),
                delay: Duration::from_secs(60),
            }),
        );
        let queue = Queue::Host { topic: "cowvm".into(), host: h1 };
        let error = transport
            .call(&queue, request(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::ServiceUnavailable { .. }));
    }
}

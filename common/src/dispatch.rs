// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routes lifecycle requests to the host that must execute them

use crate::api::{Error, HostName, HostRequest, HostResponse, InstanceRecord};
use crate::services::{Queue, Transport};
use slog::{debug, o, Logger};
use std::sync::Arc;
use std::time::Duration;

/// Resolves the queue for a request and hands it to the transport.
///
/// Requests that name no host, or a host the caller does not know, go to the
/// bare topic where any host running the service may pick them up.
#[derive(Clone)]
pub struct Dispatcher {
    log: Logger,
    topic: String,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(
        log: &Logger,
        topic: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Dispatcher {
        let topic = topic.into();
        Dispatcher {
            log: log.new(o!("component" => "Dispatcher", "topic" => topic.clone())),
            topic,
            transport,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue_for(&self, host: Option<&HostName>) -> Queue {
        match host {
            Some(host) if !host.as_str().is_empty() => Queue::Host {
                topic: self.topic.clone(),
                host: host.clone(),
            },
            _ => Queue::Topic(self.topic.clone()),
        }
    }

    /// Fire-and-forget delivery to `host`, or to the topic.
    pub async fn cast(
        &self,
        host: Option<&HostName>,
        request: HostRequest,
    ) -> Result<(), Error> {
        let queue = self.queue_for(host);
        debug!(self.log, "cast";
            "queue" => %queue,
            "method" => %request,
            "instance_id" => %request.instance_id(),
        );
        self.transport.cast(&queue, request).await
    }

    /// Fire-and-forget delivery to the host that owns `instance`, unless
    /// `host_override` names another one.
    pub async fn cast_for_instance(
        &self,
        instance: &InstanceRecord,
        host_override: Option<&HostName>,
        request: HostRequest,
    ) -> Result<(), Error> {
        let host = host_override.or(instance.host.as_ref());
        self.cast(host, request).await
    }

    /// Blocking delivery to `host`, waiting at most `timeout` for the answer.
    pub async fn call(
        &self,
        host: Option<&HostName>,
        request: HostRequest,
        timeout: Duration,
    ) -> Result<HostResponse, Error> {
        let queue = self.queue_for(host);
        debug!(self.log, "call";
            "queue" => %queue,
            "method" => %request,
            "instance_id" => %request.instance_id(),
            "timeout" => ?timeout,
        );
        self.transport.call(&queue, request, timeout).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingTransport {
        casts: Mutex<Vec<(Queue, HostRequest)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn cast(
            &self,
            queue: &Queue,
            request: HostRequest,
        ) -> Result<(), Error> {
            self.casts.lock().unwrap().push((queue.clone(), request));
            Ok(())
        }

        async fn call(
            &self,
            _queue: &Queue,
            _request: HostRequest,
            _timeout: Duration,
        ) -> Result<HostResponse, Error> {
            Ok(HostResponse::Ack)
        }
    }

    #[test]
    fn test_queue_resolution() {
        let log = Logger::root(slog::Discard, o!());
        let dispatcher =
            Dispatcher::new(&log, "cowvm", Arc::new(RecordingTransport::default()));

        let queue = dispatcher.queue_for(Some(&HostName::from("h1")));
        assert_eq!(queue.to_string(), "cowvm.h1");
        assert_eq!(queue.host(), Some(&HostName::from("h1")));

        assert_eq!(dispatcher.queue_for(None), Queue::Topic("cowvm".into()));
        assert_eq!(
            dispatcher.queue_for(Some(&HostName::from(""))),
            Queue::Topic("cowvm".into())
        );
    }

    #[tokio::test]
    async fn test_cast_prefers_override() {
        let log = Logger::root(slog::Discard, o!());
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(&log, "cowvm", transport.clone());

        let request = HostRequest::Discard { instance_id: Uuid::new_v4() };
        dispatcher.cast(None, request.clone()).await.unwrap();
        dispatcher
            .cast(Some(&HostName::from("h2")), request.clone())
            .await
            .unwrap();

        let casts = transport.casts.lock().unwrap();
        assert_eq!(casts[0].0, Queue::Topic("cowvm".into()));
        assert_eq!(casts[1].0.to_string(), "cowvm.h2");
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{Error, HostName, HostRequest, HostResponse};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Where a message is delivered.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Queue {
    /// Any one host consuming the topic.
    Topic(String),
    /// The named host's queue on the topic.
    Host { topic: String, host: HostName },
}

impl Queue {
    pub fn topic(&self) -> &str {
        match self {
            Queue::Topic(topic) | Queue::Host { topic, .. } => topic,
        }
    }

    pub fn host(&self) -> Option<&HostName> {
        match self {
            Queue::Topic(_) => None,
            Queue::Host { host, .. } => Some(host),
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Queue::Topic(topic) => f.write_str(topic),
            Queue::Host { topic, host } => write!(f, "{}.{}", topic, host),
        }
    }
}

/// The host-to-host message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers `request` without waiting for it to be handled. Failures of
    /// the handler are never reported back.
    async fn cast(&self, queue: &Queue, request: HostRequest)
        -> Result<(), Error>;

    /// Delivers `request` and waits up to `timeout` for the handler's answer.
    async fn call(
        &self,
        queue: &Queue,
        request: HostRequest,
        timeout: Duration,
    ) -> Result<HostResponse, Error>;
}

/// The consuming end of a host queue.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: HostRequest) -> Result<HostResponse, Error>;
}

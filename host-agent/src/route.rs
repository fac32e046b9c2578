// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finding the local interface that reaches a migration destination

use crate::exec::{execute_async, ExecutionError};
use async_trait::async_trait;
use cowvm_common::api::HostName;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;
use thiserror::Error;

pub const LOOPBACK_DEVICE: &str = "lo";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to look up address of {host}: {err}")]
    Lookup {
        host: HostName,
        #[source]
        err: std::io::Error,
    },

    #[error("could not reach destination {0}")]
    Unreachable(HostName),

    #[error("could not determine interface for destination {0}")]
    NoInterface(HostName),

    #[error("can't migrate to the same host")]
    SameHost,

    #[error(transparent)]
    Exec(#[from] ExecutionError),
}

impl From<Error> for cowvm_common::api::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::SameHost | Error::NoInterface(_) => {
                cowvm_common::api::Error::invalid_request(&err.to_string())
            }
            Error::Lookup { .. } | Error::Unreachable(_) => {
                cowvm_common::api::Error::unavail(&err.to_string())
            }
            Error::Exec(_) => {
                cowvm_common::api::Error::internal_error(&err.to_string())
            }
        }
    }
}

/// The outbound path towards a destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Route {
    /// Interface the traffic leaves through.
    pub device: String,
    /// Preferred source address, when the kernel reports one.
    pub source: Option<IpAddr>,
}

impl Route {
    pub fn is_loopback(&self) -> bool {
        self.device == LOOPBACK_DEVICE
    }
}

#[async_trait]
pub trait RouteResolver: Send + Sync {
    /// Resolves the route to `host`, rejecting routes over loopback.
    async fn resolve(&self, host: &HostName) -> Result<Route, Error>;
}

/// Parses the first line of `ip route get` output, e.g.
/// `10.0.0.2 via 10.0.0.1 dev eth0 src 10.0.0.5 uid 0`.
pub fn parse_route_get(
    host: &HostName,
    output: &str,
) -> Result<Route, Error> {
    let line = output
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::Unreachable(host.clone()))?;
    let mut device = None;
    let mut source = None;
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        match word {
            "dev" => device = words.next().map(str::to_string),
            "src" => source = words.next().and_then(|s| s.parse().ok()),
            _ => (),
        }
    }
    let device = device.ok_or_else(|| Error::NoInterface(host.clone()))?;
    let route = Route { device, source };
    if route.is_loopback() {
        return Err(Error::SameHost);
    }
    Ok(route)
}

/// Asks the kernel via `ip route get`.
pub struct IpRouteResolver;

#[async_trait]
impl RouteResolver for IpRouteResolver {
    async fn resolve(&self, host: &HostName) -> Result<Route, Error> {
        let addr = tokio::net::lookup_host((host.as_str(), 0))
            .await
            .map_err(|err| Error::Lookup { host: host.clone(), err })?
            .next()
            .ok_or_else(|| Error::Unreachable(host.clone()))?;
        let mut cmd = tokio::process::Command::new("ip");
        cmd.args(["route", "get", &addr.ip().to_string()]);
        let output = execute_async(&mut cmd).await?;
        parse_route_get(host, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Resolves routes from a fixed table. Hosts missing from the table are
/// unreachable.
#[derive(Default)]
pub struct StaticRouteResolver {
    routes: Mutex<BTreeMap<HostName, Route>>,
}

impl StaticRouteResolver {
    pub fn new() -> StaticRouteResolver {
        StaticRouteResolver::default()
    }

    pub fn insert(&self, host: HostName, device: &str) {
        self.routes.lock().unwrap().insert(
            host,
            Route { device: device.to_string(), source: None },
        );
    }
}

#[async_trait]
impl RouteResolver for StaticRouteResolver {
    async fn resolve(&self, host: &HostName) -> Result<Route, Error> {
        let route = self
            .routes
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .ok_or_else(|| Error::Unreachable(host.clone()))?;
        if route.is_loopback() {
            return Err(Error::SameHost);
        }
        Ok(route)
    }
}

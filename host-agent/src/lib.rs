// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-host lifecycle service for copy-on-write virtual machines.
//!
//! A host agent consumes the requests addressed to its host: it blesses
//! running instances into templates, launches instances from templates,
//! discards templates, and drives migrations of its instances to other hosts.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod agent;
pub mod config;
mod exec;
pub mod hypervisor;
pub mod lifecycle;
pub mod memory;
pub mod migration;
pub mod reconciler;
pub mod route;
pub mod server;
pub mod worker_pool;

#[cfg(test)]
mod test_util;

pub use config::Config;
pub use lifecycle::AgentServices;
pub use server::{Server, StartError};

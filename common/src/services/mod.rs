// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the collaborators the lifecycle engine consumes but does not
//! implement: the instance database, the network service, the host registry,
//! the artifact store and the host-to-host transport.
//!
//! Every interface is object safe so that components hold them as
//! `Arc<dyn ...>` and can be handed the simulated implementations from
//! [`crate::sim`].

mod artifact;
mod network;
mod registry;
mod store;
mod transport;

pub use artifact::ArtifactStore;
pub use network::{NetworkInfo, NetworkRef, NetworkService, VirtualInterface};
pub use registry::HostRegistry;
pub use store::InstanceStore;
pub use transport::{Queue, RequestHandler, Transport};

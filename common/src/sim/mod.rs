// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementations of the collaborator interfaces in
//! [`crate::services`], used by tests and by the simulated deployment.

mod artifact;
mod network;
mod registry;
mod store;
mod transport;

pub use artifact::SimArtifactStore;
pub use network::SimNetworkService;
pub use registry::SimHostRegistry;
pub use store::SimInstanceStore;
pub use transport::SimTransport;

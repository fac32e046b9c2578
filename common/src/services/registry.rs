// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::api::{Error, HostName};
use async_trait::async_trait;

/// Knows which hosts are currently running a service.
#[async_trait]
pub trait HostRegistry: Send + Sync {
    /// Hosts serving `topic`, without duplicates.
    async fn list_hosts(&self, topic: &str) -> Result<Vec<HostName>, Error>;
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::app::Controller;
use slog::Logger;
use std::sync::Arc;

/// Shared state used by API request handlers
pub struct ServerContext {
    pub controller: Arc<Controller>,
    pub log: Logger,
}

impl ServerContext {
    pub fn new(log: &Logger, controller: Arc<Controller>) -> Arc<Self> {
        Arc::new(ServerContext { controller, log: log.clone() })
    }
}

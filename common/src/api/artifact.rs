// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies an object held by the artifact store.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(transparent)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn new() -> ArtifactId {
        ArtifactId(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        ArtifactId::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ArtifactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ArtifactId(s.parse()?))
    }
}

/// What the artifact store knows about an artifact.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct ArtifactRecord {
    pub id: ArtifactId,
    pub name: String,
    /// The instance whose state this artifact captures, if any.
    pub instance_id: Option<Uuid>,
    /// Size of the uploaded contents; `None` until something is uploaded.
    pub size: Option<u64>,
}

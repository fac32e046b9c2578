// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The instance record and the metadata tags that encode lifecycle flags.

use super::Error;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// Metadata tag names. These are read by components outside this workspace to
// infer lifecycle state and must not change.

/// Set to `true` once a template has been blessed.
pub const TAG_BLESSED: &str = "blessed";
/// On a template record: the instance it was blessed from.
pub const TAG_BLESSED_FROM: &str = "blessed_from";
/// On a launched record: the template it was launched from.
pub const TAG_LAUNCHED_FROM: &str = "launched_from";
/// Present while an outgoing migration holds the instance.
pub const TAG_MIGRATING: &str = "migrating";
/// On an instance that has been blessed: the last clone suffix handed out.
pub const TAG_LAST_CLONE_NUM: &str = "last_clone_num";
/// Comma-separated artifact references produced by bless.
pub const TAG_IMAGES: &str = "images";

/// Persisted run state of an instance.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VmState {
    Active,
    Building,
    Migrating,
    Error,
    Deleted,
}

/// Sub-state of an instance while an operation is in flight.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Networking,
    Spawning,
    Blessing,
    Migrating,
    Exporting,
    Importing,
}

/// Lifecycle state as seen by the lifecycle engine.
///
/// `Blessed` has no persisted `vm_state` of its own: it is an `Active` record
/// that also carries the `blessed` tag.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Building,
    Blessed,
    Migrating,
    Error,
    Deleted,
}

/// Monotonic counter bumped on every write to an instance record.
#[derive(
    Copy,
    Clone,
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
pub struct Generation(u64);

impl Generation {
    pub fn new() -> Generation {
        Generation(1)
    }

    pub fn next(&self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation::new()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_string())
    }
}

/// Name of a host running the lifecycle service.
#[derive(
    Clone,
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
pub struct HostName(String);

impl HostName {
    pub fn new(name: impl Into<String>) -> HostName {
        HostName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostName {
    fn from(s: &str) -> Self {
        HostName(s.to_string())
    }
}

impl From<String> for HostName {
    fn from(s: String) -> Self {
        HostName(s)
    }
}

/// An addressable stream used to move memory and disk state directly between
/// hosts during migration, e.g. `mcdist://eth0`.
#[derive(
    Clone, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(transparent)]
pub struct TransferEndpoint(String);

impl TransferEndpoint {
    pub const SCHEME: &'static str = "mcdist";

    /// Builds the endpoint served from `address` on the local host.
    pub fn mcdist(address: &str) -> TransferEndpoint {
        TransferEndpoint(format!("{}://{}", Self::SCHEME, address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address part of the endpoint, without the scheme.
    pub fn address(&self) -> &str {
        self.0.split_once("://").map(|(_, addr)| addr).unwrap_or(&self.0)
    }
}

impl fmt::Display for TransferEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransferEndpoint {
    fn from(s: String) -> Self {
        TransferEndpoint(s)
    }
}

/// Ordered string-to-string tags attached to an instance.
///
/// The typed accessors below are the only place that knows how lifecycle
/// flags are spelled on the wire.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InstanceMetadata(BTreeMap<String, String>);

impl InstanceMetadata {
    pub fn new() -> InstanceMetadata {
        InstanceMetadata(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copies every entry of `other` into `self`, overwriting existing keys.
    pub fn merge(&mut self, other: InstanceMetadata) {
        self.0.extend(other.0);
    }

    fn uuid_tag(&self, key: &str) -> Option<Uuid> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn blessed_from(&self) -> Option<Uuid> {
        self.uuid_tag(TAG_BLESSED_FROM)
    }

    pub fn launched_from(&self) -> Option<Uuid> {
        self.uuid_tag(TAG_LAUNCHED_FROM)
    }

    /// Whether the `blessed` tag is set to a true value.
    pub fn blessed_flag(&self) -> bool {
        self.get(TAG_BLESSED).is_some_and(|v| {
            v.eq_ignore_ascii_case("true") || v == "1"
        })
    }

    /// A record is a template if it was produced by bless, whether or not the
    /// hypervisor side of the bless has completed.
    pub fn is_blessed(&self) -> bool {
        self.contains_key(TAG_BLESSED_FROM) || self.blessed_flag()
    }

    pub fn is_launched(&self) -> bool {
        self.contains_key(TAG_LAUNCHED_FROM)
    }

    pub fn is_migrating(&self) -> bool {
        self.contains_key(TAG_MIGRATING)
    }

    pub fn set_blessed(&mut self, blessed: bool) {
        self.insert(TAG_BLESSED, if blessed { "true" } else { "false" });
    }

    pub fn set_migrating(&mut self) {
        self.insert(TAG_MIGRATING, "true");
    }

    pub fn clear_migrating(&mut self) {
        self.remove(TAG_MIGRATING);
    }

    /// Artifact references recorded by bless. An empty tag means none.
    pub fn images(&self) -> Vec<String> {
        match self.get(TAG_IMAGES) {
            None | Some("") => Vec::new(),
            Some(images) => images.split(',').map(str::to_string).collect(),
        }
    }

    pub fn set_images(&mut self, images: &[String]) {
        self.insert(TAG_IMAGES, images.join(","));
    }

    /// Bumps `last_clone_num` (starting from -1) and returns the new value.
    pub fn next_clone_num(&mut self) -> Result<i64, Error> {
        let last = match self.get(TAG_LAST_CLONE_NUM) {
            None => -1,
            Some(value) => value.parse::<i64>().map_err(|e| {
                Error::internal_error(&format!(
                    "malformed {} tag {:?}: {}",
                    TAG_LAST_CLONE_NUM, value, e
                ))
            })?,
        };
        let next = last + 1;
        self.insert(TAG_LAST_CLONE_NUM, next.to_string());
        Ok(next)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)>
    for InstanceMetadata
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        InstanceMetadata(
            iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        )
    }
}

/// Shape and identity attributes copied from a parent when bless or launch
/// clones an instance. Running state is never part of this.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct InstanceSpec {
    pub image_ref: String,
    pub instance_type_id: u32,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub root_gb: u64,
    pub ephemeral_gb: u64,
    pub display_name: String,
    pub display_description: String,
    pub user_data: String,
    pub key_name: String,
    pub key_data: String,
    pub availability_zone: Option<String>,
    pub os_type: Option<String>,
    pub locked: bool,
}

impl InstanceSpec {
    /// The spec of a clone of this instance, named `<display_name>-<suffix>`.
    pub fn cloned_with_suffix(&self, suffix: &str) -> InstanceSpec {
        InstanceSpec {
            display_name: format!("{}-{}", self.display_name, suffix),
            locked: false,
            ..self.clone()
        }
    }
}

/// The persisted representation of an instance.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(flatten)]
    pub spec: InstanceSpec,
    pub security_groups: Vec<String>,
    pub vm_state: VmState,
    pub task_state: Option<TaskState>,
    /// Host currently owning the instance; `None` until scheduled.
    pub host: Option<HostName>,
    pub metadata: InstanceMetadata,
    /// Bumped by the instance store on every update.
    pub generation: Generation,
    pub time_created: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// The name the hypervisor knows this instance by.
    pub fn name(&self) -> String {
        format!("instance-{}", self.id.simple())
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        match self.vm_state {
            VmState::Active if self.metadata.blessed_flag() => {
                LifecycleState::Blessed
            }
            VmState::Active => LifecycleState::Active,
            VmState::Building => LifecycleState::Building,
            VmState::Migrating => LifecycleState::Migrating,
            VmState::Error => LifecycleState::Error,
            VmState::Deleted => LifecycleState::Deleted,
        }
    }

    /// The portable subset of this record used by export and import.
    pub fn sanitized(&self) -> InstanceData {
        InstanceData {
            spec: InstanceSpec { locked: false, ..self.spec.clone() },
            vm_state: self.vm_state,
            metadata: self.metadata.clone(),
        }
    }
}

/// Sanitized instance data handed out by export and accepted by import.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct InstanceData {
    #[serde(flatten)]
    pub spec: InstanceSpec,
    pub vm_state: VmState,
    pub metadata: InstanceMetadata,
}

/// Parameters for creating a new instance record.
#[derive(Clone, Debug)]
pub struct InstanceCreate {
    pub project_id: Uuid,
    pub spec: InstanceSpec,
    pub security_groups: Vec<String>,
    pub vm_state: VmState,
    pub host: Option<HostName>,
    pub metadata: InstanceMetadata,
}

impl InstanceCreate {
    /// A `BUILDING`, unscheduled copy of `parent` tagged with `metadata`.
    pub fn copy_of(
        parent: &InstanceRecord,
        suffix: &str,
        metadata: InstanceMetadata,
    ) -> InstanceCreate {
        InstanceCreate {
            project_id: parent.project_id,
            spec: parent.spec.cloned_with_suffix(suffix),
            security_groups: parent.security_groups.clone(),
            vm_state: VmState::Building,
            host: None,
            metadata,
        }
    }
}

/// A partial update of an instance record. Unset fields are left alone.
#[derive(Clone, Debug, Default)]
pub struct InstanceUpdate {
    pub vm_state: Option<VmState>,
    pub task_state: Option<Option<TaskState>>,
    pub host: Option<Option<HostName>>,
    pub launched_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn new() -> InstanceUpdate {
        InstanceUpdate::default()
    }

    pub fn vm_state(mut self, vm_state: VmState) -> Self {
        self.vm_state = Some(vm_state);
        self
    }

    pub fn task_state(mut self, task_state: Option<TaskState>) -> Self {
        self.task_state = Some(task_state);
        self
    }

    pub fn host(mut self, host: Option<HostName>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn launched_now(mut self) -> Self {
        self.launched_at = Some(Utc::now());
        self
    }

    pub fn terminated_now(mut self) -> Self {
        self.terminated_at = Some(Utc::now());
        self
    }

    /// Applies the update to `record`, bumping its generation.
    pub fn apply(&self, record: &mut InstanceRecord) {
        if let Some(vm_state) = self.vm_state {
            record.vm_state = vm_state;
        }
        if let Some(task_state) = self.task_state {
            record.task_state = task_state;
        }
        if let Some(host) = &self.host {
            record.host = host.clone();
        }
        if let Some(launched_at) = self.launched_at {
            record.launched_at = Some(launched_at);
        }
        if let Some(terminated_at) = self.terminated_at {
            record.terminated_at = Some(terminated_at);
        }
        record.generation = record.generation.next();
    }
}

/// Selects instance records in a listing.
#[derive(Clone, Debug, Default)]
pub struct InstanceFilter {
    pub project_id: Option<Uuid>,
    pub host: Option<HostName>,
    pub vm_state: Option<VmState>,
    /// Only records carrying this exact tag value.
    pub metadata: Option<(String, String)>,
    pub include_deleted: bool,
}

impl InstanceFilter {
    pub fn new() -> InstanceFilter {
        InstanceFilter::default()
    }

    pub fn launched_from(id: Uuid) -> InstanceFilter {
        InstanceFilter {
            metadata: Some((TAG_LAUNCHED_FROM.to_string(), id.to_string())),
            ..InstanceFilter::default()
        }
    }

    pub fn blessed_from(id: Uuid) -> InstanceFilter {
        InstanceFilter {
            metadata: Some((TAG_BLESSED_FROM.to_string(), id.to_string())),
            ..InstanceFilter::default()
        }
    }

    pub fn on_host(host: &HostName) -> InstanceFilter {
        InstanceFilter { host: Some(host.clone()), ..InstanceFilter::default() }
    }

    pub fn with_vm_state(mut self, vm_state: VmState) -> Self {
        self.vm_state = Some(vm_state);
        self
    }

    pub fn matches(&self, record: &InstanceRecord) -> bool {
        if !self.include_deleted && record.vm_state == VmState::Deleted {
            return false;
        }
        if self.project_id.is_some_and(|p| p != record.project_id) {
            return false;
        }
        if self.host.is_some() && self.host != record.host {
            return false;
        }
        if self.vm_state.is_some_and(|s| s != record.vm_state) {
            return false;
        }
        if let Some((key, value)) = &self.metadata {
            if record.metadata.get(key) != Some(value.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Parameters accepted by launch.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct LaunchParams {
    /// Memory target for the launched instance, e.g. `"512mb"`.
    #[serde(default)]
    pub target: Option<String>,
    /// Guest parameters forwarded to the hypervisor.
    #[serde(default)]
    pub guest: BTreeMap<String, String>,
    /// Host to launch on; any host running the service when unset.
    #[serde(default)]
    pub target_host: Option<HostName>,
}

//! Resources, their optional capabilities, and the registry's record of them.
//!
//! A resource implementation only has to say what type it is and which
//! fields it has. Everything else is a capability it may or may not offer:
//! reading the live system, one-time initialization, create/update/delete,
//! processing an action, custom diffing, and merging by a stable key.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    diff::{Diff, DiffType},
    field::Field,
    registry::LoadOptions,
    schema::{FieldMetadata, Schema},
};

/// Globally unique key of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub id: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub type_: String,
}

impl ResourceId {
    pub fn new(
        namespace: impl Into<String>,
        type_: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        ResourceId {
            id: id.into(),
            namespace: namespace.into(),
            type_: type_.into(),
        }
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.type_, self.id)
        } else {
            write!(f, "{}/{}/{}", self.namespace, self.type_, self.id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    New,
    Existing,
    Deleted,
}

/// Refreshes current values from the live system.
#[async_trait]
pub trait Reader<M: Sync = ()>: Send + Sync {
    async fn read(&self, meta: &M) -> Result<()>;
}

/// One-time setup before read and diff.
#[async_trait]
pub trait Initer<M: Sync = ()>: Send + Sync {
    async fn init(&self, meta: &M, options: &LoadOptions) -> Result<()>;
}

/// Create, update and delete the managed object.
#[async_trait]
pub trait Cud<M: Sync = ()>: Send + Sync {
    async fn create(&self, meta: &M) -> Result<()>;
    async fn update(&self, meta: &M) -> Result<()>;
    async fn delete(&self, meta: &M) -> Result<()>;
}

/// Performs an action instead of managing an object.
#[async_trait]
pub trait Processor<M: Sync = ()>: Send + Sync {
    async fn process(&self, meta: &M) -> Result<()>;
}

/// Replaces automatic diffing.
pub trait DiffCalculator: Send + Sync {
    fn calculate_diff(&self) -> DiffType;
}

/// Identifies a resource by a stable external key, so that a renamed
/// resource can take over the persisted state of its old declaration.
pub trait Merger: Send + Sync {
    /// An empty string means the resource has no unique id.
    fn unique_id(&self) -> String;
}

/// A managed unit of infrastructure.
///
/// `M` is the meta value handed to every operation, typically the clients
/// and settings a plugin needs to talk to its backend.
pub trait Resource<M: Sync = ()>: Send + Sync {
    /// The type part of the resource's [`ResourceId`].
    fn type_name(&self) -> &'static str;

    /// A human readable name. Defaults to the resource id.
    fn name(&self) -> Option<String> {
        None
    }

    /// Field metadata of this type. Called once per type.
    fn schema(&self) -> Schema {
        Schema::new()
    }

    /// All fields of the resource, by name. The registry may replace a field
    /// with a proxy field during registration.
    fn fields_mut(&mut self) -> Vec<(&'static str, &mut Field)>;

    /// Keep this resource out of the persisted state.
    fn skip_state(&self) -> bool {
        false
    }

    fn reader(&self) -> Option<&dyn Reader<M>> {
        None
    }
    fn initer(&self) -> Option<&dyn Initer<M>> {
        None
    }
    fn cud(&self) -> Option<&dyn Cud<M>> {
        None
    }
    fn processor(&self) -> Option<&dyn Processor<M>> {
        None
    }
    fn diff_calculator(&self) -> Option<&dyn DiffCalculator> {
        None
    }
    fn merger(&self) -> Option<&dyn Merger> {
        None
    }
}

/// A field of a registered resource.
#[derive(Debug, Clone)]
pub struct FieldEntry {
    pub metadata: FieldMetadata,
    pub field: Field,
    /// Resources whose fields this field's value comes from.
    pub origins: BTreeSet<ResourceId>,
}

/// The registry's record of a resource: the resource itself, its fields,
/// lifecycle state, most recent diff and dependency edges.
///
/// State and diff are only written by the task working on this resource
/// during a pass; other tasks read them after that task signaled completion.
/// They sit behind a mutex regardless, so no reader can observe a torn
/// value.
pub struct ResourceWrapper<M: Sync = ()> {
    pub(crate) id: ResourceId,
    pub(crate) resource: Box<dyn Resource<M>>,
    pub(crate) fields: BTreeMap<String, FieldEntry>,
    pub(crate) state: Mutex<State>,
    pub(crate) diff: Mutex<Option<Diff>>,
    pub(crate) dependencies: BTreeSet<ResourceId>,
    pub(crate) depended_by: BTreeSet<ResourceId>,
    pub(crate) is_registered: bool,
}

impl<M: Sync> ResourceWrapper<M> {
    pub(crate) fn new(
        id: ResourceId,
        resource: Box<dyn Resource<M>>,
        fields: BTreeMap<String, FieldEntry>,
        is_registered: bool,
    ) -> Self {
        ResourceWrapper {
            id,
            resource,
            fields,
            state: Mutex::new(State::New),
            diff: Mutex::new(None),
            dependencies: BTreeSet::new(),
            depended_by: BTreeSet::new(),
            is_registered,
        }
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn resource(&self) -> &dyn Resource<M> {
        self.resource.as_ref()
    }

    pub fn display_name(&self) -> String {
        self.resource
            .name()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.id.id.clone())
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldEntry> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name).map(|e| &e.field)
    }

    /// Fields that take part in diffing and persistence.
    pub(crate) fn declared_fields(&self) -> impl Iterator<Item = (&String, &FieldEntry)> {
        self.fields.iter().filter(|(_, e)| !e.metadata.ignored)
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("mutex poisoned")
    }

    pub fn state(&self) -> State {
        *self.lock_state()
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.lock_state() = state;
    }

    pub fn is_new(&self) -> bool {
        self.state() == State::New
    }

    pub fn is_existing(&self) -> bool {
        self.state() == State::Existing
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == State::Deleted
    }

    /// False for resources only known from the persisted state.
    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    pub fn diff(&self) -> Option<Diff> {
        self.diff.lock().expect("mutex poisoned").clone()
    }

    pub fn diff_type(&self) -> DiffType {
        self.diff
            .lock()
            .expect("mutex poisoned")
            .as_ref()
            .map(|d| d.type_)
            .unwrap_or(DiffType::None)
    }

    pub(crate) fn set_diff(&self, diff: Option<Diff>) {
        *self.diff.lock().expect("mutex poisoned") = diff;
    }

    pub(crate) fn record_applied_step(&self) {
        if let Some(diff) = self.diff.lock().expect("mutex poisoned").as_mut() {
            diff.applied_steps += 1;
        }
    }

    pub fn dependencies(&self) -> &BTreeSet<ResourceId> {
        &self.dependencies
    }

    pub fn depended_by(&self) -> &BTreeSet<ResourceId> {
        &self.depended_by
    }

    pub fn unique_id(&self) -> Option<String> {
        self.resource
            .merger()
            .map(|m| m.unique_id())
            .filter(|id| !id.is_empty())
    }

    pub fn skip_state(&self) -> bool {
        self.resource.skip_state()
    }

    /// Commit wanted values after a successful create, update or process.
    pub(crate) fn commit_fields(&self) {
        for entry in self.fields.values() {
            entry.field.set_wanted_as_current();
        }
    }

    /// Set current values from persisted properties. Unknown and ignored
    /// properties are skipped.
    pub(crate) fn apply_properties(&self, properties: &serde_json::Map<String, Value>) {
        for (name, value) in properties {
            match self.fields.get(name) {
                Some(entry) if !entry.metadata.ignored => entry.field.set_current(value.clone()),
                Some(_) => {}
                None => {
                    tracing::debug!(resource = %self.id, property = %name, "skipping unknown persisted property")
                }
            }
        }
    }

    pub(crate) fn properties(&self) -> serde_json::Map<String, Value> {
        self.declared_fields()
            .filter_map(|(name, e)| e.field.serialize_value().map(|v| (name.clone(), v)))
            .collect()
    }
}

impl<M: Sync> std::fmt::Debug for ResourceWrapper<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWrapper")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("diff", &self.diff())
            .field("is_registered", &self.is_registered)
            .field("dependencies", &self.dependencies)
            .field("depended_by", &self.depended_by)
            .finish()
    }
}

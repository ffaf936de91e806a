//! The set of resources of one plan or apply cycle.
//!
//! A [`Registry`] is built fresh for every cycle: resources are registered,
//! the previously persisted state is loaded, diffs are computed and applied,
//! and the result is dumped back into a state blob.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument as _};

use crate::{
    control::graph::Graph,
    error::RegistryError,
    field::{Field, FieldId},
    resource::{FieldEntry, Resource, ResourceId, ResourceWrapper, State},
    schema::Schema,
};

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Maximum number of resource operations in flight.
    pub concurrency: usize,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        RegistryOptions { concurrency: 5 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Refresh current values from the live system after loading.
    pub read: bool,
}

/// Persisted form of an existing resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSerialized {
    #[serde(flatten)]
    pub resource_id: ResourceId,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
    #[serde(default)]
    pub depended_by: Vec<ResourceId>,
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
}

type Factory<M> = Box<dyn Fn() -> Box<dyn Resource<M>> + Send + Sync>;

struct TypeEntry<M: Sync> {
    schema: Schema,
    /// Only types registered with [`Registry::register_type`] can be restored
    /// from the state.
    factory: Option<Factory<M>>,
}

pub struct Registry<M: Sync = ()> {
    pub(crate) resources: BTreeMap<ResourceId, ResourceWrapper<M>>,
    types: BTreeMap<String, TypeEntry<M>>,
    /// Which resource owns a field. Only used until the state is loaded.
    field_owners: HashMap<FieldId, (ResourceId, Field)>,
    obsolete: Vec<ResourceWrapper<M>>,
    options: RegistryOptions,
    loaded: bool,
}

impl<M: Sync> Default for Registry<M> {
    fn default() -> Self {
        Registry::new(RegistryOptions::default())
    }
}

impl<M: Sync> Registry<M> {
    pub fn new(options: RegistryOptions) -> Self {
        Registry {
            resources: BTreeMap::new(),
            types: BTreeMap::new(),
            field_owners: HashMap::new(),
            obsolete: Vec::new(),
            options,
            loaded: false,
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Make a resource type known, so that persisted resources of that type
    /// can be restored when they are no longer declared.
    pub fn register_type<R>(&mut self)
    where
        R: Resource<M> + Default + 'static,
    {
        let sample = R::default();
        let factory: Factory<M> = Box::new(|| Box::new(R::default()));
        match self.types.get_mut(sample.type_name()) {
            Some(entry) => entry.factory = Some(factory),
            None => {
                self.types.insert(
                    sample.type_name().to_owned(),
                    TypeEntry {
                        schema: sample.schema(),
                        factory: Some(factory),
                    },
                );
            }
        }
    }

    fn schema_for(&mut self, resource: &dyn Resource<M>) -> Schema {
        self.types
            .entry(resource.type_name().to_owned())
            .or_insert_with(|| TypeEntry {
                schema: resource.schema(),
                factory: None,
            })
            .schema
            .clone()
    }

    pub fn register_resource<R>(
        &mut self,
        namespace: impl Into<String>,
        id: impl Into<String>,
        resource: R,
    ) -> Result<(), RegistryError>
    where
        R: Resource<M> + 'static,
    {
        self.register_boxed(namespace.into(), id.into(), Box::new(resource))
    }

    /// Register a declared resource.
    ///
    /// A field that is identical to a field of an earlier registered resource
    /// is replaced by a proxy of it, and makes this resource depend on that
    /// one. So do fields nested in the wanted values of this resource's
    /// fields.
    pub fn register_boxed(
        &mut self,
        namespace: String,
        id: String,
        mut resource: Box<dyn Resource<M>>,
    ) -> Result<(), RegistryError> {
        if self.loaded {
            return Err(RegistryError::AlreadyLoaded);
        }
        let rid = ResourceId::new(namespace, resource.type_name(), id);
        if self.resources.contains_key(&rid) {
            return Err(RegistryError::DuplicateResource(rid));
        }

        let schema = self.schema_for(resource.as_ref());
        let names: Vec<&'static str> = resource
            .fields_mut()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        if let Some(missing) = schema.names().find(|n| !names.iter().any(|m| m == n)) {
            return Err(RegistryError::UnknownField {
                type_: rid.type_.clone(),
                field: missing.to_owned(),
            });
        }

        let mut fields = BTreeMap::new();
        let mut dependencies = BTreeSet::new();
        for (name, field) in resource.fields_mut() {
            let metadata = schema.metadata(name);
            let mut origins = BTreeSet::new();

            match self.field_owners.get(&field.id()) {
                Some((owner, origin)) if owner != &rid => {
                    tracing::trace!(resource = %rid, field = name, origin = %owner, "replacing aliased field with proxy");
                    origins.insert(owner.clone());
                    *field = Field::proxy(origin);
                    // later aliases of the proxy depend on this resource
                    self.field_owners
                        .insert(field.id(), (rid.clone(), field.clone()));
                }
                Some(_) => {}
                None => {
                    self.field_owners
                        .insert(field.id(), (rid.clone(), field.clone()));
                    if !field.is_output() && !field.is_wanted_defined() {
                        if let Some(default) = &metadata.default {
                            field.set_wanted(default.clone());
                        }
                    }
                }
            }

            for nested in field.field_dependencies() {
                match self.field_owners.get(&nested.id()) {
                    Some((owner, _)) if owner != &rid => {
                        origins.insert(owner.clone());
                    }
                    Some(_) => {}
                    None => {
                        self.field_owners
                            .insert(nested.id(), (rid.clone(), nested.clone()));
                    }
                }
            }

            dependencies.extend(origins.iter().cloned());
            fields.insert(
                name.to_owned(),
                FieldEntry {
                    metadata,
                    field: field.clone(),
                    origins,
                },
            );
        }

        let mut wrapper = ResourceWrapper::new(rid.clone(), resource, fields, true);
        for dependency in &dependencies {
            if let Some(d) = self.resources.get_mut(dependency) {
                d.depended_by.insert(rid.clone());
            }
        }
        wrapper.dependencies = dependencies;
        tracing::debug!(resource = %rid, dependencies = ?wrapper.dependencies, "registered resource");
        self.resources.insert(rid, wrapper);
        Ok(())
    }

    /// Load the persisted state, then run the init pass and, if requested,
    /// the read pass.
    ///
    /// Declared resources found in the state become existing. Persisted
    /// resources that are no longer declared are restored as deletion
    /// candidates, unless a declared resource with the same unique id takes
    /// them over.
    pub async fn load(
        &mut self,
        state: &[u8],
        meta: &M,
        options: &LoadOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.loaded {
            return Err(RegistryError::AlreadyLoaded.into());
        }
        self.restore(state)?;
        self.field_owners.clear();
        self.loaded = true;

        self.init(meta, options, cancel).await?;
        if options.read {
            self.read(meta, cancel).await?;
        }
        Ok(())
    }

    fn restore(&mut self, state: &[u8]) -> Result<(), RegistryError> {
        let entries = parse_state(state)?;
        tracing::debug!(count = entries.len(), "restoring persisted resources");

        let mut restored = Vec::new();
        for entry in &entries {
            match self.resources.get(&entry.resource_id) {
                Some(w) => {
                    w.apply_properties(&entry.properties);
                    w.set_state(State::Existing);
                }
                None => {
                    let w = self.placeholder(entry)?;
                    self.resources.insert(entry.resource_id.clone(), w);
                    restored.push(entry);
                }
            }
        }

        for entry in restored {
            for dependency in &entry.dependencies {
                if !self.resources.contains_key(dependency) {
                    return Err(RegistryError::MissingDependency {
                        resource: entry.resource_id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                self.add_edge(&entry.resource_id, dependency);
            }
        }

        self.merge_by_unique_id()
    }

    fn placeholder(&self, entry: &ResourceSerialized) -> Result<ResourceWrapper<M>, RegistryError> {
        let id = &entry.resource_id;
        let (schema, factory) = match self.types.get(&id.type_) {
            Some(TypeEntry {
                schema,
                factory: Some(factory),
            }) => (schema, factory),
            _ => return Err(RegistryError::UnknownResourceType(id.clone())),
        };
        let mut resource = factory();
        let fields = resource
            .fields_mut()
            .into_iter()
            .map(|(name, field)| {
                (
                    name.to_owned(),
                    FieldEntry {
                        metadata: schema.metadata(name),
                        field: field.clone(),
                        origins: BTreeSet::new(),
                    },
                )
            })
            .collect();
        let w = ResourceWrapper::new(id.clone(), resource, fields, false);
        w.apply_properties(&entry.properties);
        w.set_state(State::Existing);
        Ok(w)
    }

    fn add_edge(&mut self, resource: &ResourceId, dependency: &ResourceId) {
        if let Some(w) = self.resources.get_mut(resource) {
            w.dependencies.insert(dependency.clone());
        }
        if let Some(d) = self.resources.get_mut(dependency) {
            d.depended_by.insert(resource.clone());
        }
    }

    fn merge_by_unique_id(&mut self) -> Result<(), RegistryError> {
        let mut by_unique_id: BTreeMap<String, Vec<ResourceId>> = BTreeMap::new();
        for (id, w) in &self.resources {
            if let Some(unique_id) = w.unique_id() {
                by_unique_id.entry(unique_id).or_default().push(id.clone());
            }
        }

        for (unique_id, ids) in by_unique_id {
            if ids.len() < 2 {
                continue;
            }
            let (registered, unregistered): (Vec<_>, Vec<_>) = ids
                .into_iter()
                .partition(|id| self.resources[id].is_registered());
            for (group, is_registered) in [(&registered, true), (&unregistered, false)] {
                if let [first, second, ..] = group.as_slice() {
                    return Err(RegistryError::UniqueIdConflict {
                        unique_id,
                        first: first.clone(),
                        second: second.clone(),
                        registered: is_registered,
                    });
                }
            }
            self.merge_obsolete(&unregistered[0], &registered[0], &unique_id);
        }
        Ok(())
    }

    /// Replace the undeclared resource `old` by its declared successor `new`.
    fn merge_obsolete(&mut self, old: &ResourceId, new: &ResourceId, unique_id: &str) {
        let Some(obsolete) = self.resources.remove(old) else {
            return;
        };
        for dependency in &obsolete.dependencies {
            if let Some(d) = self.resources.get_mut(dependency) {
                d.depended_by.remove(old);
            }
        }
        // Whatever depended on the old resource now depends on its successor.
        for dependent in &obsolete.depended_by {
            if let Some(d) = self.resources.get_mut(dependent) {
                d.dependencies.remove(old);
            }
            if dependent != new {
                self.add_edge(dependent, new);
            }
        }

        if let Some(successor) = self.resources.get(new) {
            if successor.is_new() {
                successor.apply_properties(&obsolete.properties());
                successor.set_state(State::Existing);
            }
        }
        obsolete.set_state(State::Deleted);
        tracing::info!(obsolete = %old, successor = %new, unique_id, "merged resource with the same unique id");
        self.obsolete.push(obsolete);
    }

    pub(crate) fn dependency_graph(&self) -> Graph<ResourceId> {
        let mut graph = Graph::new();
        for (id, w) in &self.resources {
            graph.add_node(id.clone());
            for dependency in &w.dependencies {
                if self.resources.contains_key(dependency) {
                    graph.add_dependency(id.clone(), dependency.clone());
                }
            }
        }
        graph
    }

    async fn init(&self, meta: &M, options: &LoadOptions, cancel: &CancellationToken) -> Result<()> {
        let limiter = Semaphore::new(self.options.concurrency);
        self.dependency_graph()
            .run(&limiter, cancel, |id| async move {
                let w = &self.resources[&id];
                let Some(initer) = w.resource().initer() else {
                    return Ok(());
                };
                initer
                    .init(meta, options)
                    .instrument(info_span!("init", resource = %id))
                    .await
                    .with_context(|| format!("failed to initialize {} {}", id.type_, w.display_name()))
            })
            .instrument(info_span!("initializing resources"))
            .await
    }

    async fn read(&self, meta: &M, cancel: &CancellationToken) -> Result<()> {
        let limiter = Semaphore::new(self.options.concurrency);
        self.dependency_graph()
            .run(&limiter, cancel, |id| async move {
                let w = &self.resources[&id];
                let Some(reader) = w.resource().reader() else {
                    return Ok(());
                };
                reader
                    .read(meta)
                    .instrument(info_span!("read", resource = %id))
                    .await
                    .with_context(|| format!("failed to read {} {}", id.type_, w.display_name()))
            })
            .instrument(info_span!("reading resources"))
            .await
    }

    /// Serialize every existing resource, for loading in the next cycle.
    pub fn dump(&self) -> Result<Vec<u8>> {
        let dumped: BTreeSet<&ResourceId> = self
            .resources
            .values()
            .filter(|w| w.is_existing() && !w.skip_state())
            .map(|w| w.id())
            .collect();
        let only_dumped = |ids: &BTreeSet<ResourceId>| -> Vec<ResourceId> {
            ids.iter().filter(|id| dumped.contains(id)).cloned().collect()
        };
        let entries: Vec<ResourceSerialized> = dumped
            .iter()
            .map(|id| {
                let w = &self.resources[*id];
                ResourceSerialized {
                    resource_id: w.id().clone(),
                    properties: w.properties(),
                    depended_by: only_dumped(w.depended_by()),
                    dependencies: only_dumped(w.dependencies()),
                }
            })
            .collect();
        serde_json::to_vec_pretty(&entries).context("serializing state")
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceWrapper<M>> {
        self.resources.values()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceWrapper<M>> {
        self.resources.get(id)
    }

    /// Persisted resources that were taken over by a declared resource with
    /// the same unique id.
    pub fn obsolete(&self) -> &[ResourceWrapper<M>] {
        &self.obsolete
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// An empty blob, or `null`, is no state.
fn parse_state(state: &[u8]) -> Result<Vec<ResourceSerialized>, RegistryError> {
    if state.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let entries: Option<Vec<ResourceSerialized>> =
        serde_json::from_slice(state).map_err(RegistryError::InvalidState)?;
    Ok(entries.unwrap_or_default())
}

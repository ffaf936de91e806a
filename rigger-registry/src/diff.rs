//! Change classification: what has to happen to each resource.

use std::{collections::BTreeSet, fmt::Display};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument as _};

use crate::{
    registry::Registry,
    resource::{ResourceId, ResourceWrapper},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffType {
    #[default]
    None,
    Create,
    Update,
    Recreate,
    Delete,
    Process,
}

impl Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiffType::None => "none",
            DiffType::Create => "create",
            DiffType::Update => "update",
            DiffType::Recreate => "recreate",
            DiffType::Delete => "delete",
            DiffType::Process => "process",
        };
        f.pad(s)
    }
}

/// The computed action for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub object: ResourceId,
    #[serde(rename = "type")]
    pub type_: DiffType,
    pub changed_fields: Vec<String>,
    /// Steps completed so far, see [`Diff::required_steps`].
    pub applied_steps: usize,
}

impl Diff {
    pub fn new(object: ResourceId, type_: DiffType, changed_fields: Vec<String>) -> Self {
        Diff {
            object,
            type_,
            changed_fields,
            applied_steps: 0,
        }
    }

    /// Recreate deletes and then creates; everything else is one step.
    pub fn required_steps(&self) -> usize {
        match self.type_ {
            DiffType::Recreate => 2,
            _ => 1,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.applied_steps >= self.required_steps()
    }
}

impl<M: Sync> Registry<M> {
    /// Compute the diff of every resource.
    ///
    /// Resources are visited in dependency order, so that a resource sees
    /// the diffs of everything it depends on. With `destroy`, every existing
    /// resource is scheduled for deletion.
    pub async fn diff(&self, destroy: bool, cancel: &CancellationToken) -> Result<Vec<Diff>> {
        for w in self.resources.values() {
            w.set_diff(None);
        }
        let graph = self.dependency_graph();
        let limiter = Semaphore::new(self.options().concurrency);
        graph
            .run(&limiter, cancel, |id| async move {
                self.diff_resource(&id, destroy);
                Ok(())
            })
            .instrument(info_span!("computing diff", destroy))
            .await?;

        let diffs: Vec<Diff> = self.resources.values().filter_map(|w| w.diff()).collect();
        tracing::debug!(count = diffs.len(), "diff computed");
        Ok(diffs)
    }

    fn diff_resource(&self, id: &ResourceId, destroy: bool) {
        let w = &self.resources[id];
        if !w.is_registered() || destroy {
            self.cascade_delete(w, &mut BTreeSet::new());
            return;
        }
        if w.diff().is_some() {
            // deleted along with something it depends on
            return;
        }

        let processor_only = w.resource().processor().is_some() && w.resource().cud().is_none();

        if let Some(calculator) = w.resource().diff_calculator() {
            let type_ = calculator.calculate_diff();
            if type_ != DiffType::None {
                let (changed, _) = self.changed_fields(w);
                w.set_diff(Some(Diff::new(id.clone(), type_, changed)));
            }
            return;
        }

        if w.is_new() || w.is_deleted() {
            let fields = w.declared_fields().map(|(name, _)| name.clone()).collect();
            let type_ = if processor_only {
                DiffType::Process
            } else {
                DiffType::Create
            };
            w.set_diff(Some(Diff::new(id.clone(), type_, fields)));
            return;
        }

        let (changed, force_new) = self.changed_fields(w);
        if changed.is_empty() {
            return;
        }
        let type_ = if processor_only {
            DiffType::Process
        } else if force_new {
            DiffType::Recreate
        } else {
            DiffType::Update
        };
        tracing::debug!(resource = %id, %type_, fields = ?changed, "resource changed");
        w.set_diff(Some(Diff::new(id.clone(), type_, changed)));
    }

    /// Changed declared fields, and whether any of them forces recreation.
    ///
    /// A force-new field also counts as changed when a resource its value
    /// comes from has a diff other than an update, unless the field is an
    /// output or computed field.
    fn changed_fields(&self, w: &ResourceWrapper<M>) -> (Vec<String>, bool) {
        let mut changed = Vec::new();
        let mut force_new = false;
        for (name, entry) in w.declared_fields() {
            let mut is_changed = entry.field.is_changed();
            if !is_changed
                && entry.metadata.force_new
                && !entry.field.is_output()
                && !entry.metadata.computed
            {
                is_changed = entry.origins.iter().any(|origin| {
                    self.resources.get(origin).is_some_and(|upstream| {
                        !matches!(upstream.diff_type(), DiffType::None | DiffType::Update)
                    })
                });
            }
            if is_changed {
                changed.push(name.clone());
                force_new |= entry.metadata.force_new;
            }
        }
        (changed, force_new)
    }

    /// Schedule `w` for deletion, together with everything that depends on
    /// it.
    fn cascade_delete(&self, w: &ResourceWrapper<M>, visited: &mut BTreeSet<ResourceId>) {
        if !visited.insert(w.id().clone()) {
            return;
        }
        for dependent in w.depended_by() {
            if let Some(d) = self.resources.get(dependent) {
                self.cascade_delete(d, visited);
            }
        }
        if w.is_existing() && w.diff_type() != DiffType::Delete {
            tracing::debug!(resource = %w.id(), "scheduling deletion");
            w.set_diff(Some(Diff::new(w.id().clone(), DiffType::Delete, Vec::new())));
        }
    }
}

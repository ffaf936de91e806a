//! Execution of diffs.
//!
//! Every step of every diff is a node of a [`Graph`]. A step that creates,
//! updates or processes a resource waits for the diffs of its dependencies,
//! except those being deleted. A step that deletes a resource waits for its
//! dependents to be deleted or recreated first, and for updating dependents
//! as well when the resource goes away for good.

use std::{collections::BTreeMap, fmt::Display};

use anyhow::{anyhow, Context as _, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument as _};

use crate::{
    control::graph::Graph,
    diff::{Diff, DiffType},
    error::RegistryError,
    registry::Registry,
    resource::{Cud, ResourceId, ResourceWrapper, State},
};

/// Progress of one diff, reported before its first and after each step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyAction {
    #[serde(rename = "type")]
    pub type_: DiffType,
    pub namespace: String,
    pub object_id: String,
    pub object_type: String,
    pub object_name: String,
    pub progress: usize,
    pub total: usize,
}

impl ApplyAction {
    fn new<M: Sync>(w: &ResourceWrapper<M>, diff: &Diff, progress: usize) -> Self {
        ApplyAction {
            type_: diff.type_,
            namespace: w.id().namespace.clone(),
            object_id: w.id().id.clone(),
            object_type: w.id().type_.clone(),
            object_name: w.display_name(),
            progress,
            total: diff.required_steps(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Step {
    object: ResourceId,
    index: usize,
}

impl Step {
    fn new(object: &ResourceId, index: usize) -> Self {
        Step {
            object: object.clone(),
            index,
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (step {})", self.object, self.index)
    }
}

fn is_delete_step(type_: DiffType, index: usize) -> bool {
    type_ == DiffType::Delete || (type_ == DiffType::Recreate && index == 0)
}

fn operation(type_: DiffType, index: usize) -> &'static str {
    match type_ {
        DiffType::None => "apply",
        DiffType::Create => "create",
        DiffType::Update => "update",
        DiffType::Process => "process",
        DiffType::Delete => "delete",
        DiffType::Recreate if index == 0 => "delete",
        DiffType::Recreate => "create",
    }
}

impl<M: Sync> Registry<M> {
    /// Apply `diffs`, as computed by [`Registry::diff`].
    ///
    /// `callback` is called with the progress of each diff. The first
    /// failing operation cancels the steps that have not started yet; steps
    /// that already completed are not rolled back.
    pub async fn apply<F>(
        &self,
        meta: &M,
        diffs: &[Diff],
        cancel: &CancellationToken,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(ApplyAction) + Sync,
    {
        let mut planned: BTreeMap<&ResourceId, &Diff> = BTreeMap::new();
        for diff in diffs {
            let w = self
                .resources
                .get(&diff.object)
                .ok_or_else(|| RegistryError::UnknownResource(diff.object.clone()))?;
            w.set_diff(Some(Diff {
                applied_steps: 0,
                ..diff.clone()
            }));
            planned.insert(&diff.object, diff);
        }

        let graph = self.step_graph(&planned);
        let limiter = Semaphore::new(self.options().concurrency);
        let (planned, callback) = (&planned, &callback);
        graph
            .run(&limiter, cancel, |step| async move {
                self.apply_step(meta, planned[&step.object], step.index, callback)
                    .await
            })
            .instrument(info_span!("applying", diffs = diffs.len()))
            .await
    }

    fn step_graph(&self, planned: &BTreeMap<&ResourceId, &Diff>) -> Graph<Step> {
        let mut graph = Graph::new();
        for (id, diff) in planned {
            let w = &self.resources[*id];
            for index in 0..diff.required_steps() {
                let step = Step::new(id, index);
                graph.add_node(step.clone());
                if index > 0 {
                    graph.add_dependency(step.clone(), Step::new(id, index - 1));
                }

                if is_delete_step(diff.type_, index) {
                    for dependent in w.depended_by() {
                        let Some(other) = planned.get(dependent) else {
                            continue;
                        };
                        let waits = match other.type_ {
                            DiffType::Delete | DiffType::Recreate => true,
                            DiffType::Update => diff.type_ == DiffType::Delete,
                            _ => false,
                        };
                        if waits {
                            graph.add_dependency(step.clone(), Step::new(dependent, 0));
                        }
                    }
                } else {
                    for dependency in w.dependencies() {
                        let Some(other) = planned.get(dependency) else {
                            continue;
                        };
                        if other.type_ != DiffType::Delete {
                            graph.add_dependency(
                                step.clone(),
                                Step::new(dependency, other.required_steps() - 1),
                            );
                        }
                    }
                }
            }
        }
        graph
    }

    async fn apply_step<F>(&self, meta: &M, diff: &Diff, index: usize, callback: &F) -> Result<()>
    where
        F: Fn(ApplyAction) + Sync,
    {
        let w = &self.resources[&diff.object];
        if index == 0 {
            callback(ApplyAction::new(w, diff, 0));
        }
        let op = operation(diff.type_, index);
        run_step(meta, w, diff.type_, index)
            .instrument(info_span!("apply", resource = %w.id(), action = %diff.type_, step = index))
            .await
            .with_context(|| format!("failed to {} {} {}", op, w.id().type_, w.display_name()))?;
        w.record_applied_step();
        callback(ApplyAction::new(w, diff, index + 1));
        Ok(())
    }
}

fn cud<'a, M: Sync>(w: &'a ResourceWrapper<M>, op: &str) -> Result<&'a dyn Cud<M>> {
    w.resource()
        .cud()
        .ok_or_else(|| anyhow!("resource type {} does not support {}", w.id().type_, op))
}

async fn run_step<M: Sync>(
    meta: &M,
    w: &ResourceWrapper<M>,
    type_: DiffType,
    index: usize,
) -> Result<()> {
    match (type_, index) {
        (DiffType::Create, _) | (DiffType::Recreate, 1) => {
            cud(w, "create")?.create(meta).await?;
            w.set_state(State::Existing);
            w.commit_fields();
        }
        (DiffType::Update, _) => {
            cud(w, "update")?.update(meta).await?;
            w.commit_fields();
        }
        (DiffType::Process, _) => {
            let processor = w.resource().processor().ok_or_else(|| {
                anyhow!("resource type {} does not support process", w.id().type_)
            })?;
            processor.process(meta).await?;
            w.set_state(State::Existing);
            w.commit_fields();
        }
        (DiffType::Delete, _) | (DiffType::Recreate, _) => {
            // Without Cud there is no object to remove, only the record.
            if let Some(cud) = w.resource().cud() {
                cud.delete(meta).await?;
            }
            w.set_state(State::Deleted);
        }
        (DiffType::None, _) => panic!("diff of {} has type none and cannot be applied", w.id()),
    }
    tracing::debug!(resource = %w.id(), action = %type_, step = index, "step done");
    Ok(())
}

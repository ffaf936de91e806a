//! Stub resources that record what the engine asked them to do.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    field::Field,
    registry::{LoadOptions, Registry},
    resource::{Cud, Merger, Processor, Reader, Resource, ResourceId},
    schema::{FieldMetadata, Schema},
};

pub(crate) fn rid(id: &str) -> ResourceId {
    ResourceId::new("app", "stub", id)
}

/// A persisted `app/stub` entry.
pub(crate) fn persisted(id: &str, properties: Value, dependencies: &[&str]) -> Value {
    json!({
        "id": id,
        "namespace": "app",
        "type": "stub",
        "properties": properties,
        "depended_by": [],
        "dependencies": dependencies.iter().map(|d| rid(d)).collect::<Vec<_>>(),
    })
}

pub(crate) async fn load(reg: &mut Registry, state: Value) -> Result<()> {
    let bytes = serde_json::to_vec(&state)?;
    reg.load(&bytes, &(), &LoadOptions::default(), &CancellationToken::new())
        .await
}

#[derive(Default)]
pub(crate) struct Journal {
    entries: Mutex<Vec<String>>,
    started: AtomicUsize,
}

impl Journal {
    pub(crate) fn new() -> Arc<Journal> {
        Arc::new(Journal::default())
    }

    pub(crate) fn record(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn position(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{entry:?} not in journal {:?}", self.entries()))
    }

    /// Operations that got past their gate, whether or not they finished.
    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

/// A managed object with a force-new `name`, a plain `size` (default 1), a
/// force-new `upstream` for wiring dependencies, an ignored `note`, a `key`
/// used as unique id and a generated `id` output.
pub(crate) struct Stub {
    pub name: Field,
    pub size: Field,
    pub upstream: Field,
    pub note: Field,
    pub key: Field,
    pub id: Field,
    pub skip_state: bool,
    /// Operation that fails.
    pub fail: Option<&'static str>,
    pub delay: Duration,
    pub journal: Arc<Journal>,
}

impl Default for Stub {
    fn default() -> Self {
        Stub {
            name: Field::input_unset(),
            size: Field::input_unset(),
            upstream: Field::input_unset(),
            note: Field::input_unset(),
            key: Field::input_unset(),
            id: Field::output(),
            skip_state: false,
            fail: None,
            delay: Duration::ZERO,
            journal: Arc::default(),
        }
    }
}

impl Stub {
    pub(crate) fn new(name: &str, journal: &Arc<Journal>) -> Self {
        Stub {
            name: Field::input(name),
            journal: journal.clone(),
            ..Default::default()
        }
    }

    /// The declared name, or the persisted one for restored stubs.
    fn label(&self) -> String {
        self.name
            .lookup_wanted()
            .or_else(|| self.name.lookup_current())
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    async fn op(&self, op: &str) -> Result<()> {
        self.journal.started.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.journal.record(format!("{op} {}", self.label()));
        if self.fail == Some(op) {
            bail!("{op} exploded");
        }
        Ok(())
    }
}

impl Resource for Stub {
    fn type_name(&self) -> &'static str {
        "stub"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .field("name", FieldMetadata::default().force_new())
            .field("size", FieldMetadata::default().default_value(1))
            .field("upstream", FieldMetadata::default().force_new())
            .field("note", FieldMetadata::default().ignored())
            .field("id", FieldMetadata::default().computed())
    }

    fn fields_mut(&mut self) -> Vec<(&'static str, &mut Field)> {
        vec![
            ("name", &mut self.name),
            ("size", &mut self.size),
            ("upstream", &mut self.upstream),
            ("note", &mut self.note),
            ("key", &mut self.key),
            ("id", &mut self.id),
        ]
    }

    fn skip_state(&self) -> bool {
        self.skip_state
    }

    fn reader(&self) -> Option<&dyn Reader> {
        Some(self)
    }

    fn cud(&self) -> Option<&dyn Cud> {
        Some(self)
    }

    fn merger(&self) -> Option<&dyn Merger> {
        Some(self)
    }
}

#[async_trait]
impl Reader for Stub {
    async fn read(&self, _meta: &()) -> Result<()> {
        self.op("read").await
    }
}

#[async_trait]
impl Cud for Stub {
    async fn create(&self, _meta: &()) -> Result<()> {
        self.op("create").await?;
        self.id.set_current(format!("{}-id", self.label()));
        Ok(())
    }

    async fn update(&self, _meta: &()) -> Result<()> {
        self.op("update").await
    }

    async fn delete(&self, _meta: &()) -> Result<()> {
        self.op("delete").await
    }
}

impl Merger for Stub {
    fn unique_id(&self) -> String {
        self.key.any_as::<String>().ok().flatten().unwrap_or_default()
    }
}

/// An action without a managed object.
pub(crate) struct Action {
    pub command: Field,
    pub journal: Arc<Journal>,
}

impl Action {
    pub(crate) fn new(command: &str, journal: &Arc<Journal>) -> Self {
        Action {
            command: Field::input(command),
            journal: journal.clone(),
        }
    }
}

impl Resource for Action {
    fn type_name(&self) -> &'static str {
        "action"
    }

    fn fields_mut(&mut self) -> Vec<(&'static str, &mut Field)> {
        vec![("command", &mut self.command)]
    }

    fn processor(&self) -> Option<&dyn Processor> {
        Some(self)
    }
}

#[async_trait]
impl Processor for Action {
    async fn process(&self, _meta: &()) -> Result<()> {
        let command: String = self.command.any_as()?.unwrap_or_default();
        self.journal.record(format!("process {command}"));
        Ok(())
    }
}

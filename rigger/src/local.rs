//! Resource types that operate on the local machine.

use std::{collections::BTreeMap, io, path::PathBuf};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng as _};
use rigger_registry::{
    Cud, Field, FieldMetadata, Merger, Processor, Reader, Registry, Resource, Schema,
};
use serde_json::{json, Value};

/// Make the built-in types known, so that resources removed from the
/// deployment can still be deleted.
pub fn register_types(registry: &mut Registry) {
    registry.register_type::<LocalFile>();
    registry.register_type::<RandomString>();
    registry.register_type::<Exec>();
}

/// Construct a resource of type `type_` from its inputs.
pub fn build(type_: &str, mut inputs: BTreeMap<String, Field>) -> Result<Box<dyn Resource>> {
    let mut resource: Box<dyn Resource> = match type_ {
        "file" => Box::<LocalFile>::default(),
        "random_string" => Box::<RandomString>::default(),
        "exec" => Box::<Exec>::default(),
        t => bail!("unknown resource type: {}", t),
    };
    for (name, field) in resource.fields_mut() {
        if let Some(input) = inputs.remove(name) {
            if field.is_output() {
                bail!("{} is an output of {} resources and cannot be set", name, type_);
            }
            *field = input;
        }
    }
    if let Some(name) = inputs.keys().next() {
        bail!("{} resources have no input {}", type_, name);
    }
    Ok(resource)
}

/// The value to apply: wanted, falling back to current for fields that are
/// not declared.
fn wanted<T: serde::de::DeserializeOwned>(field: &Field, name: &str) -> Result<T> {
    let value = match field.wanted_as() {
        Ok(Some(v)) => Some(v),
        Ok(None) => field.current_as()?,
        Err(e) => return Err(e).with_context(|| format!("invalid value for {}", name)),
    };
    value.with_context(|| format!("{} is not known", name))
}

/// The value the live object was created with.
fn current<T: serde::de::DeserializeOwned>(field: &Field, name: &str) -> Result<T> {
    field
        .any_as()
        .with_context(|| format!("invalid value for {}", name))?
        .with_context(|| format!("{} is not known", name))
}

/// A file with the given contents.
pub struct LocalFile {
    path: Field,
    contents: Field,
}

impl Default for LocalFile {
    fn default() -> Self {
        LocalFile {
            path: Field::input_unset(),
            contents: Field::input_unset(),
        }
    }
}

impl LocalFile {
    fn current_path(&self) -> Result<PathBuf> {
        current(&self.path, "path")
    }

    async fn write(&self) -> Result<()> {
        let path: PathBuf = wanted(&self.path, "path")?;
        let contents: String = wanted(&self.contents, "contents")?;
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Could not write file {}", path.display()))
    }
}

impl Resource for LocalFile {
    fn type_name(&self) -> &'static str {
        "file"
    }

    fn name(&self) -> Option<String> {
        self.path.any_as().ok().flatten()
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .field("path", FieldMetadata::default().force_new())
            .field("contents", FieldMetadata::default().default_value(""))
    }

    fn fields_mut(&mut self) -> Vec<(&'static str, &mut Field)> {
        vec![("path", &mut self.path), ("contents", &mut self.contents)]
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
impl Cud for LocalFile {
    async fn create(&self, _meta: &()) -> Result<()> {
        self.write().await
    }

    async fn update(&self, _meta: &()) -> Result<()> {
        self.write().await
    }

    async fn delete(&self, _meta: &()) -> Result<()> {
        let path = self.current_path()?;
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("Could not remove file {}", path.display()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Reader for LocalFile {
    /// A file that went missing reads as `null`, so that it gets written
    /// again.
    async fn read(&self, _meta: &()) -> Result<()> {
        let Some(path) = self.path.current_as::<PathBuf>()? else {
            return Ok(());
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => self.contents.set_current(contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.contents.set_current(Value::Null),
            Err(e) => {
                return Err(e).with_context(|| format!("Could not read file {}", path.display()))
            }
        }
        Ok(())
    }
}

impl Merger for LocalFile {
    fn unique_id(&self) -> String {
        match self.current_path() {
            Ok(path) => std::path::absolute(&path)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned(),
            Err(_) => String::new(),
        }
    }
}

/// A random alphanumeric string, generated once.
pub struct RandomString {
    length: Field,
    value: Field,
}

impl Default for RandomString {
    fn default() -> Self {
        RandomString {
            length: Field::input_unset(),
            value: Field::output(),
        }
    }
}

fn generate(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

impl Resource for RandomString {
    fn type_name(&self) -> &'static str {
        "random_string"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .field(
                "length",
                FieldMetadata::default().force_new().default_value(16),
            )
            .field("value", FieldMetadata::default().computed())
    }

    fn fields_mut(&mut self) -> Vec<(&'static str, &mut Field)> {
        vec![("length", &mut self.length), ("value", &mut self.value)]
    }

    fn cud(&self) -> Option<&dyn Cud> {
        Some(self)
    }
}

#[async_trait]
impl Cud for RandomString {
    async fn create(&self, _meta: &()) -> Result<()> {
        let length: usize = wanted(&self.length, "length")?;
        self.value.set_current(generate(length));
        Ok(())
    }

    // length is force-new, so there is never anything to update in place
    async fn update(&self, _meta: &()) -> Result<()> {
        Ok(())
    }

    // nothing exists outside the state
    async fn delete(&self, _meta: &()) -> Result<()> {
        Ok(())
    }
}

/// Runs a command whenever its inputs change, and records what it printed.
pub struct Exec {
    command: Field,
    args: Field,
    stdout: Field,
}

impl Default for Exec {
    fn default() -> Self {
        Exec {
            command: Field::input_unset(),
            args: Field::input_unset(),
            stdout: Field::output(),
        }
    }
}

impl Resource for Exec {
    fn type_name(&self) -> &'static str {
        "exec"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .field("args", FieldMetadata::default().default_value(json!([])))
            .field("stdout", FieldMetadata::default().computed())
    }

    fn fields_mut(&mut self) -> Vec<(&'static str, &mut Field)> {
        vec![
            ("command", &mut self.command),
            ("args", &mut self.args),
            ("stdout", &mut self.stdout),
        ]
    }

    fn processor(&self) -> Option<&dyn Processor> {
        Some(self)
    }
}

#[async_trait]
impl Processor for Exec {
    async fn process(&self, _meta: &()) -> Result<()> {
        let command: String = wanted(&self.command, "command")?;
        let args: Vec<String> = wanted(&self.args, "args")?;
        let output = tokio::process::Command::new(&command)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("Could not run {}", command))?;
        if !output.status.success() {
            bail!("{} failed with {}", command, output.status);
        }
        let stdout = String::from_utf8(output.stdout)
            .with_context(|| format!("{} printed invalid UTF-8", command))?;
        self.stdout.set_current(stdout);
        Ok(())
    }
}

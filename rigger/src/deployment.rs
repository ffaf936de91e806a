//! Deployment documents: which resources to manage, with which inputs.
//!
//! ```json
//! { "resources": [
//!     { "id": "password", "type": "random_string", "inputs": { "length": 24 } },
//!     { "id": "config", "type": "file", "inputs": {
//!         "path": "app.conf",
//!         "contents": { "$format": ["password={}", { "$ref": "password.value" }] } } }
//! ] }
//! ```
//!
//! An input that is a `$ref` to a field of another resource *is* that field,
//! so the resource picks up the other resource's value once it is known.
//! A `$ref` nested in a larger value refers to the field's value.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use anyhow::{bail, Context as _, Result};
use rigger_registry::{Field, Registry, ResourceId, Source};
use serde::Deserialize;
use serde_json::Value;

use crate::local;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Deployment {
    #[serde(default)]
    pub resources: Vec<Declaration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Declaration {
    #[serde(default)]
    pub namespace: String,
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

/// `(namespace, id)`
type Key = (String, String);

impl Declaration {
    fn key(&self) -> Key {
        (self.namespace.clone(), self.id.clone())
    }
}

/// `[namespace/]id.field`. The namespace defaults to that of the declaring
/// resource.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    namespace: String,
    id: String,
    field: String,
}

impl Reference {
    fn parse(s: &str, namespace: &str) -> Result<Reference> {
        let malformed = || format!("invalid reference {:?}, expected [namespace/]id.field", s);
        let (path, field) = s.rsplit_once('.').with_context(malformed)?;
        let (namespace, id) = path.split_once('/').unwrap_or((namespace, path));
        if id.is_empty() || field.is_empty() {
            bail!(malformed());
        }
        Ok(Reference {
            namespace: namespace.to_owned(),
            id: id.to_owned(),
            field: field.to_owned(),
        })
    }

    fn key(&self) -> Key {
        (self.namespace.clone(), self.id.clone())
    }
}

enum Directive<'a> {
    Ref(&'a str),
    Format(&'a [Value]),
}

fn directive(value: &Value) -> Result<Option<Directive<'_>>> {
    let Value::Object(map) = value else {
        return Ok(None);
    };
    let mut entries = map.iter();
    let (Some((key, arg)), None) = (entries.next(), entries.next()) else {
        return Ok(None);
    };
    match (key.as_str(), arg) {
        ("$ref", Value::String(s)) => Ok(Some(Directive::Ref(s))),
        ("$format", Value::Array(items)) if matches!(items.first(), Some(Value::String(_))) => {
            Ok(Some(Directive::Format(items)))
        }
        ("$ref", _) => bail!("$ref takes a string"),
        ("$format", _) => bail!("$format takes a template string followed by its arguments"),
        _ => Ok(None),
    }
}

fn collect_references(value: &Value, namespace: &str, out: &mut Vec<Reference>) -> Result<()> {
    match directive(value)? {
        Some(Directive::Ref(s)) => out.push(Reference::parse(s, namespace)?),
        Some(Directive::Format(items)) => {
            for item in &items[1..] {
                collect_references(item, namespace, out)?;
            }
        }
        None => match value {
            Value::Object(map) => {
                for v in map.values() {
                    collect_references(v, namespace, out)?;
                }
            }
            Value::Array(items) => {
                for v in items {
                    collect_references(v, namespace, out)?;
                }
            }
            _ => {}
        },
    }
    Ok(())
}

impl Deployment {
    pub fn read(path: &Path) -> Result<Deployment> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Could not read deployment {}", path.display()))?;
        Self::parse(&bytes).with_context(|| format!("Invalid deployment {}", path.display()))
    }

    pub fn parse(bytes: &[u8]) -> Result<Deployment> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Declare every resource in `registry`. Resources are registered after
    /// the resources they refer to.
    pub fn declare(&self, registry: &mut Registry) -> Result<()> {
        let mut by_key: BTreeMap<Key, &Declaration> = BTreeMap::new();
        for decl in &self.resources {
            if by_key.insert(decl.key(), decl).is_some() {
                bail!("resource {:?} is declared twice", decl.id);
            }
        }

        let mut refs: BTreeMap<Key, Vec<Reference>> = BTreeMap::new();
        for decl in &self.resources {
            let mut out = Vec::new();
            for (name, value) in &decl.inputs {
                collect_references(value, &decl.namespace, &mut out)
                    .with_context(|| format!("in input {} of {}", name, decl.id))?;
            }
            refs.insert(decl.key(), out);
        }

        let mut order = Vec::new();
        let mut done = BTreeSet::new();
        for decl in &self.resources {
            visit(&decl.key(), &by_key, &refs, &mut BTreeSet::new(), &mut done, &mut order)?;
        }

        for key in order {
            let decl = by_key[&key];
            let mut inputs = BTreeMap::new();
            for (name, value) in &decl.inputs {
                let field = input_field(value, decl, registry, &by_key)
                    .with_context(|| format!("in input {} of {}", name, decl.id))?;
                inputs.insert(name.clone(), field);
            }
            let resource = local::build(&decl.type_, inputs)
                .with_context(|| format!("Could not declare {}", decl.id))?;
            registry.register_boxed(decl.namespace.clone(), decl.id.clone(), resource)?;
        }
        Ok(())
    }
}

/// Depth first: dependencies of `key` end up in `order` before `key`.
fn visit(
    key: &Key,
    by_key: &BTreeMap<Key, &Declaration>,
    refs: &BTreeMap<Key, Vec<Reference>>,
    visiting: &mut BTreeSet<Key>,
    done: &mut BTreeSet<Key>,
    order: &mut Vec<Key>,
) -> Result<()> {
    if done.contains(key) {
        return Ok(());
    }
    if !visiting.insert(key.clone()) {
        bail!("reference cycle involving resource {:?}", key.1);
    }
    for r in &refs[key] {
        let target = r.key();
        if !by_key.contains_key(&target) {
            bail!("resource {:?} refers to unknown resource {:?}", key.1, r.id);
        }
        visit(&target, by_key, refs, visiting, done, order)?;
    }
    visiting.remove(key);
    done.insert(key.clone());
    order.push(key.clone());
    Ok(())
}

fn lookup(
    r: &Reference,
    registry: &Registry,
    by_key: &BTreeMap<Key, &Declaration>,
) -> Result<Field> {
    let decl = by_key
        .get(&r.key())
        .with_context(|| format!("unknown resource {:?}", r.id))?;
    let id = ResourceId::new(&r.namespace, &decl.type_, &r.id);
    let w = registry
        .get(&id)
        .with_context(|| format!("resource {} is not registered yet", id))?;
    w.field(&r.field)
        .cloned()
        .with_context(|| format!("resource {} has no field {}", id, r.field))
}

fn input_field(
    value: &Value,
    decl: &Declaration,
    registry: &Registry,
    by_key: &BTreeMap<Key, &Declaration>,
) -> Result<Field> {
    if let Some(Directive::Ref(s)) = directive(value)? {
        return lookup(&Reference::parse(s, &decl.namespace)?, registry, by_key);
    }
    Ok(Field::from_source(source(value, decl, registry, by_key)?))
}

fn source(
    value: &Value,
    decl: &Declaration,
    registry: &Registry,
    by_key: &BTreeMap<Key, &Declaration>,
) -> Result<Source> {
    let nested = |v: &Value| source(v, decl, registry, by_key);
    Ok(match directive(value)? {
        Some(Directive::Ref(s)) => Source::Ref(lookup(
            &Reference::parse(s, &decl.namespace)?,
            registry,
            by_key,
        )?),
        Some(Directive::Format(items)) => Source::Format {
            template: items[0].as_str().unwrap_or_default().to_owned(),
            args: items[1..].iter().map(nested).collect::<Result<_>>()?,
        },
        None => match value {
            Value::Object(map) => Source::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), nested(v)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Array(items) => Source::Array(items.iter().map(nested).collect::<Result<_>>()?),
            v => Source::Literal(v.clone()),
        },
    })
}

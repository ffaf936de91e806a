//! Dual-value field cells with change tracking.
//!
//! A [`Field`] holds the value a resource has (the *current* value, as last
//! observed or applied) and the value it is supposed to have (the *wanted*
//! value, as declared by the caller). Both are independently definable.
//!
//! Fields are handles: cloning a `Field` does not copy it, the clone shares
//! the cell and the [`FieldId`]. The registry uses that identity to discover
//! that one resource consumes a field owned by another resource.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::{Context as _, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

/// Opaque identity of a field, assigned when the field is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldId(u64);

impl FieldId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        FieldId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field#{}", self.0)
    }
}

/// Where a wanted value comes from.
///
/// A source resolves to `None` as long as any part of it is undefined, for
/// instance a reference to an output that has not been produced yet.
#[derive(Debug, Clone)]
pub enum Source {
    /// A plain value.
    Literal(Value),
    /// The current value of another field. This is what a proxy field wants.
    Forward(Field),
    /// The value of another field: its current value if defined, otherwise
    /// its wanted value.
    Ref(Field),
    Map(BTreeMap<String, Source>),
    Array(Vec<Source>),
    /// `{}` placeholders in `template` are replaced by the resolved `args`,
    /// in order. Strings are inserted verbatim, other values as JSON.
    Format { template: String, args: Vec<Source> },
}

impl Source {
    pub fn resolve(&self) -> Option<Value> {
        match self {
            Source::Literal(value) => Some(value.clone()),
            Source::Forward(origin) => origin.lookup_current(),
            Source::Ref(field) => field.any(),
            Source::Map(entries) => entries
                .iter()
                .map(|(k, s)| s.resolve().map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<String, Value>>>()
                .map(Value::Object),
            Source::Array(items) => items
                .iter()
                .map(Source::resolve)
                .collect::<Option<Vec<Value>>>()
                .map(Value::Array),
            Source::Format { template, args } => {
                let args = args
                    .iter()
                    .map(Source::resolve)
                    .collect::<Option<Vec<Value>>>()?;
                Some(Value::String(format_template(template, &args)))
            }
        }
    }

    /// All fields referenced by this source, depth first.
    pub fn referenced_fields(&self) -> Vec<Field> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<Field>) {
        match self {
            Source::Literal(_) => {}
            Source::Forward(field) | Source::Ref(field) => out.push(field.clone()),
            Source::Map(entries) => entries.values().for_each(|s| s.collect_fields(out)),
            Source::Array(items) => items.iter().for_each(|s| s.collect_fields(out)),
            Source::Format { args, .. } => args.iter().for_each(|s| s.collect_fields(out)),
        }
    }
}

fn format_template(template: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match args.next() {
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => out.push_str("{}"),
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

impl From<Value> for Source {
    fn from(value: Value) -> Self {
        Source::Literal(value)
    }
}
impl From<&str> for Source {
    fn from(value: &str) -> Self {
        Source::Literal(Value::String(value.to_owned()))
    }
}
impl From<String> for Source {
    fn from(value: String) -> Self {
        Source::Literal(Value::String(value))
    }
}
impl From<bool> for Source {
    fn from(value: bool) -> Self {
        Source::Literal(Value::Bool(value))
    }
}
impl From<i64> for Source {
    fn from(value: i64) -> Self {
        Source::Literal(Value::from(value))
    }
}
impl From<u64> for Source {
    fn from(value: u64) -> Self {
        Source::Literal(Value::from(value))
    }
}
impl From<f64> for Source {
    fn from(value: f64) -> Self {
        Source::Literal(Value::from(value))
    }
}
/// A field used as a source is a nested reference to it.
impl From<Field> for Source {
    fn from(field: Field) -> Self {
        Source::Ref(field)
    }
}
impl From<&Field> for Source {
    fn from(field: &Field) -> Self {
        Source::Ref(field.clone())
    }
}

#[derive(Default)]
struct FieldCell {
    current: Option<Value>,
    wanted: Option<Source>,
}

struct FieldInner {
    id: FieldId,
    output: bool,
    proxy: bool,
    cell: Mutex<FieldCell>,
}

/// A current/wanted value cell. See the [module documentation](self).
#[derive(Clone)]
pub struct Field {
    inner: Arc<FieldInner>,
}

impl Field {
    fn new(output: bool, proxy: bool, wanted: Option<Source>) -> Field {
        Field {
            inner: Arc::new(FieldInner {
                id: FieldId::next(),
                output,
                proxy,
                cell: Mutex::new(FieldCell {
                    current: None,
                    wanted,
                }),
            }),
        }
    }

    /// An input field with a wanted value.
    pub fn input(wanted: impl Into<Source>) -> Field {
        Field::new(false, false, Some(wanted.into()))
    }

    /// An input field without a wanted value. Schema defaults apply to it.
    pub fn input_unset() -> Field {
        Field::new(false, false, None)
    }

    /// An output field. Only the resource implementation sets its value.
    pub fn output() -> Field {
        Field::new(true, false, None)
    }

    pub fn from_source(source: Source) -> Field {
        Field::input(source)
    }

    pub fn map<K, S>(entries: impl IntoIterator<Item = (K, S)>) -> Field
    where
        K: Into<String>,
        S: Into<Source>,
    {
        Field::input(Source::Map(
            entries
                .into_iter()
                .map(|(k, s)| (k.into(), s.into()))
                .collect(),
        ))
    }

    pub fn array<S: Into<Source>>(items: impl IntoIterator<Item = S>) -> Field {
        Field::input(Source::Array(items.into_iter().map(Into::into).collect()))
    }

    pub fn format<S: Into<Source>>(
        template: impl Into<String>,
        args: impl IntoIterator<Item = S>,
    ) -> Field {
        Field::input(Source::Format {
            template: template.into(),
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// A proxy field: its wanted value is the origin's current value.
    pub(crate) fn proxy(origin: &Field) -> Field {
        Field::new(false, true, Some(Source::Forward(origin.clone())))
    }

    pub fn id(&self) -> FieldId {
        self.inner.id
    }

    pub fn is_output(&self) -> bool {
        self.inner.output
    }

    pub fn is_proxy(&self) -> bool {
        self.inner.proxy
    }

    fn cell(&self) -> MutexGuard<'_, FieldCell> {
        self.inner.cell.lock().expect("mutex poisoned")
    }

    pub fn set_current(&self, value: impl Into<Value>) {
        self.cell().current = Some(value.into());
    }

    pub fn set_current_from<T: Serialize>(&self, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).context("serializing field value")?;
        self.set_current(value);
        Ok(())
    }

    pub fn unset_current(&self) {
        self.cell().current = None;
    }

    pub fn lookup_current(&self) -> Option<Value> {
        self.cell().current.clone()
    }

    pub fn is_current_defined(&self) -> bool {
        self.cell().current.is_some()
    }

    pub fn current_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.lookup_current()
            .map(|v| serde_json::from_value(v).context("decoding current field value"))
            .transpose()
    }

    /// Set the wanted value. Output fields have no wanted value, so this is
    /// ignored for them.
    pub fn set_wanted(&self, wanted: impl Into<Source>) {
        if self.is_output() {
            tracing::warn!(field = %self.id(), "ignoring wanted value for output field");
            return;
        }
        self.cell().wanted = Some(wanted.into());
    }

    pub fn unset_wanted(&self) {
        self.cell().wanted = None;
    }

    pub fn wanted_source(&self) -> Option<Source> {
        self.cell().wanted.clone()
    }

    pub fn lookup_wanted(&self) -> Option<Value> {
        // Clone the source first; resolving it may lock other fields.
        let source = self.wanted_source()?;
        source.resolve()
    }

    pub fn is_wanted_defined(&self) -> bool {
        self.cell().wanted.is_some()
    }

    pub fn wanted_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.lookup_wanted()
            .map(|v| serde_json::from_value(v).context("decoding wanted field value"))
            .transpose()
    }

    /// The current value if defined, otherwise the wanted value.
    pub fn any(&self) -> Option<Value> {
        self.lookup_current().or_else(|| self.lookup_wanted())
    }

    pub fn any_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.any()
            .map(|v| serde_json::from_value(v).context("decoding field value"))
            .transpose()
    }

    /// True only when both values are defined and differ.
    pub fn is_changed(&self) -> bool {
        match (self.lookup_current(), self.lookup_wanted()) {
            (Some(current), Some(wanted)) => current != wanted,
            _ => false,
        }
    }

    /// Commit the wanted value after a successful apply.
    pub fn set_wanted_as_current(&self) {
        if self.is_output() {
            return;
        }
        if let Some(wanted) = self.lookup_wanted() {
            self.cell().current = Some(wanted);
        }
    }

    /// The value persisted for this field.
    pub fn serialize_value(&self) -> Option<Value> {
        self.lookup_current()
    }

    /// Fields nested in the wanted value, flattened.
    pub fn field_dependencies(&self) -> Vec<Field> {
        self.wanted_source()
            .map(|s| s.referenced_fields())
            .unwrap_or_default()
    }

    pub(crate) fn same_as(&self, other: &Field) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell();
        f.debug_struct("Field")
            .field("id", &self.inner.id)
            .field("output", &self.inner.output)
            .field("proxy", &self.inner.proxy)
            .field("current", &cell.current)
            .field("wanted_defined", &cell.wanted.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn changed_only_when_both_defined_and_different() {
        let f = Field::input("a");
        assert!(!f.is_changed());
        f.set_current("a");
        assert!(!f.is_changed());
        f.set_current("b");
        assert!(f.is_changed());

        let unset = Field::input_unset();
        unset.set_current("x");
        assert!(!unset.is_changed());
    }

    #[test]
    fn output_field_never_has_wanted() {
        let f = Field::output();
        f.set_wanted("nope");
        assert!(!f.is_wanted_defined());
        assert_eq!(f.lookup_wanted(), None);
        f.set_current("generated");
        assert!(!f.is_changed());
        assert_eq!(f.any(), Some(json!("generated")));
    }

    #[test]
    fn clones_share_identity_and_value() {
        let f = Field::output();
        let g = f.clone();
        assert_eq!(f.id(), g.id());
        assert!(f.same_as(&g));
        g.set_current(3);
        assert_eq!(f.lookup_current(), Some(json!(3)));
        assert_ne!(Field::output().id(), f.id());
    }

    #[test]
    fn composite_values_compare_structurally() {
        let m = Field::map([("b", Source::from(2i64)), ("a", Source::from("x"))]);
        m.set_current(json!({"a": "x", "b": 2}));
        assert!(!m.is_changed());
        m.set_current(json!({"a": "x", "b": 3}));
        assert!(m.is_changed());

        let arr = Field::array(["x", "y"]);
        arr.set_current(json!(["x", "y"]));
        assert!(!arr.is_changed());
        arr.set_current(json!(["y", "x"]));
        assert!(arr.is_changed());
    }

    #[test]
    fn nested_reference_resolves_once_defined() {
        let upstream = Field::output();
        let m = Field::map([
            ("url", Source::from(&upstream)),
            ("mode", Source::from("prod")),
        ]);
        assert_eq!(m.lookup_wanted(), None);
        upstream.set_current("https://example.test");
        assert_eq!(
            m.lookup_wanted(),
            Some(json!({"url": "https://example.test", "mode": "prod"}))
        );
        let deps = m.field_dependencies();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id(), upstream.id());
    }

    #[test]
    fn format_substitutes_in_order() {
        let host = Field::input("db.local");
        let f = Field::format("postgres://{}:{}/app", [Source::from(&host), Source::from(5432i64)]);
        assert_eq!(f.lookup_wanted(), Some(json!("postgres://db.local:5432/app")));
        assert_eq!(format_template("{} and {}", &[json!("one")]), "one and {}");
        assert_eq!(f.field_dependencies().len(), 1);
    }

    #[test]
    fn proxy_forwards_origin_current() {
        let origin = Field::output();
        let proxy = Field::proxy(&origin);
        assert!(proxy.is_proxy());
        assert_eq!(proxy.lookup_wanted(), None);

        origin.set_current("id-1");
        proxy.set_current("id-0");
        assert_eq!(proxy.lookup_wanted(), Some(json!("id-1")));
        assert!(proxy.is_changed());

        proxy.set_wanted_as_current();
        assert_eq!(proxy.lookup_current(), Some(json!("id-1")));
        assert!(!proxy.is_changed());
    }

    #[test]
    fn commit_copies_wanted_into_current() {
        let f = Field::input(json!({"k": [1, 2]}));
        f.set_wanted_as_current();
        assert_eq!(f.serialize_value(), Some(json!({"k": [1, 2]})));
        let typed: Option<BTreeMap<String, Vec<u8>>> = f.current_as().unwrap();
        assert_eq!(typed.unwrap()["k"], vec![1, 2]);
    }
}

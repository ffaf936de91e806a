//! Statically declared field metadata, one [`Schema`] per resource type.

use std::collections::BTreeMap;

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMetadata {
    /// Excluded from diffing and from the persisted state.
    pub ignored: bool,
    /// Any change to the field forces the resource to be recreated.
    pub force_new: bool,
    /// Produced by the resource implementation.
    pub computed: bool,
    /// Wanted value applied at registration when the field has none.
    pub default: Option<Value>,
}

impl FieldMetadata {
    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// The declared fields of a resource type.
///
/// Fields a resource exposes without declaring them here get default
/// metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: BTreeMap<String, FieldMetadata>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, metadata: FieldMetadata) -> Self {
        self.fields.insert(name.into(), metadata);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.get(name)
    }

    pub fn metadata(&self, name: &str) -> FieldMetadata {
        self.fields.get(name).cloned().unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }
}

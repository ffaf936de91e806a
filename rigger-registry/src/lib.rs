//! The reconciliation core of a resource plugin.
//!
//! Resources are declared into a [`Registry`], loaded against the state
//! persisted by the previous run, diffed, and applied concurrently in
//! dependency order. Dependencies are not declared explicitly; they follow
//! from resources sharing [`Field`]s.

pub mod apply;
pub mod control;
pub mod diff;
pub mod error;
pub mod field;
pub mod registry;
pub mod resource;
pub mod schema;

#[cfg(test)]
mod testing;

pub use apply::ApplyAction;
pub use diff::{Diff, DiffType};
pub use error::RegistryError;
pub use field::{Field, FieldId, Source};
pub use registry::{LoadOptions, Registry, RegistryOptions, ResourceSerialized};
pub use resource::{
    Cud, DiffCalculator, FieldEntry, Initer, Merger, Processor, Reader, Resource, ResourceId,
    ResourceWrapper, State,
};
pub use schema::{FieldMetadata, Schema};

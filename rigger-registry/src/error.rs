use thiserror::Error;

use crate::resource::ResourceId;

/// Configuration and dependency graph errors. Operation errors of resource
/// implementations are reported as [`anyhow::Error`] instead.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("resource {0} is already registered")]
    DuplicateResource(ResourceId),

    #[error("persisted resource {0} has a type that is not registered")]
    UnknownResourceType(ResourceId),

    #[error("schema of resource type {type_} declares field {field}, which the resource does not have")]
    UnknownField { type_: String, field: String },

    #[error("persisted resource {resource} depends on {dependency}, which is not in the state")]
    MissingDependency {
        resource: ResourceId,
        dependency: ResourceId,
    },

    #[error("resources {first} and {second} both have unique id {unique_id:?} (registered: {registered})")]
    UniqueIdConflict {
        unique_id: String,
        first: ResourceId,
        second: ResourceId,
        registered: bool,
    },

    #[error("resources cannot be registered after the state was loaded")]
    AlreadyLoaded,

    #[error("could not parse state")]
    InvalidState(#[source] serde_json::Error),

    #[error("diff refers to resource {0}, which is not in the registry")]
    UnknownResource(ResourceId),
}

//! Entity definitions and their translation into engine models.

pub mod builder;
pub mod catalog;
pub mod definition;

pub use builder::{SchemaRegistry, column_type_for};
pub use catalog::{Catalog, CatalogBuilder};
pub use definition::{
    BackendOverride, EntityDefinition, EntitySettings, PropertyDefinition, PropertyType,
    RelationDefinition, RelationKind,
};

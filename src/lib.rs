//! Repository layer that accepts LoopBack-style filters (`where`, `fields`,
//! `order`, `limit`, `offset`, `include`) and runs them on a relational
//! database through sqlx.
//!
//! The moving parts:
//!
//! - [`db::DataSource`] owns the pool for one configured database.
//! - [`schema::Catalog`] holds the declarative entity definitions;
//!   [`schema::SchemaRegistry`] turns them into engine models per connection.
//! - [`filter`] compiles abstract filters into engine descriptors.
//! - [`orm`] renders and executes SQL and resolves native includes.
//! - [`repository::Repository`] is the CRUD facade, including manual
//!   resolution of references-many relations.

pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod orm;
pub mod repository;
pub mod schema;

pub use config::DataSourceConfig;
pub use db::{Connector, DataSource, Dialect};
pub use error::{Error, Result};
pub use filter::{Fields, Filter, Inclusion, Order, Where};
pub use orm::{DataObject, QueryOptions};
pub use repository::{Count, CrudRepository, Entity, Repository, SyncOptions};
pub use schema::{
    Catalog, EntityDefinition, PropertyDefinition, PropertyType, RelationDefinition,
    SchemaRegistry,
};

//! Error taxonomy shared by every layer of the crate.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The connector id in the data source config is not one we map to a dialect.
    #[error("Specified connector {0} is not supported.")]
    UnsupportedConnector(String),

    #[error("Invalid data source configuration: {0}")]
    Config(String),

    /// The data source was never connected, or the connection attempt failed
    /// during `init()` and was only logged.
    #[error("Data source \"{0}\" has no initialized connection")]
    ConnectionNotInitialized(String),

    #[error("There is no equivalent operator for \"{0}\"")]
    UnsupportedOperator(String),

    #[error("Unhandled type \"{kind}\" for property \"{property}\"")]
    UnhandledType { property: String, kind: String },

    #[error("Unknown entity \"{0}\"")]
    UnknownEntity(String),

    #[error("Entity \"{entity}\" has no property \"{attribute}\"")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("Entity \"{entity}\" has no relation \"{relation}\"")]
    UnknownRelation { entity: String, relation: String },

    #[error("Entity \"{0}\" does not define an id property")]
    MissingIdProperty(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Invalid Argument: {0}")]
    InvalidArgument(String),

    #[error("Entity not found: {entity} with id {id}")]
    EntityNotFound { entity: String, id: String },

    /// The engine rejected an insert or update (constraint violation, type mismatch).
    #[error("Write to \"{entity}\" failed: {source}")]
    Write {
        entity: String,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for the not-found kind callers map onto a "404".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::EntityNotFound { .. })
    }

    pub(crate) fn not_found(entity: &str, id: &serde_json::Value) -> Self {
        let id = match id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Error::EntityNotFound {
            entity: entity.to_string(),
            id,
        }
    }
}

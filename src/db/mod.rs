//! Data source: owns the connection pool for one database and the schema
//! registry built on top of it.

pub mod connector;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::{Span, debug, error, info};

use crate::config::DataSourceConfig;
use crate::error::{Error, Result};
use crate::orm::Executor;
use crate::schema::SchemaRegistry;

pub use connector::{Connector, Dialect};

/// Default pool size when the config does not set one
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

struct Connection {
    pool: AnyPool,
    dialect: Dialect,
}

/// Connection wrapper for one configured database.
///
/// Construction only validates the configuration. [`init`](Self::init)
/// connects; a failed connection attempt is logged and leaves the data source
/// unconnected, after which every operation needing the pool fails with
/// [`Error::ConnectionNotInitialized`].
pub struct DataSource {
    config: DataSourceConfig,
    connector: Option<Connector>,
    connection: RwLock<Option<Connection>>,
    schemas: Arc<SchemaRegistry>,
    span: Span,
}

impl DataSource {
    /// Create a data source, rejecting unsupported connector ids.
    pub fn new(config: DataSourceConfig) -> Result<Self> {
        let connector = config
            .connector
            .as_deref()
            .map(str::parse::<Connector>)
            .transpose()?;

        let span = tracing::info_span!("datasource", name = %config.name());

        Ok(Self {
            config,
            connector,
            connection: RwLock::new(None),
            schemas: Arc::new(SchemaRegistry::new()),
            span,
        })
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    pub fn connector(&self) -> Option<Connector> {
        self.connector
    }

    /// Span every component built on this data source logs under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Dialect from the connector mapping, else from an explicit `dialect` value.
    pub fn dialect(&self) -> Result<Dialect> {
        if let Some(connector) = self.connector {
            return Ok(connector.dialect());
        }
        match self.config.dialect.as_deref() {
            Some(raw) => Dialect::parse(raw)
                .ok_or_else(|| Error::Config(format!("unknown dialect \"{}\"", raw))),
            None => Err(Error::Config(format!(
                "data source \"{}\" needs either a connector or a dialect",
                self.name()
            ))),
        }
    }

    /// Connect and authenticate. Does nothing when already connected.
    ///
    /// Only a configuration that names no usable dialect is returned as an
    /// error; connection failures are logged and swallowed.
    pub async fn init(&self) -> Result<()> {
        if self.is_connected() {
            debug!(parent: &self.span, "init() called on an open connection, keeping it");
            return Ok(());
        }

        let dialect = self.dialect()?;

        if !dialect.has_driver() {
            error!(
                parent: &self.span,
                dialect = %dialect,
                "Unable to connect to the database: no driver available for dialect"
            );
            return Ok(());
        }

        sqlx::any::install_default_drivers();

        let url = self.config.connection_url(dialect);
        let max_connections = self
            .config
            .max_connections
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let mut options = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10));

        // Every new SQLite memory connection is a fresh database, so keep exactly one alive
        if dialect == Dialect::Sqlite && self.config.is_memory_storage() {
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        match options.connect(&url).await {
            Ok(pool) => {
                info!(
                    parent: &self.span,
                    dialect = %dialect,
                    "Connection has been established successfully"
                );
                *self.connection.write() = Some(Connection { pool, dialect });
            }
            Err(e) => {
                error!(
                    parent: &self.span,
                    dialect = %dialect,
                    error = %e,
                    "Unable to connect to the database"
                );
            }
        }

        Ok(())
    }

    /// Close the pool and forget every schema built on it. Safe to call when
    /// the data source never connected.
    pub async fn stop(&self) {
        let connection = self.connection.write().take();
        self.schemas.clear();

        match connection {
            Some(connection) => {
                connection.pool.close().await;
                info!(parent: &self.span, "Connection closed");
            }
            None => {
                debug!(parent: &self.span, "stop() called without an open connection");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    /// Access the pool (cheap clone). Valid until [`stop`](Self::stop) is called.
    pub fn pool(&self) -> Result<AnyPool> {
        self.connection
            .read()
            .as_ref()
            .map(|c| c.pool.clone())
            .ok_or_else(|| Error::ConnectionNotInitialized(self.name().to_string()))
    }

    /// Query executor bound to the live connection.
    pub fn executor(&self) -> Result<Executor> {
        let guard = self.connection.read();
        let connection = guard
            .as_ref()
            .ok_or_else(|| Error::ConnectionNotInitialized(self.name().to_string()))?;

        Ok(Executor::new(
            connection.pool.clone(),
            connection.dialect,
            self.schemas.clone(),
            self.span.clone(),
        ))
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name())
            .field("connector", &self.connector)
            .field("connected", &self.is_connected())
            .finish()
    }
}

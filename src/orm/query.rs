//! Query execution against the live pool.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{Any, AnyPool, Row};
use tracing::{Span, debug, error, info};

use super::builder::{SqlBuilder, decode_row};
use super::model::{Attribute, Model};
use super::traits::{Attributes, FindOptions, SqlValue, WhereOptions, ensure_attribute};
use super::{DataObject, include};
use crate::db::Dialect;
use crate::error::{Error, Result};
use crate::schema::SchemaRegistry;

/// Runs engine operations for models registered on one connection.
///
/// Cheap to clone: the pool and registry are shared handles.
#[derive(Clone)]
pub struct Executor {
    pool: AnyPool,
    dialect: Dialect,
    schemas: Arc<SchemaRegistry>,
    span: Span,
}

impl Executor {
    pub fn new(pool: AnyPool, dialect: Dialect, schemas: Arc<SchemaRegistry>, span: Span) -> Self {
        Self {
            pool,
            dialect,
            schemas,
            span,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Select rows and resolve native includes.
    ///
    /// Correlation keys the includes need are added to the projection and
    /// removed again from the returned rows if the caller did not ask for them.
    pub fn find_all<'a>(
        &'a self,
        model: &'a Model,
        options: &'a FindOptions,
    ) -> BoxFuture<'a, Result<Vec<DataObject>>> {
        async move {
            let mut attributes = options.attributes.clone();
            let mut forced = Vec::new();
            for include in &options.include {
                let association = model.association(&include.association).ok_or_else(|| {
                    Error::UnknownRelation {
                        entity: model.name.clone(),
                        relation: include.association.clone(),
                    }
                })?;
                if !ensure_attribute(&mut attributes, &association.source_key) {
                    forced.push(association.source_key.clone());
                }
            }

            let columns = self.columns(model, attributes.as_ref())?;
            let builder = SqlBuilder::select(self.dialect, model, &columns, options)?;
            let mut rows = self.fetch(builder, &columns).await?;

            if !options.include.is_empty() && !rows.is_empty() {
                include::resolve(self, model, &mut rows, &options.include).await?;
            }
            for row in &mut rows {
                for key in &forced {
                    row.remove(key);
                }
            }
            Ok(rows)
        }
        .boxed()
    }

    pub async fn count(&self, model: &Model, where_: &WhereOptions) -> Result<u64> {
        let (sql, values) = SqlBuilder::count(self.dialect, model, where_)?.build();
        debug!(parent: &self.span, sql = %sql, "Executing count query");

        let mut query = sqlx::query::<Any>(&sql);
        for value in &values {
            query = value.bind_to_query(query);
        }
        let row: AnyRow = query.fetch_one(&self.pool).await?;
        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    /// Insert one row and return it as stored (generated id included).
    ///
    /// `fields` whitelists the columns written; everything else in `data` is ignored.
    pub async fn insert(
        &self,
        model: &Model,
        data: &DataObject,
        fields: Option<&Attributes>,
    ) -> Result<DataObject> {
        let allowed = fields.map(|f| f.select(model)).transpose()?;

        let mut values: Vec<(&Attribute, SqlValue)> = Vec::new();
        for attribute in &model.attributes {
            if let Some(allowed) = &allowed {
                if !allowed.iter().any(|a| a.name == attribute.name) {
                    continue;
                }
            }
            let Some(value) = data.get(&attribute.name) else {
                continue;
            };
            if attribute.auto_increment && value.is_null() {
                continue;
            }
            values.push((attribute, SqlValue::from_json(value, attribute.column_type)?));
        }

        let primary_key = model.primary_key();
        let explicit_key = primary_key
            .and_then(|pk| data.get(&pk.name))
            .filter(|v| !v.is_null())
            .cloned();

        let columns: Vec<&Attribute> = model.attributes.iter().collect();
        let (sql, binds) = SqlBuilder::insert(self.dialect, model, values, &columns).build();
        debug!(parent: &self.span, sql = %sql, "Executing insert");

        let mut query = sqlx::query::<Any>(&sql);
        for value in &binds {
            query = value.bind_to_query(query);
        }

        if self.dialect.supports_returning() {
            let row = query
                .fetch_one(&self.pool)
                .await
                .map_err(|e| self.write_failure(model, e))?;
            return decode_row(&row, &columns);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_failure(model, e))?;

        let Some(primary_key) = primary_key else {
            return Ok(data.clone());
        };
        let key = match explicit_key.or_else(|| result.last_insert_id().map(Value::from)) {
            Some(key) => key,
            None => return Ok(data.clone()),
        };

        let options = FindOptions {
            where_: WhereOptions::eq(primary_key.name.clone(), key.clone()),
            limit: Some(1),
            ..Default::default()
        };
        self.find_all(model, &options)
            .await?
            .pop()
            .ok_or_else(|| Error::not_found(&model.name, &key))
    }

    /// Update every row matching `where_` with the known properties in `data`.
    /// Returns the number of rows affected.
    pub async fn update(
        &self,
        model: &Model,
        data: &DataObject,
        where_: &WhereOptions,
    ) -> Result<u64> {
        let mut values: Vec<(&Attribute, SqlValue)> = Vec::new();
        for (name, value) in data {
            match model.attribute(name) {
                Some(attribute) if attribute.auto_increment => {}
                Some(attribute) => {
                    values.push((attribute, SqlValue::from_json(value, attribute.column_type)?))
                }
                None => {
                    debug!(parent: &self.span, entity = %model.name, property = %name, "Ignoring unknown property in update");
                }
            }
        }

        // Nothing to write; report how many rows would have matched
        if values.is_empty() {
            return self.count(model, where_).await;
        }

        let (sql, binds) = SqlBuilder::update(self.dialect, model, values, where_)?.build();
        debug!(parent: &self.span, sql = %sql, "Executing update");

        let mut query = sqlx::query::<Any>(&sql);
        for value in &binds {
            query = value.bind_to_query(query);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_failure(model, e))?;
        Ok(result.rows_affected())
    }

    /// Delete every row matching `where_`. Returns the number of rows removed.
    pub async fn destroy(&self, model: &Model, where_: &WhereOptions) -> Result<u64> {
        let (sql, binds) = SqlBuilder::delete(self.dialect, model, where_)?.build();
        debug!(parent: &self.span, sql = %sql, "Executing delete");

        let mut query = sqlx::query::<Any>(&sql);
        for value in &binds {
            query = value.bind_to_query(query);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_failure(model, e))?;
        Ok(result.rows_affected())
    }

    /// Create the model's table if missing; with `force`, drop it first.
    pub async fn sync(&self, model: &Model, force: bool) -> Result<()> {
        if force {
            let sql = model.drop_table_sql(self.dialect);
            debug!(parent: &self.span, sql = %sql, "Dropping table");
            sqlx::query::<Any>(&sql).execute(&self.pool).await?;
        }

        let sql = model.create_table_sql(self.dialect);
        debug!(parent: &self.span, sql = %sql, "Creating table");
        sqlx::query::<Any>(&sql).execute(&self.pool).await?;

        info!(parent: &self.span, table = %model.table, force, "Table synchronized");
        Ok(())
    }

    fn columns<'m>(
        &self,
        model: &'m Model,
        attributes: Option<&Attributes>,
    ) -> Result<Vec<&'m Attribute>> {
        match attributes {
            Some(attributes) => attributes.select(model),
            None => Ok(model.attributes.iter().collect()),
        }
    }

    async fn fetch(&self, builder: SqlBuilder, columns: &[&Attribute]) -> Result<Vec<DataObject>> {
        let (sql, values) = builder.build();
        debug!(parent: &self.span, sql = %sql, "Executing entity query");

        let mut query = sqlx::query::<Any>(&sql);
        for value in &values {
            query = value.bind_to_query(query);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(|row| decode_row(row, columns)).collect()
    }

    fn write_failure(&self, model: &Model, source: sqlx::Error) -> Error {
        error!(parent: &self.span, entity = %model.name, error = %source, "Write failed");
        Error::Write {
            entity: model.name.clone(),
            source,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("dialect", &self.dialect)
            .finish()
    }
}

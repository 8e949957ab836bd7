//! Repository facade: CRUD over one entity type, driven by abstract filters.

mod references;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Span, debug, error};

use crate::db::DataSource;
use crate::error::{Error, Result};
use crate::filter::{
    Filter, Inclusion, Where, compile_fields, compile_include, compile_order, compile_where,
};
use crate::orm::{DataObject, FindOptions, Model, QueryOptions, WhereOptions};
use crate::schema::{Catalog, EntityDefinition};

use references::{ReferenceIncluder, ensure_nested_reference_columns, ensure_reference_columns};

/// A typed entity stored through a [`Repository`].
///
/// `NAME` must match the entity's name in the [`Catalog`]. Relation fields
/// should be optional so rows without inclusions still deserialize.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Result of count-returning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Drop the table before creating it
    pub force: bool,
}

/// CRUD contract every repository fulfils.
#[async_trait]
pub trait CrudRepository<E: Entity>: Send + Sync {
    async fn create(&self, entity: &E, options: &QueryOptions) -> Result<E>;

    async fn find(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<E>>;

    async fn find_one(&self, filter: &Filter, options: &QueryOptions) -> Result<Option<E>>;

    async fn find_by_id(&self, id: &Value, filter: &Filter, options: &QueryOptions) -> Result<E>;

    async fn exists(&self, id: &Value, options: &QueryOptions) -> Result<bool>;

    async fn update_all(
        &self,
        data: &DataObject,
        where_: Option<&Where>,
        options: &QueryOptions,
    ) -> Result<Count>;

    async fn update_by_id(&self, id: &Value, data: &DataObject, options: &QueryOptions)
    -> Result<()>;

    async fn replace_by_id(&self, id: &Value, data: &DataObject, options: &QueryOptions)
    -> Result<()>;

    async fn delete_all(&self, where_: Option<&Where>, options: &QueryOptions) -> Result<Count>;

    async fn delete_by_id(&self, id: &Value, options: &QueryOptions) -> Result<()>;

    async fn count(&self, where_: Option<&Where>, options: &QueryOptions) -> Result<Count>;
}

/// Repository for entity type `E` on one data source.
pub struct Repository<E: Entity> {
    datasource: Arc<DataSource>,
    catalog: Arc<Catalog>,
    definition: Arc<EntityDefinition>,
    span: Span,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Repository<E> {
    pub fn new(datasource: Arc<DataSource>, catalog: Arc<Catalog>) -> Result<Self> {
        let definition = catalog.get(E::NAME)?.clone();
        let span = tracing::debug_span!(parent: datasource.span(), "repository", entity = E::NAME);

        Ok(Self {
            datasource,
            catalog,
            definition,
            span,
            _entity: PhantomData,
        })
    }

    pub fn definition(&self) -> &EntityDefinition {
        &self.definition
    }

    pub fn datasource(&self) -> &Arc<DataSource> {
        &self.datasource
    }

    /// Engine model for `E`, registered on first use.
    pub fn schema(&self) -> Result<Arc<Model>> {
        if !self.datasource.is_connected() {
            return Err(Error::ConnectionNotInitialized(
                self.datasource.name().to_string(),
            ));
        }
        self.datasource
            .schemas()
            .get_schema(&self.catalog, E::NAME)
    }

    /// Create the table for `E`.
    pub async fn sync_schema(&self, options: SyncOptions) -> Result<()> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        executor.sync(&model, options.force).await
    }

    /// Like [`find`](CrudRepository::find), returning rows without deserializing them.
    pub async fn find_raw(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<DataObject>> {
        let where_ = compile_where(filter.where_.as_ref())?;
        self.fetch(filter, where_, options).await
    }

    async fn fetch(
        &self,
        filter: &Filter,
        where_: WhereOptions,
        options: &QueryOptions,
    ) -> Result<Vec<DataObject>> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        let inclusions = filter.inclusions();
        self.check_inclusions(&self.definition, inclusions)?;

        let mut find = FindOptions {
            where_,
            attributes: compile_fields(filter.fields.as_ref()),
            order: compile_order(filter.order.as_ref())?,
            limit: filter.limit,
            offset: filter.effective_offset(),
            include: compile_include(Some(inclusions), &model, executor.schemas())?,
        };
        options.apply(&mut find);
        let forced = ensure_reference_columns(&self.definition, inclusions, &mut find.attributes);
        ensure_nested_reference_columns(&self.catalog, &self.definition, inclusions, &mut find.include)?;

        let rows = executor.find_all(&model, &find).await.map_err(|e| {
            debug!(parent: &self.span, error = %e, "Find failed");
            e
        })?;

        let includer = ReferenceIncluder::new(&executor, &self.catalog, &self.span);
        let mut rows = includer.include(rows, &self.definition, inclusions).await?;
        for row in &mut rows {
            for column in &forced {
                row.remove(column);
            }
            self.definition.strip_hidden(row);
        }
        Ok(rows)
    }

    /// Every inclusion must name a relation declared on its entity, at every level.
    fn check_inclusions(&self, entity: &EntityDefinition, inclusions: &[Inclusion]) -> Result<()> {
        for inclusion in inclusions {
            let relation = entity.relation_named(inclusion.relation()).ok_or_else(|| {
                Error::UnknownRelation {
                    entity: entity.name.clone(),
                    relation: inclusion.relation().to_string(),
                }
            })?;
            if let Some(scope) = inclusion.scope() {
                let target = self.catalog.get(&relation.target)?;
                self.check_inclusions(target, scope.inclusions())?;
            }
        }
        Ok(())
    }

    fn id_where(&self, id: &Value) -> Result<WhereOptions> {
        Ok(WhereOptions::eq(self.definition.id_name()?, id.clone()))
    }

    fn hydrate(&self, row: DataObject) -> Result<E> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    fn to_data(&self, entity: &E) -> Result<DataObject> {
        match serde_json::to_value(entity)? {
            Value::Object(data) => Ok(data),
            other => Err(Error::InvalidArgument(format!(
                "{} must serialize to an object, got {}",
                E::NAME,
                other
            ))),
        }
    }
}

#[async_trait]
impl<E: Entity> CrudRepository<E> for Repository<E> {
    async fn create(&self, entity: &E, options: &QueryOptions) -> Result<E> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        let data = self.to_data(entity)?;

        let mut row = executor
            .insert(&model, &data, options.attributes.as_ref())
            .await
            .inspect_err(|e| error!(parent: &self.span, error = %e, "Create failed"))?;
        debug!(parent: &self.span, "Created row");

        self.definition.strip_hidden(&mut row);
        self.hydrate(row)
    }

    async fn find(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<E>> {
        self.find_raw(filter, options)
            .await?
            .into_iter()
            .map(|row| self.hydrate(row))
            .collect()
    }

    async fn find_one(&self, filter: &Filter, options: &QueryOptions) -> Result<Option<E>> {
        let mut filter = filter.clone();
        filter.limit = Some(1);
        let mut rows = self.find_raw(&filter, options).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        self.hydrate(rows.swap_remove(0)).map(Some)
    }

    async fn find_by_id(&self, id: &Value, filter: &Filter, options: &QueryOptions) -> Result<E> {
        let where_ = self.id_where(id)?;
        let mut rows = self.fetch(filter, where_, options).await?;
        if rows.is_empty() {
            return Err(Error::not_found(E::NAME, id));
        }
        self.hydrate(rows.swap_remove(0))
    }

    async fn exists(&self, id: &Value, options: &QueryOptions) -> Result<bool> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        let where_ = options.where_or(self.id_where(id)?);
        Ok(executor.count(&model, &where_).await? > 0)
    }

    async fn update_all(
        &self,
        data: &DataObject,
        where_: Option<&Where>,
        options: &QueryOptions,
    ) -> Result<Count> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        let where_ = options.where_or(compile_where(where_)?);

        let count = executor
            .update(&model, data, &where_)
            .await
            .inspect_err(|e| error!(parent: &self.span, error = %e, "Update failed"))?;
        Ok(Count { count })
    }

    async fn update_by_id(
        &self,
        id: &Value,
        data: &DataObject,
        options: &QueryOptions,
    ) -> Result<()> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        let where_ = options.where_or(self.id_where(id)?);

        let count = executor
            .update(&model, data, &where_)
            .await
            .inspect_err(|e| error!(parent: &self.span, error = %e, "Update failed"))?;
        if count == 0 {
            return Err(Error::not_found(E::NAME, id));
        }
        Ok(())
    }

    async fn replace_by_id(
        &self,
        id: &Value,
        data: &DataObject,
        options: &QueryOptions,
    ) -> Result<()> {
        // The identifier is immutable once created
        let mut data = data.clone();
        data.remove(self.definition.id_name()?);
        self.update_by_id(id, &data, options).await
    }

    async fn delete_all(&self, where_: Option<&Where>, options: &QueryOptions) -> Result<Count> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        let where_ = options.where_or(compile_where(where_)?);

        let count = executor.destroy(&model, &where_).await?;
        Ok(Count { count })
    }

    async fn delete_by_id(&self, id: &Value, options: &QueryOptions) -> Result<()> {
        let id_name = self.definition.id_name()?;
        if id.is_null() {
            return Err(Error::InvalidArgument(format!(
                "{} cannot be undefined",
                id_name
            )));
        }

        let mut where_ = Where::new();
        where_.insert(id_name.to_string(), id.clone());
        let Count { count } = self.delete_all(Some(&where_), options).await?;
        if count == 0 {
            return Err(Error::not_found(E::NAME, id));
        }
        Ok(())
    }

    async fn count(&self, where_: Option<&Where>, options: &QueryOptions) -> Result<Count> {
        let executor = self.datasource.executor()?;
        let model = self.schema()?;
        let where_ = options.where_or(compile_where(where_)?);

        let count = executor.count(&model, &where_).await?;
        Ok(Count { count })
    }
}

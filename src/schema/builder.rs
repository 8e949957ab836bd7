//! Builds engine [`Model`]s from entity definitions.
//!
//! Models are registered once per connection. Building is memoized by entity
//! name: the model is registered before its relation targets are built, so
//! mutually related entities terminate instead of recursing forever.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::catalog::Catalog;
use super::definition::{EntityDefinition, PropertyDefinition, PropertyType, RelationKind};
use crate::error::Result;
use crate::orm::{Association, AssociationKind, Attribute, ColumnType, Model, Through};

/// Models registered on one connection, keyed by entity name.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    models: RwLock<HashMap<String, Arc<Model>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Already registered model, if any.
    pub fn get(&self, name: &str) -> Option<Arc<Model>> {
        self.models.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// Forget every registered model (the connection went away).
    pub fn clear(&self) {
        self.models.write().clear();
    }

    /// Model for `name`, building and registering it (and every entity it
    /// relates to) on first use. If any of them fails to build, nothing
    /// registered by this call is kept.
    pub fn get_schema(&self, catalog: &Catalog, name: &str) -> Result<Arc<Model>> {
        let mut registered = Vec::new();
        let result = self.register(catalog, name, &mut registered);
        if result.is_err() && !registered.is_empty() {
            let mut models = self.models.write();
            for name in &registered {
                models.remove(name);
            }
        }
        result
    }

    fn register(
        &self,
        catalog: &Catalog,
        name: &str,
        registered: &mut Vec<String>,
    ) -> Result<Arc<Model>> {
        if let Some(model) = self.get(name) {
            return Ok(model);
        }

        let definition = catalog.get(name)?;
        let model = Arc::new(build_model(catalog, definition)?);

        {
            let mut models = self.models.write();
            // Another caller may have registered it in the meantime
            if let Some(existing) = models.get(name) {
                return Ok(existing.clone());
            }
            models.insert(name.to_string(), model.clone());
        }
        registered.push(name.to_string());
        debug!(
            entity = %name,
            table = %model.table,
            attributes = model.attributes.len(),
            associations = model.associations.len(),
            "Registered model"
        );

        for relation in &definition.relations {
            if let RelationKind::HasManyThrough { through, .. } = &relation.kind {
                self.register(catalog, through, registered)?;
            }
            self.register(catalog, &relation.target, registered)?;
        }

        Ok(model)
    }
}

/// Engine column type for a property.
pub fn column_type_for(property: &PropertyDefinition) -> ColumnType {
    let column_type = match property.kind {
        PropertyType::String => ColumnType::Text,
        PropertyType::Number => {
            if property.overrides.values().any(|o| o.is_floating_point()) {
                ColumnType::Float
            } else {
                ColumnType::Numeric
            }
        }
        PropertyType::Boolean => ColumnType::Boolean,
        PropertyType::Array => ColumnType::IntegerArray,
        PropertyType::Object => ColumnType::Json,
        PropertyType::Date => ColumnType::Timestamp,
    };

    // Numeric identifiers become auto-incrementing integers
    if property.id && column_type == ColumnType::Numeric {
        ColumnType::Integer
    } else {
        column_type
    }
}

fn build_attribute(property: &PropertyDefinition) -> Attribute {
    let column_type = column_type_for(property);
    Attribute {
        name: property.name.clone(),
        field: property.column_name(),
        column_type,
        primary_key: property.id,
        auto_increment: property.id && column_type == ColumnType::Integer,
        allow_null: !property.required && !property.id,
    }
}

fn build_model(catalog: &Catalog, definition: &EntityDefinition) -> Result<Model> {
    let attributes = definition.properties.iter().map(build_attribute).collect();

    let mut associations = Vec::new();
    for relation in &definition.relations {
        let association = match &relation.kind {
            RelationKind::BelongsTo {
                foreign_key,
                target_key,
            } => Association {
                alias: relation.name.clone(),
                kind: AssociationKind::ManyToOne,
                target: relation.target.clone(),
                source_key: foreign_key.clone(),
                target_key: catalog.target_key(&relation.target, target_key.as_ref())?,
                through: None,
            },
            RelationKind::HasOne {
                foreign_key,
                source_key,
            }
            | RelationKind::HasMany {
                foreign_key,
                source_key,
            } => Association {
                alias: relation.name.clone(),
                kind: if matches!(relation.kind, RelationKind::HasOne { .. }) {
                    AssociationKind::OneToOne
                } else {
                    AssociationKind::OneToMany
                },
                target: relation.target.clone(),
                source_key: match source_key {
                    Some(key) => key.clone(),
                    None => definition.id_name()?.to_string(),
                },
                target_key: foreign_key.clone(),
                through: None,
            },
            RelationKind::HasManyThrough {
                through,
                through_source_key,
                through_target_key,
            } => Association {
                alias: relation.name.clone(),
                kind: AssociationKind::ManyToMany,
                target: relation.target.clone(),
                source_key: definition.id_name()?.to_string(),
                target_key: catalog.target_key(&relation.target, None)?,
                through: Some(Through {
                    model: through.clone(),
                    foreign_key: through_source_key.clone(),
                    other_key: through_target_key.clone(),
                }),
            },
            // Stitched manually by the repository
            RelationKind::ReferencesMany { .. } => continue,
        };
        associations.push(association);
    }

    Ok(Model {
        name: definition.name.clone(),
        table: definition.table_name(),
        attributes,
        associations,
    })
}

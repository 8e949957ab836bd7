//! Registry of every entity definition known to the host.
//!
//! Definitions reference each other by name. All shapes are registered first,
//! then [`CatalogBuilder::build`] resolves every relation target in a second
//! pass, so cyclic definitions need no deferred lookups.

use std::collections::HashMap;
use std::sync::Arc;

use super::definition::{EntityDefinition, PropertyType, RelationKind};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct CatalogBuilder {
    entities: Vec<EntityDefinition>,
}

impl CatalogBuilder {
    pub fn entity(mut self, definition: EntityDefinition) -> Self {
        self.entities.push(definition);
        self
    }

    /// Resolve relation targets and key properties across all registered entities.
    pub fn build(self) -> Result<Catalog> {
        let mut entities: HashMap<String, Arc<EntityDefinition>> = HashMap::new();
        for definition in self.entities {
            if entities.contains_key(&definition.name) {
                return Err(Error::Config(format!(
                    "entity \"{}\" registered twice",
                    definition.name
                )));
            }
            entities.insert(definition.name.clone(), Arc::new(definition));
        }

        let catalog = Catalog { entities };
        for definition in catalog.entities.values() {
            catalog.resolve_relations(definition)?;
        }
        Ok(catalog)
    }
}

/// Immutable set of entity definitions, shared by every repository.
#[derive(Debug, Default)]
pub struct Catalog {
    entities: HashMap<String, Arc<EntityDefinition>>,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    pub fn get(&self, name: &str) -> Result<&Arc<EntityDefinition>> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Catalog without relation resolution, for exercising failures past it.
    #[cfg(test)]
    pub(crate) fn unchecked(definitions: impl IntoIterator<Item = EntityDefinition>) -> Self {
        Self {
            entities: definitions
                .into_iter()
                .map(|d| (d.name.clone(), Arc::new(d)))
                .collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Key on the target side of a relation: explicit key, else the target's id.
    pub fn target_key(&self, target: &str, explicit: Option<&String>) -> Result<String> {
        match explicit {
            Some(key) => Ok(key.clone()),
            None => Ok(self.get(target)?.id_name()?.to_string()),
        }
    }

    fn resolve_relations(&self, source: &EntityDefinition) -> Result<()> {
        for relation in &source.relations {
            let target = self.get(&relation.target)?;

            match &relation.kind {
                RelationKind::BelongsTo { foreign_key, target_key } => {
                    require_property(source, foreign_key)?;
                    require_property(target, &self.target_key(&target.name, target_key.as_ref())?)?;
                }
                RelationKind::HasOne { foreign_key, source_key }
                | RelationKind::HasMany { foreign_key, source_key } => {
                    require_property(target, foreign_key)?;
                    match source_key {
                        Some(key) => {
                            require_property(source, key)?;
                        }
                        None => {
                            source.id_name()?;
                        }
                    }
                }
                RelationKind::HasManyThrough {
                    through,
                    through_source_key,
                    through_target_key,
                } => {
                    let through = self.get(through)?;
                    require_property(through, through_source_key)?;
                    require_property(through, through_target_key)?;
                    source.id_name()?;
                    target.id_name()?;
                }
                RelationKind::ReferencesMany { foreign_keys, target_key } => {
                    let column = require_property(source, foreign_keys)?;
                    if column.kind != PropertyType::Array {
                        return Err(Error::Config(format!(
                            "references-many relation \"{}\" needs array property \"{}\"",
                            relation.name, foreign_keys
                        )));
                    }
                    require_property(target, &self.target_key(&target.name, target_key.as_ref())?)?;
                }
            }
        }
        Ok(())
    }
}

fn require_property<'a>(
    entity: &'a EntityDefinition,
    name: &str,
) -> Result<&'a super::definition::PropertyDefinition> {
    entity
        .property_named(name)
        .ok_or_else(|| Error::UnknownAttribute {
            entity: entity.name.clone(),
            attribute: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::definition::{PropertyDefinition, RelationDefinition};
    use assert_matches::assert_matches;

    fn customer() -> EntityDefinition {
        EntityDefinition::new("Customer")
            .property(PropertyDefinition::new("id", PropertyType::Number).id().generated())
            .relation(RelationDefinition::has_many("orders", "Order", "customerId"))
    }

    fn order() -> EntityDefinition {
        EntityDefinition::new("Order")
            .property(PropertyDefinition::new("id", PropertyType::Number).id().generated())
            .property(PropertyDefinition::new("customerId", PropertyType::Number))
            .relation(RelationDefinition::belongs_to("customer", "Customer", "customerId"))
    }

    #[test]
    fn test_resolves_cyclic_definitions() {
        let catalog = Catalog::builder()
            .entity(customer())
            .entity(order())
            .build()
            .unwrap();
        assert!(catalog.contains("Customer"));
        assert!(catalog.contains("Order"));
        assert_eq!(catalog.target_key("Customer", None).unwrap(), "id");
    }

    #[test]
    fn test_unknown_target() {
        let result = Catalog::builder().entity(customer()).build();
        assert_matches!(result, Err(Error::UnknownEntity(name)) if name == "Order");
    }

    #[test]
    fn test_missing_foreign_key_property() {
        let order = EntityDefinition::new("Order")
            .property(PropertyDefinition::new("id", PropertyType::Number).id());
        let result = Catalog::builder().entity(customer()).entity(order).build();
        assert_matches!(
            result,
            Err(Error::UnknownAttribute { entity, attribute })
                if entity == "Order" && attribute == "customerId"
        );
    }

    #[test]
    fn test_duplicate_registration() {
        let result = Catalog::builder().entity(order()).entity(order()).build();
        assert_matches!(result, Err(Error::Config(_)));
    }
}

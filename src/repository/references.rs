//! Eager loading for references-many relations.
//!
//! A references-many relation stores the target keys in an array column on the
//! source row, which the engine cannot join on. The related rows are fetched
//! here instead: one batched `IN` query per requested relation per level,
//! then stitched onto each parent under the relation name.

use std::collections::HashSet;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{Span, debug};

use crate::error::Result;
use crate::filter::{Inclusion, compile_fields, compile_include, compile_order, compile_where};
use crate::orm::{
    Attributes, DataObject, Executor, FindOptions, IncludeOptions, WhereOptions,
    ensure_attribute, key_form, same_key,
};
use crate::schema::{Catalog, EntityDefinition, PropertyType, RelationDefinition, RelationKind};

/// Make sure the array columns behind every requested references-many
/// relation are selected. Returns the columns that had to be forced in.
pub(crate) fn ensure_reference_columns(
    entity: &EntityDefinition,
    inclusions: &[Inclusion],
    attributes: &mut Option<Attributes>,
) -> Vec<String> {
    let mut forced = Vec::new();
    for inclusion in inclusions {
        let Some(RelationKind::ReferencesMany { foreign_keys, .. }) = entity
            .relation_named(inclusion.relation())
            .map(|r| &r.kind)
        else {
            continue;
        };
        if !ensure_attribute(attributes, foreign_keys) && !forced.contains(foreign_keys) {
            forced.push(foreign_keys.clone());
        }
    }
    forced
}

/// Walk compiled native includes alongside `inclusions` and force the array
/// columns that references-many relations nested in their scopes need.
pub(crate) fn ensure_nested_reference_columns(
    catalog: &Catalog,
    entity: &EntityDefinition,
    inclusions: &[Inclusion],
    includes: &mut [IncludeOptions],
) -> Result<()> {
    for include in includes.iter_mut() {
        let Some(inclusion) = inclusions
            .iter()
            .find(|i| i.relation() == include.association)
        else {
            continue;
        };
        let Some(relation) = entity.relation_named(&include.association) else {
            continue;
        };
        let target = catalog.get(&relation.target)?;
        let nested = inclusion.scope().map(|s| s.inclusions()).unwrap_or(&[]);
        ensure_reference_columns(target, nested, &mut include.attributes);
        ensure_nested_reference_columns(catalog, target, nested, &mut include.include)?;
    }
    Ok(())
}

/// Where the related rows of one parent sat before being detached.
enum Attached {
    Many(usize),
    One,
    Untouched,
}

/// Coerce numeric strings in number-typed key arrays (`["1", "2"]` → `[1, 2]`).
fn normalize_key_arrays(entity: &EntityDefinition, rows: &mut [DataObject]) {
    for relation in entity.references_many() {
        let RelationKind::ReferencesMany { foreign_keys, .. } = &relation.kind else {
            continue;
        };
        let numeric = entity
            .property_named(foreign_keys)
            .is_some_and(|p| p.kind == PropertyType::Array && p.item_type == Some(PropertyType::Number));
        if !numeric {
            continue;
        }

        for row in rows.iter_mut() {
            let Some(Value::Array(items)) = row.get_mut(foreign_keys) else {
                continue;
            };
            for item in items.iter_mut() {
                if let Value::String(s) = item {
                    if let Ok(n) = s.trim().parse::<i64>() {
                        *item = Value::from(n);
                    }
                }
            }
        }
    }
}

pub(crate) struct ReferenceIncluder<'a> {
    executor: &'a Executor,
    catalog: &'a Catalog,
    span: &'a Span,
}

impl<'a> ReferenceIncluder<'a> {
    pub fn new(executor: &'a Executor, catalog: &'a Catalog, span: &'a Span) -> Self {
        Self {
            executor,
            catalog,
            span,
        }
    }

    /// Attach every requested references-many relation to `rows`, including
    /// those nested in the scopes of natively included relations.
    ///
    /// Nested inclusions recurse depth-first. There is no cycle guard: the
    /// depth is bounded by how deeply the caller nests inclusions.
    pub fn include<'b>(
        &'b self,
        mut rows: Vec<DataObject>,
        entity: &'b EntityDefinition,
        inclusions: &'b [Inclusion],
    ) -> BoxFuture<'b, Result<Vec<DataObject>>> {
        async move {
            normalize_key_arrays(entity, &mut rows);

            for inclusion in inclusions {
                let Some(relation) = entity.relation_named(inclusion.relation()) else {
                    continue;
                };
                if relation.is_references_many() {
                    self.include_relation(&mut rows, relation, inclusion).await?;
                } else {
                    self.include_within(&mut rows, relation, inclusion).await?;
                }
            }
            Ok(rows)
        }
        .boxed()
    }

    /// Resolve inclusions nested under a relation the engine already
    /// attached: detach its rows, include into them, and put them back.
    async fn include_within(
        &self,
        parents: &mut [DataObject],
        relation: &RelationDefinition,
        inclusion: &Inclusion,
    ) -> Result<()> {
        let Some(scope) = inclusion.scope() else {
            return Ok(());
        };
        let nested = scope.inclusions();
        if nested.is_empty() {
            return Ok(());
        }
        let target = self.catalog.get(&relation.target)?;
        let mut requested = compile_fields(scope.fields.as_ref());
        let forced = ensure_reference_columns(target, nested, &mut requested);

        let mut layout = Vec::with_capacity(parents.len());
        let mut children = Vec::new();
        for parent in parents.iter_mut() {
            let Some(slot) = parent.get_mut(&relation.name) else {
                layout.push(Attached::Untouched);
                continue;
            };
            match slot.take() {
                Value::Array(items) => {
                    let rows: Vec<DataObject> = items
                        .into_iter()
                        .filter_map(|item| match item {
                            Value::Object(row) => Some(row),
                            _ => None,
                        })
                        .collect();
                    layout.push(Attached::Many(rows.len()));
                    children.extend(rows);
                }
                Value::Object(row) => {
                    layout.push(Attached::One);
                    children.push(row);
                }
                other => {
                    *slot = other;
                    layout.push(Attached::Untouched);
                }
            }
        }

        let mut children = self.include(children, target, nested).await?.into_iter();
        for (parent, attached) in parents.iter_mut().zip(layout) {
            let value = match attached {
                Attached::Many(n) => Value::Array(
                    children
                        .by_ref()
                        .take(n)
                        .map(|mut row| {
                            strip_columns(&mut row, &forced);
                            Value::Object(row)
                        })
                        .collect(),
                ),
                Attached::One => match children.next() {
                    Some(mut row) => {
                        strip_columns(&mut row, &forced);
                        Value::Object(row)
                    }
                    None => Value::Null,
                },
                Attached::Untouched => continue,
            };
            if let Some(slot) = parent.get_mut(&relation.name) {
                *slot = value;
            }
        }
        Ok(())
    }

    async fn include_relation(
        &self,
        parents: &mut [DataObject],
        relation: &RelationDefinition,
        inclusion: &Inclusion,
    ) -> Result<()> {
        let RelationKind::ReferencesMany {
            foreign_keys,
            target_key,
        } = &relation.kind
        else {
            return Ok(());
        };

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for parent in parents.iter() {
            match parent.get(foreign_keys) {
                Some(Value::Array(items)) => {
                    for item in items {
                        if !item.is_null() && seen.insert(key_form(item)) {
                            keys.push(item.clone());
                        }
                    }
                }
                _ => debug!(
                    parent: self.span,
                    relation = %relation.name,
                    column = %foreign_keys,
                    "Column holding reference keys isn't an array, can't fetch related rows"
                ),
            }
        }

        let target = self.catalog.get(&relation.target)?;
        let foreign_key = self.catalog.target_key(&relation.target, target_key.as_ref())?;

        let scope = inclusion.scope();
        let nested: &[Inclusion] = scope.map(|s| s.inclusions()).unwrap_or(&[]);
        let mut attributes = compile_fields(scope.and_then(|s| s.fields.as_ref()));
        let key_requested = ensure_attribute(&mut attributes, &foreign_key);
        let forced_columns = ensure_reference_columns(target, nested, &mut attributes);

        let children = if keys.is_empty() {
            Vec::new()
        } else {
            let model = self.executor.schemas().get_schema(self.catalog, &target.name)?;
            let mut options = FindOptions {
                where_: WhereOptions::is_in(foreign_key.clone(), keys)
                    .and(compile_where(scope.and_then(|s| s.where_.as_ref()))?),
                attributes,
                order: compile_order(scope.and_then(|s| s.order.as_ref()))?,
                limit: scope.and_then(|s| s.effective_limit()),
                offset: scope.and_then(|s| s.effective_offset()),
                include: compile_include(Some(nested), &model, self.executor.schemas())?,
            };
            ensure_nested_reference_columns(self.catalog, target, nested, &mut options.include)?;

            let rows = self.executor.find_all(&model, &options).await?;
            let mut rows = self.include(rows, target, nested).await?;
            for row in &mut rows {
                strip_columns(row, &forced_columns);
            }
            rows
        };

        debug!(
            parent: self.span,
            relation = %relation.name,
            target = %target.name,
            related = children.len(),
            "Included references"
        );

        for parent in parents.iter_mut() {
            let linked: Vec<Value> = children
                .iter()
                .filter(|child| match parent.get(foreign_keys) {
                    Some(Value::Array(fks)) => child
                        .get(&foreign_key)
                        .is_some_and(|v| fks.iter().any(|fk| same_key(fk, v))),
                    // Not an array: nothing to filter by
                    _ => true,
                })
                .map(|child| {
                    let mut child = child.clone();
                    if !key_requested {
                        child.remove(&foreign_key);
                    }
                    Value::Object(child)
                })
                .collect();
            parent.insert(relation.name.clone(), Value::Array(linked));
        }
        Ok(())
    }
}

fn strip_columns(row: &mut DataObject, columns: &[String]) {
    for column in columns {
        row.remove(column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PropertyDefinition, RelationDefinition};
    use serde_json::json;

    fn developer() -> EntityDefinition {
        EntityDefinition::new("Developer")
            .property(PropertyDefinition::new("id", PropertyType::Number).id())
            .property(
                PropertyDefinition::new("languageIds", PropertyType::Array)
                    .items(PropertyType::Number),
            )
            .property(PropertyDefinition::new("tags", PropertyType::Array))
            .relation(RelationDefinition::references_many(
                "languages",
                "Language",
                "languageIds",
            ))
    }

    #[test]
    fn test_numeric_strings_coerced() {
        let mut rows = vec![
            json!({"id": 1, "languageIds": ["2", 4, "x"], "tags": ["7"]})
                .as_object()
                .cloned()
                .unwrap(),
        ];
        normalize_key_arrays(&developer(), &mut rows);
        assert_eq!(rows[0]["languageIds"], json!([2, 4, "x"]));
        // Not backing a references-many relation
        assert_eq!(rows[0]["tags"], json!(["7"]));
    }

    #[test]
    fn test_reference_columns_forced_into_projection() {
        let inclusions = vec![Inclusion::from("languages")];

        let mut attributes = Some(Attributes::Only(vec!["id".to_string()]));
        let forced = ensure_reference_columns(&developer(), &inclusions, &mut attributes);
        assert_eq!(forced, vec!["languageIds".to_string()]);
        assert_eq!(
            attributes,
            Some(Attributes::Only(vec!["id".to_string(), "languageIds".to_string()]))
        );

        let mut all = None;
        assert!(ensure_reference_columns(&developer(), &inclusions, &mut all).is_empty());
    }

    #[test]
    fn test_reference_columns_forced_under_native_include() {
        let catalog = Catalog::builder()
            .entity(
                EntityDefinition::new("Team")
                    .property(PropertyDefinition::new("id", PropertyType::Number).id())
                    .relation(RelationDefinition::has_many("members", "Developer", "teamId")),
            )
            .entity(
                developer().property(PropertyDefinition::new("teamId", PropertyType::Number)),
            )
            .entity(
                EntityDefinition::new("Language")
                    .property(PropertyDefinition::new("id", PropertyType::Number).id()),
            )
            .build()
            .unwrap();
        let registry = crate::schema::SchemaRegistry::new();
        let team = registry.get_schema(&catalog, "Team").unwrap();

        let filter = crate::filter::Filter::from_json(json!({
            "include": [{"relation": "members", "scope": {"fields": ["id"], "include": ["languages"]}}]
        }))
        .unwrap();
        let mut includes = compile_include(Some(filter.inclusions()), &team, &registry).unwrap();
        let entity = catalog.get("Team").unwrap();
        ensure_nested_reference_columns(&catalog, entity, filter.inclusions(), &mut includes)
            .unwrap();

        assert_eq!(includes.len(), 1);
        assert_eq!(
            includes[0].attributes,
            Some(Attributes::Only(vec!["id".to_string(), "languageIds".to_string()]))
        );
        // Left for manual inclusion
        assert!(includes[0].include.is_empty());
    }
}

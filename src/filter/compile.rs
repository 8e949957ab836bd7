//! Translation of abstract filters into engine query descriptors.
//!
//! These are pure functions: they only consult the registered models to
//! decide which inclusions the engine can join natively.

use serde_json::Value;
use tracing::debug;

use super::{Fields, Inclusion, Order, Where};
use crate::error::{Error, Result};
use crate::orm::{
    Attributes, IncludeOptions, Model, OrderDirection, OrderItem, WhereNode, WhereOptions,
    translate,
};
use crate::schema::SchemaRegistry;

/// Compile a where tree. An absent or empty tree matches everything.
pub fn compile_where(where_: Option<&Where>) -> Result<WhereOptions> {
    let mut compiled = WhereOptions::new();
    let Some(where_) = where_ else {
        return Ok(compiled);
    };

    for (key, value) in where_ {
        match value {
            Value::Array(members) if key == "and" || key == "or" => {
                let op = translate(key)?;
                let mut branches = Vec::with_capacity(members.len());
                for member in members {
                    match member {
                        Value::Object(nested) => branches.push(compile_where(Some(nested))?),
                        other => {
                            return Err(Error::InvalidValue(format!(
                                "\"{}\" members must be condition objects, got {}",
                                key, other
                            )));
                        }
                    }
                }
                compiled.push(WhereNode::Logical { op, branches });
            }
            Value::Object(operators) => {
                let mut conditions = Vec::with_capacity(operators.len());
                for (operator, operand) in operators {
                    conditions.push((translate(operator)?, operand.clone()));
                }
                compiled.push(WhereNode::Column {
                    attribute: key.clone(),
                    conditions,
                });
            }
            leaf => compiled.push(WhereNode::Column {
                attribute: key.clone(),
                conditions: vec![(crate::orm::Op::Eq, leaf.clone())],
            }),
        }
    }
    Ok(compiled)
}

/// Compile a field projection.
///
/// A list passes through. For flags, selected names win over omitted ones; if
/// nothing is selected the omitted names become an exclusion.
pub fn compile_fields(fields: Option<&Fields>) -> Option<Attributes> {
    match fields? {
        Fields::List(names) => Some(Attributes::Only(names.clone())),
        Fields::Flags(flags) => {
            let mut include = Vec::new();
            let mut exclude = Vec::new();
            for (name, flag) in flags {
                match flag {
                    Value::Bool(true) => include.push(name.clone()),
                    Value::Bool(false) => exclude.push(name.clone()),
                    _ => {}
                }
            }
            if !include.is_empty() {
                Some(Attributes::Only(include))
            } else {
                Some(Attributes::Filter {
                    include: Vec::new(),
                    exclude,
                })
            }
        }
    }
}

/// Compile `"column [ASC|DESC]"` entries. Direction defaults to ascending.
pub fn compile_order(order: Option<&Order>) -> Result<Option<Vec<OrderItem>>> {
    let entries: Vec<&String> = match order {
        None => return Ok(None),
        Some(Order::One(entry)) => vec![entry],
        Some(Order::Many(entries)) => entries.iter().collect(),
    };

    let mut items = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut parts = entry.split_whitespace();
        let Some(column) = parts.next() else {
            continue;
        };
        let direction = match parts.next() {
            None => OrderDirection::Asc,
            Some(raw) => OrderDirection::parse(raw).ok_or_else(|| {
                Error::InvalidValue(format!("invalid sort direction \"{}\" in \"{}\"", raw, entry))
            })?,
        };
        items.push(OrderItem::new(column, direction));
    }
    Ok(Some(items))
}

/// Compile inclusions the engine can join natively.
///
/// Relations without a native association on `source` (references-many) are
/// skipped here and resolved later by the repository.
pub fn compile_include(
    inclusions: Option<&[Inclusion]>,
    source: &Model,
    registry: &SchemaRegistry,
) -> Result<Vec<IncludeOptions>> {
    let mut compiled = Vec::new();
    for inclusion in inclusions.unwrap_or(&[]) {
        let relation = inclusion.relation();
        let Some(association) = source.association(relation) else {
            debug!(
                entity = %source.name,
                relation = %relation,
                "Relation has no native association, leaving it for manual inclusion"
            );
            continue;
        };

        let target = registry
            .get(&association.target)
            .ok_or_else(|| Error::UnknownEntity(association.target.clone()))?;
        let scope = inclusion.scope();

        let limit = scope.and_then(|s| s.effective_limit());
        let order = compile_order(scope.and_then(|s| s.order.as_ref()))?;
        let nested = compile_include(
            scope.and_then(|s| s.include.as_deref()),
            &target,
            registry,
        )?;

        let mut include = IncludeOptions::new(relation, target);
        include.where_ = compile_where(scope.and_then(|s| s.where_.as_ref()))?;
        include.attributes = compile_fields(scope.and_then(|s| s.fields.as_ref()));
        include.include = nested;
        include.separate = order.is_some() || limit.is_some();
        include.limit = limit;
        include.order = order;
        include.required = inclusion.required();
        compiled.push(include);
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::orm::Op;
    use crate::schema::{Catalog, EntityDefinition, PropertyDefinition, PropertyType, RelationDefinition};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn where_of(value: Value) -> Where {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_where_operators_and_implicit_equality() {
        let compiled = compile_where(Some(&where_of(json!({
            "age": {"gt": 18, "lte": 65},
            "name": "ada"
        }))))
        .unwrap();

        assert_eq!(
            compiled.nodes,
            vec![
                WhereNode::Column {
                    attribute: "age".to_string(),
                    conditions: vec![(Op::Gt, json!(18)), (Op::Lte, json!(65))],
                },
                WhereNode::Column {
                    attribute: "name".to_string(),
                    conditions: vec![(Op::Eq, json!("ada"))],
                },
            ]
        );
    }

    #[test]
    fn test_where_logical_groups_nest() {
        let compiled = compile_where(Some(&where_of(json!({
            "or": [{"name": "ada"}, {"and": [{"age": {"gte": 1}}, {"age": {"lt": 9}}]}]
        }))))
        .unwrap();

        assert_eq!(
            compiled.nodes,
            vec![WhereNode::Logical {
                op: Op::Or,
                branches: vec![
                    WhereOptions::eq("name", json!("ada")),
                    WhereOptions {
                        nodes: vec![WhereNode::Logical {
                            op: Op::And,
                            branches: vec![
                                WhereOptions::condition("age", Op::Gte, json!(1)),
                                WhereOptions::condition("age", Op::Lt, json!(9)),
                            ],
                        }],
                    },
                ],
            }]
        );
    }

    #[test]
    fn test_where_empty_and_unknown_operator() {
        assert!(compile_where(None).unwrap().is_empty());
        assert!(compile_where(Some(&Where::new())).unwrap().is_empty());
        assert_matches!(
            compile_where(Some(&where_of(json!({"age": {"near": 3}})))),
            Err(Error::UnsupportedOperator(op)) if op == "near"
        );
    }

    #[test]
    fn test_where_null_and_array_leaves_are_equality() {
        let compiled = compile_where(Some(&where_of(json!({"deletedAt": null, "tags": [1, 2]})))).unwrap();
        assert_eq!(
            compiled.nodes,
            vec![
                WhereNode::Column {
                    attribute: "deletedAt".to_string(),
                    conditions: vec![(Op::Eq, Value::Null)],
                },
                WhereNode::Column {
                    attribute: "tags".to_string(),
                    conditions: vec![(Op::Eq, json!([1, 2]))],
                },
            ]
        );
    }

    #[test]
    fn test_fields() {
        assert_eq!(compile_fields(None), None);
        assert_eq!(
            compile_fields(Some(&Fields::list(["a", "b"]))),
            Some(Attributes::Only(vec!["a".to_string(), "b".to_string()]))
        );
        // Inclusion wins over exclusion
        assert_eq!(
            compile_fields(Some(&Fields::flags([("a", true), ("b", false)]))),
            Some(Attributes::Only(vec!["a".to_string()]))
        );
        assert_eq!(
            compile_fields(Some(&Fields::flags([("b", false)]))),
            Some(Attributes::Filter {
                include: Vec::new(),
                exclude: vec!["b".to_string()],
            })
        );
        assert_eq!(
            compile_fields(Some(&Fields::Flags(Default::default()))),
            Some(Attributes::Filter {
                include: Vec::new(),
                exclude: Vec::new(),
            })
        );
    }

    #[test]
    fn test_order() {
        assert_eq!(compile_order(None).unwrap(), None);
        assert_eq!(
            compile_order(Some(&Order::One("age DESC".to_string()))).unwrap(),
            Some(vec![OrderItem::new("age", OrderDirection::Desc)])
        );
        assert_eq!(
            compile_order(Some(&Order::Many(vec!["name".to_string(), "age desc".to_string()])))
                .unwrap(),
            Some(vec![
                OrderItem::new("name", OrderDirection::Asc),
                OrderItem::new("age", OrderDirection::Desc),
            ])
        );
        assert_matches!(
            compile_order(Some(&Order::One("age sideways".to_string()))),
            Err(Error::InvalidValue(_))
        );
    }

    fn registry() -> (SchemaRegistry, std::sync::Arc<Model>) {
        let catalog = Catalog::builder()
            .entity(
                EntityDefinition::new("Author")
                    .property(PropertyDefinition::new("id", PropertyType::Number).id())
                    .property(PropertyDefinition::new("tagIds", PropertyType::Array))
                    .relation(RelationDefinition::has_many("books", "Book", "authorId"))
                    .relation(RelationDefinition::references_many("tags", "Tag", "tagIds")),
            )
            .entity(
                EntityDefinition::new("Book")
                    .property(PropertyDefinition::new("id", PropertyType::Number).id())
                    .property(PropertyDefinition::new("authorId", PropertyType::Number))
                    .property(PropertyDefinition::new("title", PropertyType::String))
                    .relation(RelationDefinition::belongs_to("author", "Author", "authorId")),
            )
            .entity(
                EntityDefinition::new("Tag")
                    .property(PropertyDefinition::new("id", PropertyType::Number).id()),
            )
            .build()
            .unwrap();
        let registry = SchemaRegistry::new();
        let author = registry.get_schema(&catalog, "Author").unwrap();
        (registry, author)
    }

    #[test]
    fn test_include_native_and_skipped() {
        let (registry, author) = registry();
        let filter = Filter::from_json(json!({
            "include": [
                "tags",
                {
                    "relation": "books",
                    "scope": {
                        "where": {"title": {"like": "A%"}},
                        "fields": ["title"],
                        "order": "title DESC",
                        "limit": 5,
                        "totalLimit": 2,
                        "include": ["author"]
                    },
                    "required": true
                }
            ]
        }))
        .unwrap();

        let compiled = compile_include(filter.include.as_deref(), &author, &registry).unwrap();
        assert_eq!(compiled.len(), 1);

        let books = &compiled[0];
        assert_eq!(books.association, "books");
        assert_eq!(books.target.name, "Book");
        assert_eq!(books.limit, Some(2));
        assert!(books.separate);
        assert!(books.required);
        assert_eq!(
            books.attributes,
            Some(Attributes::Only(vec!["title".to_string()]))
        );
        assert_eq!(
            books.order,
            Some(vec![OrderItem::new("title", OrderDirection::Desc)])
        );
        assert_eq!(books.where_, WhereOptions::condition("title", Op::Like, json!("A%")));
        assert_eq!(books.include.len(), 1);
        assert_eq!(books.include[0].association, "author");
        assert!(!books.include[0].separate);
        assert!(!books.include[0].required);
    }
}

//! Native eager loading.
//!
//! Each include runs as one batched follow-up query per association (plus one
//! join-table query for many-to-many), keyed on the distinct correlation
//! values of the parent rows. Related rows are then stitched onto their
//! parents under the association alias.

use serde_json::Value;
use tracing::debug;

use super::model::{Association, AssociationKind};
use super::query::Executor;
use super::traits::{Attributes, FindOptions, IncludeOptions, WhereOptions, ensure_attribute};
use super::{DataObject, Model, distinct_keys, same_key};
use crate::error::{Error, Result};

/// Related rows fetched for one include.
struct Related {
    rows: Vec<DataObject>,
    /// Join rows for many-to-many associations
    links: Vec<DataObject>,
    /// Whether the caller's projection asked for the target-side key
    key_requested: bool,
}

pub(crate) async fn resolve(
    executor: &Executor,
    source: &Model,
    parents: &mut Vec<DataObject>,
    includes: &[IncludeOptions],
) -> Result<()> {
    for include in includes {
        let association =
            source
                .association(&include.association)
                .ok_or_else(|| Error::UnknownRelation {
                    entity: source.name.clone(),
                    relation: include.association.clone(),
                })?;

        let related = match association.kind {
            AssociationKind::ManyToMany => {
                fetch_through(executor, association, include, parents).await?
            }
            _ => fetch_direct(executor, association, include, parents).await?,
        };
        debug!(
            parent: executor.span(),
            association = %association.alias,
            related = related.rows.len(),
            "Resolved include"
        );

        attach(association, include, parents, &related);

        if include.required {
            parents.retain(|parent| match parent.get(&association.alias) {
                Some(Value::Array(items)) => !items.is_empty(),
                Some(Value::Null) | None => false,
                Some(_) => true,
            });
        }
    }
    Ok(())
}

/// Options for the batched target query.
fn target_options(
    include: &IncludeOptions,
    key: &str,
    keys: Vec<Value>,
    attributes: Option<Attributes>,
) -> FindOptions {
    FindOptions {
        where_: WhereOptions::is_in(key, keys).and(include.where_.clone()),
        attributes,
        // Limits apply per parent while stitching; the batch only carries the order
        order: if include.separate {
            include.order.clone()
        } else {
            None
        },
        limit: None,
        offset: None,
        include: include.include.clone(),
    }
}

async fn fetch_direct(
    executor: &Executor,
    association: &Association,
    include: &IncludeOptions,
    parents: &[DataObject],
) -> Result<Related> {
    let mut attributes = include.attributes.clone();
    let key_requested = ensure_attribute(&mut attributes, &association.target_key);

    let keys = distinct_keys(parents, &association.source_key);
    if keys.is_empty() {
        return Ok(Related {
            rows: Vec::new(),
            links: Vec::new(),
            key_requested,
        });
    }

    let options = target_options(include, &association.target_key, keys, attributes);
    let rows = executor.find_all(&include.target, &options).await?;
    Ok(Related {
        rows,
        links: Vec::new(),
        key_requested,
    })
}

async fn fetch_through(
    executor: &Executor,
    association: &Association,
    include: &IncludeOptions,
    parents: &[DataObject],
) -> Result<Related> {
    let through = association.through.as_ref().ok_or_else(|| {
        Error::Config(format!(
            "many-to-many association \"{}\" has no join model",
            association.alias
        ))
    })?;
    let through_model = executor
        .schemas()
        .get(&through.model)
        .ok_or_else(|| Error::UnknownEntity(through.model.clone()))?;

    let mut attributes = include.attributes.clone();
    let key_requested = ensure_attribute(&mut attributes, &association.target_key);
    let mut related = Related {
        rows: Vec::new(),
        links: Vec::new(),
        key_requested,
    };

    let keys = distinct_keys(parents, &association.source_key);
    if keys.is_empty() {
        return Ok(related);
    }

    let link_options = FindOptions {
        where_: WhereOptions::is_in(through.foreign_key.clone(), keys),
        attributes: Some(Attributes::Only(vec![
            through.foreign_key.clone(),
            through.other_key.clone(),
        ])),
        ..Default::default()
    };
    related.links = executor.find_all(&through_model, &link_options).await?;

    let target_keys = distinct_keys(&related.links, &through.other_key);
    if target_keys.is_empty() {
        return Ok(related);
    }

    let options = target_options(include, &association.target_key, target_keys, attributes);
    related.rows = executor.find_all(&include.target, &options).await?;
    Ok(related)
}

fn attach(
    association: &Association,
    include: &IncludeOptions,
    parents: &mut [DataObject],
    related: &Related,
) {
    let per_parent = include
        .limit
        .and_then(|l| usize::try_from(l).ok())
        .unwrap_or(usize::MAX);

    for parent in parents.iter_mut() {
        let parent_key = parent
            .get(&association.source_key)
            .cloned()
            .unwrap_or(Value::Null);

        let matches: Vec<Value> = match &association.through {
            None => related
                .rows
                .iter()
                .filter(|row| {
                    row.get(&association.target_key)
                        .is_some_and(|v| same_key(v, &parent_key))
                })
                .take(per_parent)
                .map(|row| strip(row, &association.target_key, related.key_requested))
                .collect(),
            Some(through) => {
                let linked: Vec<&Value> = related
                    .links
                    .iter()
                    .filter(|link| {
                        link.get(&through.foreign_key)
                            .is_some_and(|v| same_key(v, &parent_key))
                    })
                    .filter_map(|link| link.get(&through.other_key))
                    .collect();
                related
                    .rows
                    .iter()
                    .filter(|row| {
                        row.get(&association.target_key)
                            .is_some_and(|v| linked.iter().any(|l| same_key(l, v)))
                    })
                    .take(per_parent)
                    .map(|row| strip(row, &association.target_key, related.key_requested))
                    .collect()
            }
        };

        let value = if association.kind.is_multiple() {
            Value::Array(matches)
        } else {
            matches.into_iter().next().unwrap_or(Value::Null)
        };
        parent.insert(association.alias.clone(), value);
    }
}

fn strip(row: &DataObject, key: &str, requested: bool) -> Value {
    let mut row = row.clone();
    if !requested {
        row.remove(key);
    }
    Value::Object(row)
}

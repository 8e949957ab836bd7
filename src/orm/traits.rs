//! Engine-native query descriptors and bind values.
//!
//! Filters are compiled into these types before any SQL is rendered. They are
//! plain data: the builder turns them into parameterized SQL and the executor
//! runs them.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde_json::Value;

use super::model::{Attribute, ColumnType, Model};
use super::operators::Op;
use crate::error::{Error, Result};

/// SQL value for parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl SqlValue {
    /// Convert a JSON value for storage in (or comparison against) a column of `column_type`.
    pub fn from_json(value: &Value, column_type: ColumnType) -> Result<Self> {
        let converted = match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) if column_type != ColumnType::Float => SqlValue::Int(i),
                _ => SqlValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => match column_type {
                ColumnType::Timestamp => SqlValue::String(normalize_timestamp(s)?),
                ColumnType::Integer => match s.parse::<i64>() {
                    Ok(i) => SqlValue::Int(i),
                    Err(_) => SqlValue::String(s.clone()),
                },
                _ => SqlValue::String(s.clone()),
            },
            // Arrays and objects are stored as JSON text
            Value::Array(_) | Value::Object(_) => SqlValue::String(serde_json::to_string(value)?),
        };
        Ok(converted)
    }

    /// Bind this value to a sqlx query builder
    pub fn bind_to_query<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
        match self {
            SqlValue::String(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Null => query.bind(None::<String>),
        }
    }
}

/// Normalize a date or date-time string to RFC 3339 UTC with millisecond
/// precision, so stored timestamps compare correctly as text.
pub fn normalize_timestamp(raw: &str) -> Result<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(date
            .and_time(NaiveTime::MIN)
            .and_utc()
            .to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    Err(Error::InvalidValue(format!("\"{}\" is not a valid date", raw)))
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    /// Case-insensitive `ASC` / `DESC`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("asc") {
            Some(OrderDirection::Asc)
        } else if raw.eq_ignore_ascii_case("desc") {
            Some(OrderDirection::Desc)
        } else {
            None
        }
    }

    pub fn to_sql(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub column: String,
    pub direction: OrderDirection,
}

impl OrderItem {
    pub fn new(column: impl Into<String>, direction: OrderDirection) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

/// Column projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attributes {
    /// Exactly these columns, in this order
    Only(Vec<String>),
    /// Every column except `exclude`; `include` names columns that must be present
    Filter {
        include: Vec<String>,
        exclude: Vec<String>,
    },
}

impl Attributes {
    /// Resolve the projection against `model`. Unknown names are rejected.
    pub fn select<'m>(&self, model: &'m Model) -> Result<Vec<&'m Attribute>> {
        match self {
            Attributes::Only(names) => names.iter().map(|n| model.require_attribute(n)).collect(),
            Attributes::Filter { include, exclude } => {
                for name in include.iter().chain(exclude) {
                    model.require_attribute(name)?;
                }
                Ok(model
                    .attributes
                    .iter()
                    .filter(|a| !exclude.contains(&a.name))
                    .collect())
            }
        }
    }
}

/// Make sure `name` ends up in the projection.
///
/// Returns `true` when the caller's projection already asked for it, `false`
/// when it had to be forced in (and should be stripped from results).
pub fn ensure_attribute(attributes: &mut Option<Attributes>, name: &str) -> bool {
    match attributes {
        None => true,
        Some(Attributes::Only(names)) => {
            if names.iter().any(|n| n == name) {
                true
            } else {
                names.push(name.to_string());
                false
            }
        }
        Some(Attributes::Filter { exclude, .. }) => {
            if exclude.iter().any(|n| n == name) {
                exclude.retain(|n| n != name);
                false
            } else {
                true
            }
        }
    }
}

/// One predicate in a [`WhereOptions`] conjunction.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    /// Every `(op, value)` pair must hold for `attribute`
    Column {
        attribute: String,
        conditions: Vec<(Op, Value)>,
    },
    /// Branches joined by `op` (`And` / `Or`); each branch is itself a conjunction
    Logical { op: Op, branches: Vec<WhereOptions> },
}

/// Conjunction of predicates. Empty means "match everything".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereOptions {
    pub nodes: Vec<WhereNode>,
}

impl WhereOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn condition(attribute: impl Into<String>, op: Op, value: Value) -> Self {
        Self {
            nodes: vec![WhereNode::Column {
                attribute: attribute.into(),
                conditions: vec![(op, value)],
            }],
        }
    }

    pub fn eq(attribute: impl Into<String>, value: Value) -> Self {
        Self::condition(attribute, Op::Eq, value)
    }

    pub fn is_in(attribute: impl Into<String>, values: Vec<Value>) -> Self {
        Self::condition(attribute, Op::In, Value::Array(values))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn push(&mut self, node: WhereNode) {
        self.nodes.push(node);
    }

    /// AND another conjunction onto this one.
    pub fn and(mut self, other: WhereOptions) -> Self {
        self.nodes.extend(other.nodes);
        self
    }
}

/// Eager-load descriptor for one association.
#[derive(Debug, Clone)]
pub struct IncludeOptions {
    /// Association alias on the source model
    pub association: String,
    pub target: Arc<Model>,
    pub where_: WhereOptions,
    pub limit: Option<u64>,
    pub attributes: Option<Attributes>,
    pub include: Vec<IncludeOptions>,
    pub order: Option<Vec<OrderItem>>,
    /// Drop parents that end up without related rows
    pub required: bool,
    /// Related rows are fetched by their own query, so order and limit apply to it
    pub separate: bool,
}

impl IncludeOptions {
    pub fn new(association: impl Into<String>, target: Arc<Model>) -> Self {
        Self {
            association: association.into(),
            target,
            where_: WhereOptions::default(),
            limit: None,
            attributes: None,
            include: Vec::new(),
            order: None,
            required: false,
            separate: false,
        }
    }
}

/// Everything a select needs.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub where_: WhereOptions,
    pub attributes: Option<Attributes>,
    pub order: Option<Vec<OrderItem>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub include: Vec<IncludeOptions>,
}

/// Caller-supplied engine overrides. Every set field replaces the value
/// derived from the filter.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub where_: Option<WhereOptions>,
    /// For selects the projection; for inserts the column whitelist
    pub attributes: Option<Attributes>,
    pub order: Option<Vec<OrderItem>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub include: Option<Vec<IncludeOptions>>,
}

impl QueryOptions {
    pub fn apply(&self, options: &mut FindOptions) {
        if let Some(where_) = &self.where_ {
            options.where_ = where_.clone();
        }
        if let Some(attributes) = &self.attributes {
            options.attributes = Some(attributes.clone());
        }
        if let Some(order) = &self.order {
            options.order = Some(order.clone());
        }
        if let Some(limit) = self.limit {
            options.limit = Some(limit);
        }
        if let Some(offset) = self.offset {
            options.offset = Some(offset);
        }
        if let Some(include) = &self.include {
            options.include = include.clone();
        }
    }

    /// The overriding where clause if set, else `base`.
    pub fn where_or(&self, base: WhereOptions) -> WhereOptions {
        self.where_.clone().unwrap_or(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_value_conversion() {
        assert_eq!(
            SqlValue::from_json(&json!(10), ColumnType::Numeric).unwrap(),
            SqlValue::Int(10)
        );
        assert_eq!(
            SqlValue::from_json(&json!(10), ColumnType::Float).unwrap(),
            SqlValue::Float(10.0)
        );
        assert_eq!(
            SqlValue::from_json(&json!([1, 2]), ColumnType::IntegerArray).unwrap(),
            SqlValue::String("[1,2]".to_string())
        );
        assert_eq!(
            SqlValue::from_json(&json!("2024-03-01T10:00:00+02:00"), ColumnType::Timestamp)
                .unwrap(),
            SqlValue::String("2024-03-01T08:00:00.000Z".to_string())
        );
        assert_eq!(
            SqlValue::from_json(&json!("2024-03-01"), ColumnType::Timestamp).unwrap(),
            SqlValue::String("2024-03-01T00:00:00.000Z".to_string())
        );
        assert!(SqlValue::from_json(&json!("yesterday"), ColumnType::Timestamp).is_err());
        assert_eq!(
            SqlValue::from_json(&Value::Null, ColumnType::Text).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn test_order_direction_parse() {
        assert_eq!(OrderDirection::parse("DESC"), Some(OrderDirection::Desc));
        assert_eq!(OrderDirection::parse("asc"), Some(OrderDirection::Asc));
        assert_eq!(OrderDirection::parse("up"), None);
    }

    #[test]
    fn test_ensure_attribute() {
        let mut none = None;
        assert!(ensure_attribute(&mut none, "id"));
        assert_eq!(none, None);

        let mut only = Some(Attributes::Only(vec!["name".to_string()]));
        assert!(!ensure_attribute(&mut only, "id"));
        assert_eq!(
            only,
            Some(Attributes::Only(vec!["name".to_string(), "id".to_string()]))
        );
        assert!(ensure_attribute(&mut only, "name"));

        let mut filtered = Some(Attributes::Filter {
            include: Vec::new(),
            exclude: vec!["id".to_string(), "secret".to_string()],
        });
        assert!(!ensure_attribute(&mut filtered, "id"));
        assert_eq!(
            filtered,
            Some(Attributes::Filter {
                include: Vec::new(),
                exclude: vec!["secret".to_string()],
            })
        );
    }

    #[test]
    fn test_query_options_override() {
        let mut options = FindOptions {
            where_: WhereOptions::eq("age", json!(10)),
            limit: Some(5),
            ..Default::default()
        };
        let overrides = QueryOptions {
            limit: Some(1),
            order: Some(vec![OrderItem::new("name", OrderDirection::Desc)]),
            ..Default::default()
        };
        overrides.apply(&mut options);

        assert_eq!(options.limit, Some(1));
        assert_eq!(options.where_, WhereOptions::eq("age", json!(10)));
        assert_eq!(
            options.order,
            Some(vec![OrderItem::new("name", OrderDirection::Desc)])
        );
    }
}

//! SQL builder for the engine.
//!
//! Renders compiled [`FindOptions`] / [`WhereOptions`] into parameterized SQL
//! for the connection's dialect, and decodes result rows back into
//! [`DataObject`]s.

use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{Any, Row};

use super::DataObject;
use super::model::{Attribute, ColumnType, Model};
use super::operators::Op;
use super::traits::{FindOptions, OrderItem, SqlValue, WhereNode, WhereOptions};
use crate::db::Dialect;
use crate::error::{Error, Result};

/// Accumulates one SQL statement and its bind values.
///
/// Placeholders are numbered as values are pushed, so fragments can be
/// rendered in any order without rewriting parameters afterwards.
#[derive(Debug)]
pub struct SqlBuilder {
    dialect: Dialect,
    sql: String,
    values: Vec<SqlValue>,
}

impl SqlBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            values: Vec::new(),
        }
    }

    /// `SELECT <columns> FROM <table> [WHERE] [ORDER BY] [LIMIT/OFFSET]`
    pub fn select(
        dialect: Dialect,
        model: &Model,
        columns: &[&Attribute],
        options: &FindOptions,
    ) -> Result<Self> {
        let mut builder = Self::new(dialect);
        builder.sql = format!(
            "SELECT {} FROM {}",
            builder.projection(columns),
            dialect.quote(&model.table)
        );
        builder.push_where(model, &options.where_)?;
        builder.push_order(model, options.order.as_deref())?;
        builder.push_limit(options.limit, options.offset);
        Ok(builder)
    }

    /// Build a COUNT query
    pub fn count(dialect: Dialect, model: &Model, where_: &WhereOptions) -> Result<Self> {
        let mut builder = Self::new(dialect);
        builder.sql = format!("SELECT COUNT(*) FROM {}", dialect.quote(&model.table));
        builder.push_where(model, where_)?;
        Ok(builder)
    }

    /// Build an INSERT, with a RETURNING clause when the dialect has one and
    /// `returning` is not empty.
    pub fn insert(
        dialect: Dialect,
        model: &Model,
        values: Vec<(&Attribute, SqlValue)>,
        returning: &[&Attribute],
    ) -> Self {
        let mut builder = Self::new(dialect);
        let table = dialect.quote(&model.table);

        if values.is_empty() {
            builder.sql = match dialect {
                Dialect::Mysql => format!("INSERT INTO {} () VALUES ()", table),
                _ => format!("INSERT INTO {} DEFAULT VALUES", table),
            };
        } else {
            let columns: Vec<String> = values
                .iter()
                .map(|(attribute, _)| dialect.quote(&attribute.field))
                .collect();
            let placeholders: Vec<String> = values
                .into_iter()
                .map(|(_, value)| builder.bind(value))
                .collect();
            builder.sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders.join(", ")
            );
        }

        if dialect.supports_returning() && !returning.is_empty() {
            let projection = builder.projection(returning);
            builder.sql.push_str(" RETURNING ");
            builder.sql.push_str(&projection);
        }
        builder
    }

    /// Build an UPDATE setting every given column on rows matching `where_`
    pub fn update(
        dialect: Dialect,
        model: &Model,
        values: Vec<(&Attribute, SqlValue)>,
        where_: &WhereOptions,
    ) -> Result<Self> {
        let mut builder = Self::new(dialect);
        let assignments: Vec<String> = values
            .into_iter()
            .map(|(attribute, value)| {
                let placeholder = builder.bind(value);
                format!("{} = {}", dialect.quote(&attribute.field), placeholder)
            })
            .collect();
        builder.sql = format!(
            "UPDATE {} SET {}",
            dialect.quote(&model.table),
            assignments.join(", ")
        );
        builder.push_where(model, where_)?;
        Ok(builder)
    }

    /// Build a DELETE for rows matching `where_`
    pub fn delete(dialect: Dialect, model: &Model, where_: &WhereOptions) -> Result<Self> {
        let mut builder = Self::new(dialect);
        builder.sql = format!("DELETE FROM {}", dialect.quote(&model.table));
        builder.push_where(model, where_)?;
        Ok(builder)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Returns `(sql, values)` so the caller can bind and execute.
    pub fn build(self) -> (String, Vec<SqlValue>) {
        (self.sql, self.values)
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        self.dialect.placeholder(self.values.len())
    }

    /// Column list aliased back to property names where the column is renamed.
    fn projection(&self, columns: &[&Attribute]) -> String {
        columns
            .iter()
            .map(|attribute| {
                let field = self.dialect.quote(&attribute.field);
                if attribute.field == attribute.name {
                    field
                } else {
                    format!("{} AS {}", field, self.dialect.quote(&attribute.name))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn push_where(&mut self, model: &Model, where_: &WhereOptions) -> Result<()> {
        if let Some(conditions) = self.render_where(model, where_)? {
            self.sql.push_str(" WHERE ");
            self.sql.push_str(&conditions);
        }
        Ok(())
    }

    fn render_where(&mut self, model: &Model, where_: &WhereOptions) -> Result<Option<String>> {
        let mut parts = Vec::new();
        for node in &where_.nodes {
            if let Some(part) = self.render_node(model, node)? {
                parts.push(part);
            }
        }
        Ok(if parts.is_empty() {
            None
        } else {
            Some(parts.join(" AND "))
        })
    }

    fn render_node(&mut self, model: &Model, node: &WhereNode) -> Result<Option<String>> {
        match node {
            WhereNode::Column {
                attribute,
                conditions,
            } => {
                let attribute = model.require_attribute(attribute)?;
                let column = self.dialect.quote(&attribute.field);
                let mut parts = Vec::with_capacity(conditions.len());
                for (op, value) in conditions {
                    parts.push(self.render_condition(&column, attribute.column_type, *op, value)?);
                }
                Ok(match parts.len() {
                    0 => None,
                    1 => parts.pop(),
                    _ => Some(format!("({})", parts.join(" AND "))),
                })
            }
            WhereNode::Logical { op, branches } => {
                if branches.is_empty() {
                    let neutral = if *op == Op::Or { "1=0" } else { "1=1" };
                    return Ok(Some(neutral.to_string()));
                }
                let mut rendered = Vec::with_capacity(branches.len());
                for branch in branches {
                    match self.render_where(model, branch)? {
                        Some(sql) => rendered.push(format!("({})", sql)),
                        None => rendered.push("1=1".to_string()),
                    }
                }
                Ok(Some(format!("({})", rendered.join(op.joiner()))))
            }
        }
    }

    fn render_condition(
        &mut self,
        column: &str,
        column_type: ColumnType,
        op: Op,
        value: &Value,
    ) -> Result<String> {
        match op {
            Op::Eq if value.is_null() => Ok(format!("{} IS NULL", column)),
            Op::Ne if value.is_null() => Ok(format!("{} IS NOT NULL", column)),
            Op::In | Op::NotIn => {
                let items = match value {
                    Value::Array(items) => items.as_slice(),
                    other => std::slice::from_ref(other),
                };
                // Nothing is IN an empty list
                if items.is_empty() {
                    return Ok(if op == Op::In { "1=0" } else { "1=1" }.to_string());
                }
                let mut placeholders = Vec::with_capacity(items.len());
                for item in items {
                    placeholders.push(self.bind(SqlValue::from_json(item, column_type)?));
                }
                let keyword = if op == Op::In { "IN" } else { "NOT IN" };
                Ok(format!("{} {} ({})", column, keyword, placeholders.join(", ")))
            }
            Op::Between => match value {
                Value::Array(bounds) if bounds.len() == 2 => {
                    let low = self.bind(SqlValue::from_json(&bounds[0], column_type)?);
                    let high = self.bind(SqlValue::from_json(&bounds[1], column_type)?);
                    Ok(format!("{} BETWEEN {} AND {}", column, low, high))
                }
                other => Err(Error::InvalidValue(format!(
                    "between expects two bounds, got {}",
                    other
                ))),
            },
            // Column-level logic: `{age: {or: [10, 20]}}`
            Op::And | Op::Or => {
                let items = match value {
                    Value::Array(items) => items.as_slice(),
                    other => std::slice::from_ref(other),
                };
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    if item.is_object() || item.is_array() {
                        return Err(Error::InvalidValue(format!(
                            "column-level {:?} accepts scalar values only",
                            op
                        )));
                    }
                    parts.push(self.render_condition(column, column_type, Op::Eq, item)?);
                }
                if parts.is_empty() {
                    return Ok(if op == Op::Or { "1=0" } else { "1=1" }.to_string());
                }
                Ok(format!("({})", parts.join(op.joiner())))
            }
            Op::ILike | Op::NotILike | Op::Regexp => {
                let pattern = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let placeholder = self.bind(SqlValue::String(pattern));
                op.render_pattern(self.dialect, column, &placeholder)
                    .ok_or_else(|| Error::UnsupportedOperator(format!("{:?}", op)))
            }
            _ => {
                let token = op
                    .comparison_sql()
                    .ok_or_else(|| Error::UnsupportedOperator(format!("{:?}", op)))?;
                let placeholder = self.bind(SqlValue::from_json(value, column_type)?);
                Ok(format!("{} {} {}", column, token, placeholder))
            }
        }
    }

    fn push_order(&mut self, model: &Model, order: Option<&[OrderItem]>) -> Result<()> {
        let Some(order) = order.filter(|o| !o.is_empty()) else {
            return Ok(());
        };
        let mut clauses = Vec::with_capacity(order.len());
        for item in order {
            let attribute = model.require_attribute(&item.column)?;
            clauses.push(format!(
                "{} {}",
                self.dialect.quote(&attribute.field),
                item.direction.to_sql()
            ));
        }
        self.sql.push_str(" ORDER BY ");
        self.sql.push_str(&clauses.join(", "));
        Ok(())
    }

    fn push_limit(&mut self, limit: Option<u64>, offset: Option<u64>) {
        let offset = offset.filter(|o| *o > 0);

        match self.dialect {
            Dialect::Oracle | Dialect::Db2 => {
                if let Some(offset) = offset {
                    self.sql.push_str(&format!(" OFFSET {} ROWS", offset));
                }
                if let Some(limit) = limit {
                    self.sql.push_str(&format!(" FETCH NEXT {} ROWS ONLY", limit));
                }
            }
            dialect => match (limit, offset) {
                (Some(limit), offset) => {
                    self.sql.push_str(&format!(" LIMIT {}", limit));
                    if let Some(offset) = offset {
                        self.sql.push_str(&format!(" OFFSET {}", offset));
                    }
                }
                // SQLite and MySQL only accept OFFSET after a LIMIT
                (None, Some(offset)) => match dialect {
                    Dialect::Sqlite => self.sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
                    Dialect::Mysql => self
                        .sql
                        .push_str(&format!(" LIMIT {} OFFSET {}", u64::MAX, offset)),
                    _ => self.sql.push_str(&format!(" OFFSET {}", offset)),
                },
                (None, None) => {}
            },
        }
    }
}

/// Decode a row selected with `columns` (in projection order).
pub fn decode_row(row: &AnyRow, columns: &[&Attribute]) -> Result<DataObject> {
    let mut object = DataObject::new();
    for (idx, attribute) in columns.iter().enumerate() {
        object.insert(
            attribute.name.clone(),
            decode_value(row, idx, attribute.column_type)?,
        );
    }
    Ok(object)
}

fn get<T>(row: &AnyRow, idx: usize) -> Option<Option<T>>
where
    T: for<'r> sqlx::Decode<'r, Any> + sqlx::Type<Any>,
{
    row.try_get::<Option<T>, _>(idx).ok()
}

/// Drivers report the same logical value with different runtime types
/// (SQLite NUMERIC may come back as integer or real, booleans as integers),
/// so each column type tries the plausible encodings in turn.
fn decode_value(row: &AnyRow, idx: usize, column_type: ColumnType) -> Result<Value> {
    let decoded = match column_type {
        ColumnType::Integer | ColumnType::Numeric | ColumnType::Float => {
            decode_number(row, idx, column_type)
        }
        ColumnType::Boolean => decode_bool(row, idx),
        ColumnType::Text | ColumnType::Timestamp => {
            decode_text(row, idx).or_else(|| decode_number(row, idx, ColumnType::Numeric))
        }
        ColumnType::Json | ColumnType::IntegerArray => decode_text(row, idx).map(|v| match v {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        }),
    };

    match decoded {
        Some(value) => Ok(value),
        None => {
            // Surface the driver's own mismatch error
            row.try_get::<Option<String>, _>(idx)?;
            Ok(Value::Null)
        }
    }
}

fn decode_text(row: &AnyRow, idx: usize) -> Option<Value> {
    get::<String>(row, idx).map(|s| s.map(Value::String).unwrap_or(Value::Null))
}

fn decode_number(row: &AnyRow, idx: usize, column_type: ColumnType) -> Option<Value> {
    if let Some(i) = get::<i64>(row, idx) {
        return Some(i.map(Value::from).unwrap_or(Value::Null));
    }
    if let Some(f) = get::<f64>(row, idx) {
        return Some(
            f.map(|f| number_from_f64(f, column_type))
                .unwrap_or(Value::Null),
        );
    }
    get::<String>(row, idx).map(|s| match s {
        Some(s) => match s.parse::<i64>() {
            Ok(i) => Value::from(i),
            Err(_) => s
                .parse::<f64>()
                .map(|f| number_from_f64(f, column_type))
                .unwrap_or(Value::String(s)),
        },
        None => Value::Null,
    })
}

fn decode_bool(row: &AnyRow, idx: usize) -> Option<Value> {
    if let Some(b) = get::<bool>(row, idx) {
        return Some(b.map(Value::Bool).unwrap_or(Value::Null));
    }
    if let Some(i) = get::<i64>(row, idx) {
        return Some(i.map(|i| Value::Bool(i != 0)).unwrap_or(Value::Null));
    }
    get::<String>(row, idx).map(|s| match s.as_deref() {
        Some("true" | "1" | "t") => Value::Bool(true),
        Some(_) => Value::Bool(false),
        None => Value::Null,
    })
}

/// Integral doubles in a numeric column are reported as integers.
fn number_from_f64(f: f64, column_type: ColumnType) -> Value {
    if column_type != ColumnType::Float && f.fract() == 0.0 && f.abs() < 9.0e15 {
        return Value::from(f as i64);
    }
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

//! Abstract query filters, as accepted by repositories.
//!
//! The shapes follow LoopBack's JSON filter syntax so filters can be taken
//! straight from a request:
//!
//! ```json
//! {
//!   "where": {"age": {"gt": 18}, "or": [{"name": "ada"}, {"name": "bob"}]},
//!   "fields": {"password": false},
//!   "order": ["age DESC", "name"],
//!   "limit": 10,
//!   "include": ["team", {"relation": "posts", "scope": {"limit": 3}}]
//! }
//! ```

pub mod compile;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use compile::{compile_fields, compile_include, compile_order, compile_where};

/// Recursive condition tree: column → value or `{operator: value}`, plus
/// `and` / `or` arrays of nested trees.
pub type Where = Map<String, Value>;

/// Field projection.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Fields {
    /// Names to select
    List(Vec<String>),
    /// Name → `true` (select) / `false` (omit)
    Flags(Map<String, Value>),
}

impl Fields {
    pub fn list<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Fields::List(names.into_iter().map(Into::into).collect())
    }

    pub fn flags<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Fields::Flags(
            flags
                .into_iter()
                .map(|(name, flag)| (name.into(), Value::Bool(flag)))
                .collect(),
        )
    }
}

/// `"age DESC"` or `["age DESC", "name"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Order {
    One(String),
    Many(Vec<String>),
}

/// Relation to eager-load: a bare relation name or a scoped request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Inclusion {
    Relation(String),
    Scoped(ScopedInclusion),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScopedInclusion {
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Box<Filter>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl Inclusion {
    pub fn relation(&self) -> &str {
        match self {
            Inclusion::Relation(name) => name,
            Inclusion::Scoped(scoped) => &scoped.relation,
        }
    }

    pub fn scope(&self) -> Option<&Filter> {
        match self {
            Inclusion::Relation(_) => None,
            Inclusion::Scoped(scoped) => scoped.scope.as_deref(),
        }
    }

    pub fn required(&self) -> bool {
        match self {
            Inclusion::Relation(_) => false,
            Inclusion::Scoped(scoped) => scoped.required.unwrap_or(false),
        }
    }

    pub fn scoped(relation: impl Into<String>, scope: Filter) -> Self {
        Inclusion::Scoped(ScopedInclusion {
            relation: relation.into(),
            scope: Some(Box::new(scope)),
            required: None,
        })
    }
}

impl From<&str> for Inclusion {
    fn from(relation: &str) -> Self {
        Inclusion::Relation(relation.to_string())
    }
}

/// Abstract filter: where / fields / order / paging / include.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_: Option<Where>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Fields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Order>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    /// Overall row cap for an inclusion scope; wins over `limit`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<Inclusion>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON filter.
    pub fn from_json(value: Value) -> crate::error::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// `offset`, falling back to `skip`.
    pub fn effective_offset(&self) -> Option<u64> {
        self.offset.or(self.skip)
    }

    /// `total_limit`, falling back to `limit`.
    pub fn effective_limit(&self) -> Option<u64> {
        self.total_limit.or(self.limit)
    }

    pub fn inclusions(&self) -> &[Inclusion] {
        self.include.as_deref().unwrap_or(&[])
    }

    pub fn with_where(mut self, where_: Value) -> Self {
        self.where_ = match where_ {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(Order::One(order.into()));
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_include(mut self, inclusion: impl Into<Inclusion>) -> Self {
        self.include
            .get_or_insert_with(Vec::new)
            .push(inclusion.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_deserialize_loopback_filter() {
        let filter = Filter::from_json(json!({
            "where": {"age": {"gt": 18}},
            "fields": ["name", "age"],
            "order": "age DESC",
            "skip": 5,
            "include": [
                "team",
                {"relation": "posts", "scope": {"totalLimit": 3, "limit": 10}, "required": true}
            ]
        }))
        .unwrap();

        assert_eq!(filter.where_.as_ref().unwrap()["age"], json!({"gt": 18}));
        assert_eq!(filter.fields, Some(Fields::list(["name", "age"])));
        assert_eq!(filter.order, Some(Order::One("age DESC".to_string())));
        assert_eq!(filter.effective_offset(), Some(5));

        let include = filter.include.unwrap();
        assert_eq!(include[0], Inclusion::Relation("team".to_string()));
        assert_eq!(include[1].relation(), "posts");
        assert!(include[1].required());
        assert_eq!(include[1].scope().unwrap().effective_limit(), Some(3));
    }

    #[test]
    fn test_field_flags() {
        let filter = Filter::from_json(json!({"fields": {"name": true, "secret": false}})).unwrap();
        assert_eq!(
            filter.fields,
            Some(Fields::flags([("name", true), ("secret", false)]))
        );
    }

    #[test]
    fn test_offset_wins_over_skip() {
        let filter = Filter {
            offset: Some(2),
            skip: Some(7),
            ..Default::default()
        };
        assert_eq!(filter.effective_offset(), Some(2));
    }
}

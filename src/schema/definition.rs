//! Declarative entity definitions supplied by the host application.
//!
//! Property types are resolved into [`PropertyType`] when a definition is
//! loaded, so an unknown type name fails here rather than deep inside schema
//! building.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::orm::DataObject;

/// Backend keys a property may carry an override block under.
pub const BACKEND_OVERRIDE_KEYS: [&str; 3] = ["postgresql", "mysql", "sqlite3"];

/// Abstract property types understood by the schema builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
}

impl PropertyType {
    /// Resolve a type name as written in a model definition.
    pub fn parse(property: &str, raw: &str) -> Result<Self> {
        match raw {
            "string" | "String" => Ok(PropertyType::String),
            "number" | "Number" => Ok(PropertyType::Number),
            "boolean" | "Boolean" => Ok(PropertyType::Boolean),
            "date" | "Date" => Ok(PropertyType::Date),
            "array" | "Array" => Ok(PropertyType::Array),
            "object" | "Object" => Ok(PropertyType::Object),
            other => Err(Error::UnhandledType {
                property: property.to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

/// Per-backend settings block on a property, e.g. `postgresql: {dataType: "float"}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendOverride {
    pub data_type: Option<String>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

impl BackendOverride {
    pub fn data_type(data_type: impl Into<String>) -> Self {
        Self {
            data_type: Some(data_type.into()),
            ..Default::default()
        }
    }

    /// Whether the override asks for a floating point column.
    pub fn is_floating_point(&self) -> bool {
        matches!(
            self.data_type.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("float" | "double precision" | "double" | "real")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    pub kind: PropertyType,
    /// Primary key flag
    pub id: bool,
    /// Value is generated by the database (auto increment)
    pub generated: bool,
    pub required: bool,
    /// Physical column name; defaults to the lower-cased property name
    pub column: Option<String>,
    /// Item type for array properties
    pub item_type: Option<PropertyType>,
    pub overrides: HashMap<String, BackendOverride>,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, kind: PropertyType) -> Self {
        Self {
            name: name.into(),
            kind,
            id: false,
            generated: false,
            required: false,
            column: None,
            item_type: None,
            overrides: HashMap::new(),
        }
    }

    pub fn id(mut self) -> Self {
        self.id = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn items(mut self, item_type: PropertyType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    pub fn override_for(mut self, backend: impl Into<String>, settings: BackendOverride) -> Self {
        self.overrides.insert(backend.into(), settings);
        self
    }

    /// Physical column name.
    pub fn column_name(&self) -> String {
        self.column
            .clone()
            .unwrap_or_else(|| self.name.to_lowercase())
    }
}

/// How a relation links the source entity to its target.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationKind {
    /// Source holds `foreign_key` pointing at the target's `target_key` (default: target id).
    BelongsTo {
        foreign_key: String,
        target_key: Option<String>,
    },
    /// Target holds `foreign_key` pointing at the source's `source_key` (default: source id).
    HasOne {
        foreign_key: String,
        source_key: Option<String>,
    },
    HasMany {
        foreign_key: String,
        source_key: Option<String>,
    },
    /// Join entity `through` holds one key per side.
    HasManyThrough {
        through: String,
        through_source_key: String,
        through_target_key: String,
    },
    /// Source holds an array column of target keys.
    ReferencesMany {
        foreign_keys: String,
        target_key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationDefinition {
    pub name: String,
    /// Target entity name, resolved against the catalog
    pub target: String,
    pub kind: RelationKind,
}

impl RelationDefinition {
    pub fn belongs_to(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::BelongsTo {
                foreign_key: foreign_key.into(),
                target_key: None,
            },
        }
    }

    pub fn has_one(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::HasOne {
                foreign_key: foreign_key.into(),
                source_key: None,
            },
        }
    }

    pub fn has_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::HasMany {
                foreign_key: foreign_key.into(),
                source_key: None,
            },
        }
    }

    pub fn has_many_through(
        name: impl Into<String>,
        target: impl Into<String>,
        through: impl Into<String>,
        through_source_key: impl Into<String>,
        through_target_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::HasManyThrough {
                through: through.into(),
                through_source_key: through_source_key.into(),
                through_target_key: through_target_key.into(),
            },
        }
    }

    pub fn references_many(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_keys: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind: RelationKind::ReferencesMany {
                foreign_keys: foreign_keys.into(),
                target_key: None,
            },
        }
    }

    /// Override the key on the target side (belongs-to, references-many).
    pub fn with_target_key(mut self, key: impl Into<String>) -> Self {
        match &mut self.kind {
            RelationKind::BelongsTo { target_key, .. }
            | RelationKind::ReferencesMany { target_key, .. } => *target_key = Some(key.into()),
            _ => {}
        }
        self
    }

    /// Override the key on the source side (has-one, has-many).
    pub fn with_source_key(mut self, key: impl Into<String>) -> Self {
        match &mut self.kind {
            RelationKind::HasOne { source_key, .. } | RelationKind::HasMany { source_key, .. } => {
                *source_key = Some(key.into())
            }
            _ => {}
        }
        self
    }

    pub fn is_references_many(&self) -> bool {
        matches!(self.kind, RelationKind::ReferencesMany { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitySettings {
    /// Properties never returned to callers
    pub hidden_properties: Vec<String>,
}

/// One entity type: ordered properties, relations and settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDefinition {
    pub name: String,
    pub properties: Vec<PropertyDefinition>,
    pub relations: Vec<RelationDefinition>,
    pub settings: EntitySettings,
}

impl EntityDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            relations: Vec::new(),
            settings: EntitySettings::default(),
        }
    }

    pub fn property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    pub fn relation(mut self, relation: RelationDefinition) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn hidden<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings
            .hidden_properties
            .extend(properties.into_iter().map(Into::into));
        self
    }

    /// Table name registered with the engine.
    pub fn table_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn property_named(&self, name: &str) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn relation_named(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn id_property(&self) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.id)
    }

    pub fn id_name(&self) -> Result<&str> {
        self.id_property()
            .map(|p| p.name.as_str())
            .ok_or_else(|| Error::MissingIdProperty(self.name.clone()))
    }

    pub fn references_many(&self) -> impl Iterator<Item = &RelationDefinition> {
        self.relations.iter().filter(|r| r.is_references_many())
    }

    /// Remove every hidden property from a materialized row.
    pub fn strip_hidden(&self, row: &mut DataObject) {
        for hidden in &self.settings.hidden_properties {
            row.remove(hidden);
        }
    }

    /// Load a LoopBack-style model definition:
    ///
    /// ```json
    /// {
    ///   "name": "User",
    ///   "properties": {"id": {"type": "number", "id": true, "generated": true}},
    ///   "relations": {"posts": {"type": "hasMany", "model": "Post", "keyTo": "userId"}},
    ///   "settings": {"hiddenProperties": ["password"]}
    /// }
    /// ```
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawEntity = serde_json::from_value(value.clone())?;
        let mut definition = EntityDefinition::new(&raw.name);

        for (name, prop) in raw.properties {
            let prop: RawProperty = match prop {
                // Shorthand `"name": "string"`
                Value::String(kind) => RawProperty {
                    kind: Value::String(kind),
                    ..Default::default()
                },
                other => serde_json::from_value(other)?,
            };
            definition.properties.push(prop.into_definition(&name)?);
        }

        for (name, rel) in raw.relations {
            let rel: RawRelation = serde_json::from_value(rel)?;
            definition
                .relations
                .push(rel.into_definition(&raw.name, &name)?);
        }

        if let Some(settings) = raw.settings {
            definition.settings.hidden_properties = settings.hidden_properties;
        }

        Ok(definition)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Self::from_json(&serde_json::from_str(s)?)
    }
}

#[derive(Deserialize)]
struct RawEntity {
    name: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    relations: Map<String, Value>,
    settings: Option<RawSettings>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawSettings {
    #[serde(default)]
    hidden_properties: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawProperty {
    #[serde(rename = "type")]
    kind: Value,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    generated: bool,
    #[serde(default)]
    required: bool,
    name: Option<String>,
    item_type: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl RawProperty {
    fn into_definition(self, name: &str) -> Result<PropertyDefinition> {
        let (kind, mut item_type) = match &self.kind {
            Value::String(raw) => (PropertyType::parse(name, raw)?, None),
            // `["number"]` is shorthand for an array of numbers
            Value::Array(items) => {
                let item = match items.first() {
                    Some(Value::String(raw)) => Some(PropertyType::parse(name, raw)?),
                    _ => None,
                };
                (PropertyType::Array, item)
            }
            other => {
                return Err(Error::UnhandledType {
                    property: name.to_string(),
                    kind: other.to_string(),
                });
            }
        };

        if let Some(ref raw) = self.item_type {
            item_type = Some(PropertyType::parse(name, raw)?);
        }

        // LoopBack accepts `id: true` as well as a numeric position
        let id = match self.id {
            Value::Bool(b) => b,
            Value::Number(ref n) => n.as_u64().is_some_and(|n| n > 0),
            _ => false,
        };

        let mut overrides = HashMap::new();
        for key in BACKEND_OVERRIDE_KEYS {
            if let Some(block) = self.rest.get(key) {
                overrides.insert(key.to_string(), serde_json::from_value(block.clone())?);
            }
        }

        Ok(PropertyDefinition {
            name: name.to_string(),
            kind,
            id,
            generated: self.generated,
            required: self.required,
            column: self.name,
            item_type,
            overrides,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRelation {
    #[serde(rename = "type")]
    kind: String,
    model: String,
    key_from: Option<String>,
    key_to: Option<String>,
    through: Option<RawThrough>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawThrough {
    model: String,
    key_from: Option<String>,
    key_to: Option<String>,
}

fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl RawRelation {
    fn into_definition(self, source: &str, name: &str) -> Result<RelationDefinition> {
        let default_source_fk = format!("{}Id", lower_first(source));

        let kind = match self.kind.as_str() {
            "belongsTo" => RelationKind::BelongsTo {
                foreign_key: self.key_from.unwrap_or_else(|| format!("{}Id", name)),
                target_key: self.key_to,
            },
            "hasOne" => RelationKind::HasOne {
                foreign_key: self.key_to.unwrap_or(default_source_fk),
                source_key: self.key_from,
            },
            "hasMany" => match self.through {
                Some(through) => RelationKind::HasManyThrough {
                    through: through.model,
                    through_source_key: through.key_from.unwrap_or(default_source_fk),
                    through_target_key: through
                        .key_to
                        .unwrap_or_else(|| format!("{}Id", lower_first(&self.model))),
                },
                None => RelationKind::HasMany {
                    foreign_key: self.key_to.unwrap_or(default_source_fk),
                    source_key: self.key_from,
                },
            },
            "referencesMany" => RelationKind::ReferencesMany {
                foreign_keys: self
                    .key_from
                    .unwrap_or_else(|| format!("{}Ids", lower_first(&self.model))),
                target_key: self.key_to,
            },
            other => {
                return Err(Error::Config(format!(
                    "relation \"{}\" on \"{}\" has unsupported type \"{}\"",
                    name, source, other
                )));
            }
        };

        Ok(RelationDefinition {
            name: name.to_string(),
            target: self.model,
            kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_type_names() {
        assert_eq!(PropertyType::parse("a", "String").unwrap(), PropertyType::String);
        assert_eq!(PropertyType::parse("a", "number").unwrap(), PropertyType::Number);
        assert_eq!(PropertyType::parse("a", "Date").unwrap(), PropertyType::Date);
        assert_matches!(
            PropertyType::parse("avatar", "buffer"),
            Err(Error::UnhandledType { property, kind }) if property == "avatar" && kind == "buffer"
        );
    }

    #[test]
    fn test_from_json() {
        let definition = EntityDefinition::from_json(&json!({
            "name": "Developer",
            "properties": {
                "id": {"type": "number", "id": true, "generated": true},
                "name": "string",
                "rating": {"type": "number", "postgresql": {"dataType": "float"}},
                "apiKey": {"type": "string", "name": "api_key"},
                "programmingLanguageIds": {"type": "array", "itemType": "number"}
            },
            "relations": {
                "programmingLanguages": {
                    "type": "referencesMany",
                    "model": "ProgrammingLanguage",
                    "keyFrom": "programmingLanguageIds"
                },
                "team": {"type": "belongsTo", "model": "Team"}
            },
            "settings": {"hiddenProperties": ["apiKey"]}
        }))
        .unwrap();

        assert_eq!(definition.table_name(), "developer");
        assert_eq!(definition.id_name().unwrap(), "id");
        let names: Vec<&str> = definition.properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["id", "name", "rating", "apiKey", "programmingLanguageIds"]
        );

        let rating = definition.property_named("rating").unwrap();
        assert!(rating.overrides["postgresql"].is_floating_point());
        assert_eq!(
            definition.property_named("apiKey").unwrap().column_name(),
            "api_key"
        );
        assert_eq!(
            definition
                .property_named("programmingLanguageIds")
                .unwrap()
                .item_type,
            Some(PropertyType::Number)
        );

        assert_eq!(
            definition.relation_named("team").unwrap().kind,
            RelationKind::BelongsTo {
                foreign_key: "teamId".to_string(),
                target_key: None
            }
        );
        assert!(
            definition
                .relation_named("programmingLanguages")
                .unwrap()
                .is_references_many()
        );
        assert_eq!(definition.settings.hidden_properties, vec!["apiKey"]);
    }

    #[test]
    fn test_from_json_rejects_unknown_type() {
        let result = EntityDefinition::from_json(&json!({
            "name": "Blob",
            "properties": {"payload": {"type": "buffer"}}
        }));
        assert_matches!(
            result,
            Err(Error::UnhandledType { property, .. }) if property == "payload"
        );
    }

    #[test]
    fn test_has_many_through_defaults() {
        let definition = EntityDefinition::from_json(&json!({
            "name": "Doctor",
            "properties": {"id": {"type": "number", "id": true}},
            "relations": {
                "patients": {
                    "type": "hasMany",
                    "model": "Patient",
                    "through": {"model": "Appointment"}
                }
            }
        }))
        .unwrap();

        assert_eq!(
            definition.relation_named("patients").unwrap().kind,
            RelationKind::HasManyThrough {
                through: "Appointment".to_string(),
                through_source_key: "doctorId".to_string(),
                through_target_key: "patientId".to_string(),
            }
        );
    }

    #[test]
    fn test_strip_hidden() {
        let definition = EntityDefinition::new("User")
            .property(PropertyDefinition::new("name", PropertyType::String))
            .property(PropertyDefinition::new("password", PropertyType::String))
            .hidden(["password"]);

        let mut row = DataObject::new();
        row.insert("name".to_string(), json!("ada"));
        row.insert("password".to_string(), json!("secret"));
        definition.strip_hidden(&mut row);

        assert_eq!(row.get("password"), None);
        assert_eq!(row.get("name"), Some(&json!("ada")));
    }
}

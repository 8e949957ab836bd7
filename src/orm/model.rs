//! Registered table models: the engine's view of an entity.

use crate::db::Dialect;
use crate::error::{Error, Result};

/// Physical column types the engine knows how to store and decode.
///
/// Arrays, JSON objects and timestamps are stored as text on every dialect
/// because they travel through the sqlx `Any` driver, which only carries
/// scalar values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Text,
    Numeric,
    Float,
    Integer,
    Boolean,
    IntegerArray,
    Json,
    Timestamp,
}

impl ColumnType {
    /// Column type as written in `CREATE TABLE` for `dialect`.
    pub fn sql_type(&self, dialect: Dialect) -> &'static str {
        use ColumnType::*;
        use Dialect::*;

        match (self, dialect) {
            (Text, Oracle) => "VARCHAR2(4000)",
            (Text, Db2) => "VARCHAR(4000)",
            (Text, _) => "TEXT",

            (Numeric, Sqlite) => "NUMERIC",
            (Numeric, Postgres) => "DOUBLE PRECISION",
            (Numeric, Oracle) => "NUMBER",
            (Numeric, _) => "DOUBLE",

            (Float, Sqlite) => "REAL",
            (Float, Postgres) => "DOUBLE PRECISION",
            (Float, Oracle) => "BINARY_DOUBLE",
            (Float, _) => "DOUBLE",

            (Integer, Sqlite) => "INTEGER",
            (Integer, Oracle) => "NUMBER(19)",
            (Integer, _) => "BIGINT",

            (Boolean, Oracle) => "NUMBER(1)",
            (Boolean, _) => "BOOLEAN",

            (IntegerArray | Json, Oracle | Db2) => "CLOB",
            (IntegerArray | Json, Mysql) => "LONGTEXT",
            (IntegerArray | Json, _) => "TEXT",

            (Timestamp, Sqlite | Postgres) => "TEXT",
            (Timestamp, Oracle) => "VARCHAR2(32)",
            (Timestamp, _) => "VARCHAR(32)",
        }
    }
}

/// One mapped column.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    /// Property name used in filters and rows
    pub name: String,
    /// Physical column name
    pub field: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub allow_null: bool,
}

impl Attribute {
    /// Generate the column definition SQL
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let name = dialect.quote(&self.field);

        if self.primary_key && self.auto_increment {
            return match dialect {
                Dialect::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", name),
                Dialect::Postgres => format!("{} BIGSERIAL PRIMARY KEY", name),
                Dialect::Mysql => format!("{} BIGINT AUTO_INCREMENT PRIMARY KEY", name),
                Dialect::Oracle => {
                    format!("{} NUMBER(19) GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY", name)
                }
                Dialect::Db2 => {
                    format!("{} BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY", name)
                }
            };
        }

        // MySQL cannot index an unbounded TEXT key
        let sql_type = match (self.column_type, dialect, self.primary_key) {
            (ColumnType::Text, Dialect::Mysql, true) => "VARCHAR(255)",
            (column_type, dialect, _) => column_type.sql_type(dialect),
        };

        let mut sql = format!("{} {}", name, sql_type);
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if !self.allow_null && !self.primary_key {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl AssociationKind {
    /// Whether the association materializes as an array of rows.
    pub fn is_multiple(&self) -> bool {
        matches!(self, AssociationKind::OneToMany | AssociationKind::ManyToMany)
    }
}

/// Join table wiring for many-to-many associations.
#[derive(Debug, Clone, PartialEq)]
pub struct Through {
    pub model: String,
    /// Attribute on the join model pointing at the source
    pub foreign_key: String,
    /// Attribute on the join model pointing at the target
    pub other_key: String,
}

/// Association wired natively into the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    /// Name callers use in `include`
    pub alias: String,
    pub kind: AssociationKind,
    pub target: String,
    /// Attribute on the source rows used for correlation
    pub source_key: String,
    /// Attribute on the target rows matched against `source_key`
    pub target_key: String,
    pub through: Option<Through>,
}

/// Registered table model (the schema handle for one entity on one connection).
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub table: String,
    pub attributes: Vec<Attribute>,
    pub associations: Vec<Association>,
}

impl Model {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn require_attribute(&self, name: &str) -> Result<&Attribute> {
        self.attribute(name).ok_or_else(|| Error::UnknownAttribute {
            entity: self.name.clone(),
            attribute: name.to_string(),
        })
    }

    pub fn primary_key(&self) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.primary_key)
    }

    pub fn association(&self, alias: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.alias == alias)
    }

    /// Generate CREATE TABLE IF NOT EXISTS SQL
    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let column_defs: Vec<String> = self.attributes.iter().map(|a| a.to_sql(dialect)).collect();

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            dialect.quote(&self.table),
            column_defs.join(",\n  ")
        )
    }

    pub fn drop_table_sql(&self, dialect: Dialect) -> String {
        format!("DROP TABLE IF EXISTS {}", dialect.quote(&self.table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn user_model() -> Model {
        Model {
            name: "User".to_string(),
            table: "user".to_string(),
            attributes: vec![
                Attribute {
                    name: "id".to_string(),
                    field: "id".to_string(),
                    column_type: ColumnType::Integer,
                    primary_key: true,
                    auto_increment: true,
                    allow_null: false,
                },
                Attribute {
                    name: "email".to_string(),
                    field: "email".to_string(),
                    column_type: ColumnType::Text,
                    primary_key: false,
                    auto_increment: false,
                    allow_null: false,
                },
                Attribute {
                    name: "age".to_string(),
                    field: "age".to_string(),
                    column_type: ColumnType::Numeric,
                    primary_key: false,
                    auto_increment: false,
                    allow_null: true,
                },
            ],
            associations: Vec::new(),
        }
    }

    #[test]
    fn test_create_table_sqlite() {
        assert_eq!(
            user_model().create_table_sql(Dialect::Sqlite),
            "CREATE TABLE IF NOT EXISTS \"user\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  \"email\" TEXT NOT NULL,\n  \"age\" NUMERIC\n)"
        );
    }

    #[test]
    fn test_create_table_mysql() {
        let sql = user_model().create_table_sql(Dialect::Mysql);
        assert!(sql.contains("`id` BIGINT AUTO_INCREMENT PRIMARY KEY"));
        assert!(sql.contains("`age` DOUBLE"));
    }

    #[test]
    fn test_lookup() {
        let model = user_model();
        assert_eq!(model.primary_key().unwrap().name, "id");
        assert!(model.require_attribute("age").is_ok());
        assert!(model.require_attribute("nickname").is_err());
    }
}

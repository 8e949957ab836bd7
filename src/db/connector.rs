//! Connector ids accepted from host configuration and the SQL dialects they map to.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Connector ids a host may put in `DataSourceConfig::connector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connector {
    Mysql,
    Postgresql,
    Oracle,
    Sqlite3,
    Db2,
}

impl Connector {
    pub const ALL: [Connector; 5] = [
        Connector::Mysql,
        Connector::Postgresql,
        Connector::Oracle,
        Connector::Sqlite3,
        Connector::Db2,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Connector::Mysql => "mysql",
            Connector::Postgresql => "postgresql",
            Connector::Oracle => "oracle",
            Connector::Sqlite3 => "sqlite3",
            Connector::Db2 => "db2",
        }
    }

    /// Equivalent engine dialect for this connector.
    pub fn dialect(&self) -> Dialect {
        match self {
            Connector::Mysql => Dialect::Mysql,
            Connector::Postgresql => Dialect::Postgres,
            Connector::Oracle => Dialect::Oracle,
            Connector::Sqlite3 => Dialect::Sqlite,
            Connector::Db2 => Dialect::Db2,
        }
    }
}

impl FromStr for Connector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Connector::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::UnsupportedConnector(s.to_string()))
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SQL dialect the engine renders statements for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Mysql,
    Postgres,
    Oracle,
    Sqlite,
    Db2,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Mysql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Oracle => "oracle",
            Dialect::Sqlite => "sqlite",
            Dialect::Db2 => "db2",
        }
    }

    /// Parse an explicit `dialect` config value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Dialect::Mysql),
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "oracle" => Some(Dialect::Oracle),
            "sqlite" | "sqlite3" => Some(Dialect::Sqlite),
            "db2" => Some(Dialect::Db2),
            _ => None,
        }
    }

    /// URL scheme understood by the sqlx `Any` driver registry.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            Dialect::Mysql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Oracle => "oracle",
            Dialect::Sqlite => "sqlite",
            Dialect::Db2 => "db2",
        }
    }

    /// Whether sqlx ships a driver for this dialect at all.
    pub fn has_driver(&self) -> bool {
        matches!(self, Dialect::Mysql | Dialect::Postgres | Dialect::Sqlite)
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Dialect::Mysql => Some(3306),
            Dialect::Postgres => Some(5432),
            Dialect::Oracle => Some(1521),
            Dialect::Db2 => Some(50000),
            Dialect::Sqlite => None,
        }
    }

    pub fn supports_returning(&self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Mysql => format!("`{}`", ident.replace('`', "``")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Bind placeholder for the `index`-th (1-based) parameter.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Oracle => format!(":{}", index),
            Dialect::Mysql | Dialect::Sqlite | Dialect::Db2 => "?".to_string(),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_connector_mapping() {
        assert_eq!(Connector::Mysql.dialect(), Dialect::Mysql);
        assert_eq!(Connector::Postgresql.dialect(), Dialect::Postgres);
        assert_eq!(Connector::Oracle.dialect(), Dialect::Oracle);
        assert_eq!(Connector::Sqlite3.dialect(), Dialect::Sqlite);
        assert_eq!(Connector::Db2.dialect(), Dialect::Db2);
    }

    #[test]
    fn test_connector_parse() {
        assert_eq!("sqlite3".parse::<Connector>().unwrap(), Connector::Sqlite3);
        assert_eq!(
            "postgresql".parse::<Connector>().unwrap(),
            Connector::Postgresql
        );
        assert_matches!(
            "mongodb".parse::<Connector>(),
            Err(Error::UnsupportedConnector(c)) if c == "mongodb"
        );
        // Dialect names are not connector ids
        assert!("postgres".parse::<Connector>().is_err());
    }

    #[test]
    fn test_dialect_rendering() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?");
        assert_eq!(Dialect::Mysql.quote("a`b"), "`a``b`");
        assert_eq!(Dialect::Sqlite.quote("user\"name"), "\"user\"\"name\"");
        assert!(Dialect::Sqlite.supports_returning());
        assert!(!Dialect::Mysql.supports_returning());
        assert!(!Dialect::Db2.has_driver());
    }
}

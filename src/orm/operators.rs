//! Operator translation from filter operator names to engine operators.

use crate::db::Dialect;
use crate::error::{Error, Result};

/// Comparison and logical operators the engine can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    In,
    NotIn,
    Like,
    NotLike,
    ILike,
    NotILike,
    /// Renders `REGEXP` on MySQL and SQLite. SQLite ships no `REGEXP`
    /// function, so on a plain SQLite connection the query fails with a
    /// database error unless the host registers one.
    Regexp,
    And,
    Or,
}

/// Translate a filter operator name (`eq`, `inq`, `nlike`, ...) to an engine operator.
pub fn translate(name: &str) -> Result<Op> {
    let op = match name {
        "eq" => Op::Eq,
        "neq" => Op::Ne,
        "gt" => Op::Gt,
        "gte" => Op::Gte,
        "lt" => Op::Lt,
        "lte" => Op::Lte,
        "between" => Op::Between,
        "inq" => Op::In,
        "nin" => Op::NotIn,
        "like" => Op::Like,
        "nlike" => Op::NotLike,
        "ilike" => Op::ILike,
        "nilike" => Op::NotILike,
        "regexp" => Op::Regexp,
        "and" => Op::And,
        "or" => Op::Or,
        other => return Err(Error::UnsupportedOperator(other.to_string())),
    };
    Ok(op)
}

impl Op {
    pub fn is_logical(&self) -> bool {
        matches!(self, Op::And | Op::Or)
    }

    /// SQL token for binary comparison operators. `None` for operators that
    /// need a dedicated rendering (ranges, lists, case folding, regex, logic).
    pub fn comparison_sql(&self) -> Option<&'static str> {
        match self {
            Op::Eq => Some("="),
            Op::Ne => Some("<>"),
            Op::Gt => Some(">"),
            Op::Gte => Some(">="),
            Op::Lt => Some("<"),
            Op::Lte => Some("<="),
            Op::Like => Some("LIKE"),
            Op::NotLike => Some("NOT LIKE"),
            _ => None,
        }
    }

    /// Keyword joining branches of a logical operator.
    pub fn joiner(&self) -> &'static str {
        match self {
            Op::Or => " OR ",
            _ => " AND ",
        }
    }

    /// Render `column <op> placeholder` for the case-insensitive and regex operators.
    pub fn render_pattern(&self, dialect: Dialect, column: &str, placeholder: &str) -> Option<String> {
        let sql = match (self, dialect) {
            (Op::ILike, Dialect::Postgres) => format!("{} ILIKE {}", column, placeholder),
            (Op::NotILike, Dialect::Postgres) => format!("{} NOT ILIKE {}", column, placeholder),
            (Op::ILike, _) => format!("LOWER({}) LIKE LOWER({})", column, placeholder),
            (Op::NotILike, _) => format!("LOWER({}) NOT LIKE LOWER({})", column, placeholder),
            (Op::Regexp, Dialect::Postgres) => format!("{} ~ {}", column, placeholder),
            (Op::Regexp, Dialect::Mysql | Dialect::Sqlite) => {
                format!("{} REGEXP {}", column, placeholder)
            }
            (Op::Regexp, Dialect::Oracle | Dialect::Db2) => {
                format!("REGEXP_LIKE({}, {})", column, placeholder)
            }
            _ => return None,
        };
        Some(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_translation_table() {
        let table = [
            ("eq", Op::Eq),
            ("neq", Op::Ne),
            ("gt", Op::Gt),
            ("gte", Op::Gte),
            ("lt", Op::Lt),
            ("lte", Op::Lte),
            ("between", Op::Between),
            ("inq", Op::In),
            ("nin", Op::NotIn),
            ("like", Op::Like),
            ("nlike", Op::NotLike),
            ("ilike", Op::ILike),
            ("nilike", Op::NotILike),
            ("regexp", Op::Regexp),
            ("and", Op::And),
            ("or", Op::Or),
        ];
        for (name, op) in table {
            assert_eq!(translate(name).unwrap(), op, "operator {}", name);
        }
    }

    #[test]
    fn test_unsupported_operator() {
        assert_matches!(
            translate("exists"),
            Err(Error::UnsupportedOperator(name)) if name == "exists"
        );
        assert!(translate("near").is_err());
        assert!(translate("EQ").is_err());
    }

    #[test]
    fn test_pattern_rendering() {
        assert_eq!(
            Op::ILike.render_pattern(Dialect::Postgres, "\"name\"", "$1").unwrap(),
            "\"name\" ILIKE $1"
        );
        assert_eq!(
            Op::NotILike.render_pattern(Dialect::Sqlite, "\"name\"", "?").unwrap(),
            "LOWER(\"name\") NOT LIKE LOWER(?)"
        );
        assert_eq!(
            Op::Regexp.render_pattern(Dialect::Mysql, "`name`", "?").unwrap(),
            "`name` REGEXP ?"
        );
        assert!(Op::Eq.render_pattern(Dialect::Sqlite, "a", "?").is_none());
    }
}

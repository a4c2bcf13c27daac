use sqlparser::ast::{Expr, Ident, Statement};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;

use crate::error::{PoolError, Result};

/// SQL validation service for ensuring queries are safe and valid
pub struct SqlValidator;

impl SqlValidator {
    /// Validate that `sql` is exactly one read-only query.
    ///
    /// Returns the query text without trailing semicolons, ready to be nested as a
    /// subquery.
    pub fn validate_select_only(sql: &str, dialect: &dyn Dialect) -> Result<String> {
        let normalized = Self::normalize(sql);
        if normalized.is_empty() {
            return Err(PoolError::InvalidSql("Empty SQL query".to_string()));
        }

        let ast = Parser::parse_sql(dialect, normalized)
            .map_err(|e| PoolError::InvalidSql(format!("SQL parsing error: {}", e)))?;

        match ast.as_slice() {
            [] => Err(PoolError::InvalidSql("Empty SQL query".to_string())),
            [Statement::Query(_)] => Ok(normalized.to_string()),
            [stmt] => Err(PoolError::InvalidSql(format!(
                "Only SELECT queries are permitted. Found: {}",
                statement_kind(stmt)
            ))),
            _ => Err(PoolError::InvalidSql(format!(
                "Expected a single query, found {} statements",
                ast.len()
            ))),
        }
    }

    /// Validate a partition column reference such as `a`, `"Order Id"` or `t.a`.
    pub fn validate_column(column: &str, dialect: &dyn Dialect) -> Result<String> {
        Self::column_parts(column, dialect)?;
        Ok(column.trim().to_string())
    }

    /// Name a column reference resolves to outside the query that produced it.
    ///
    /// `t.a` becomes `a`; quoting is kept, so `"Order Id"` stays quoted.
    pub fn output_column(column: &str, dialect: &dyn Dialect) -> Result<String> {
        Self::column_parts(column, dialect)?
            .last()
            .map(Ident::to_string)
            .ok_or_else(|| {
                PoolError::InvalidArgument(format!("partition column {} is empty", column))
            })
    }

    fn column_parts(column: &str, dialect: &dyn Dialect) -> Result<Vec<Ident>> {
        let column = column.trim();
        if column.is_empty() {
            return Err(PoolError::InvalidArgument(
                "partition_on must name a column".to_string(),
            ));
        }
        let expr = Parser::new(dialect)
            .try_with_sql(column)
            .and_then(|mut parser| {
                let expr = parser.parse_expr()?;
                parser.expect_token(&sqlparser::tokenizer::Token::EOF)?;
                Ok(expr)
            })
            .map_err(|e| {
                PoolError::InvalidArgument(format!("invalid partition column {}: {}", column, e))
            })?;

        match expr {
            Expr::Identifier(ident) => Ok(vec![ident]),
            Expr::CompoundIdentifier(idents) => Ok(idents),
            _ => Err(PoolError::InvalidArgument(format!(
                "partition column {} is not a column reference",
                column
            ))),
        }
    }

    fn normalize(sql: &str) -> &str {
        sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
    }
}

fn statement_kind(stmt: &Statement) -> &'static str {
    match stmt {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::Truncate { .. } => "TRUNCATE",
        _ => "a non-query statement",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::{PostgreSqlDialect, SQLiteDialect};

    #[test]
    fn test_validate_select_only() {
        let dialect = PostgreSqlDialect {};
        // Valid SELECT
        assert!(SqlValidator::validate_select_only("SELECT * FROM users", &dialect).is_ok());

        // Invalid INSERT
        assert!(SqlValidator::validate_select_only("INSERT INTO users VALUES (1)", &dialect).is_err());

        // Invalid UPDATE
        assert!(SqlValidator::validate_select_only("UPDATE users SET name = 'test'", &dialect).is_err());

        // Invalid DELETE
        let err = SqlValidator::validate_select_only("DELETE FROM users", &dialect).unwrap_err();
        assert!(err.to_string().contains("DELETE"));
    }

    #[test]
    fn test_trailing_semicolons_are_removed() {
        let sql = SqlValidator::validate_select_only("SELECT * FROM t ;; \n", &SQLiteDialect {})
            .unwrap();
        assert_eq!(sql, "SELECT * FROM t");
    }

    #[test]
    fn test_multiple_statements_are_rejected() {
        let err =
            SqlValidator::validate_select_only("SELECT 1; SELECT 2", &SQLiteDialect {}).unwrap_err();
        assert!(matches!(err, PoolError::InvalidSql(_)));
        assert!(SqlValidator::validate_select_only("   ", &SQLiteDialect {}).is_err());
    }

    #[test]
    fn test_validate_column() {
        let dialect = PostgreSqlDialect {};
        assert_eq!(SqlValidator::validate_column("a", &dialect).unwrap(), "a");
        assert_eq!(SqlValidator::validate_column("t.a", &dialect).unwrap(), "t.a");
        assert!(SqlValidator::validate_column("\"Order Id\"", &dialect).is_ok());
        assert!(SqlValidator::validate_column("", &dialect).is_err());
        assert!(SqlValidator::validate_column("a; DROP TABLE t", &dialect).is_err());
        assert!(SqlValidator::validate_column("a + 1", &dialect).is_err());
    }

    #[test]
    fn test_output_column_drops_qualifier() {
        let dialect = PostgreSqlDialect {};
        assert_eq!(SqlValidator::output_column("a", &dialect).unwrap(), "a");
        assert_eq!(SqlValidator::output_column("t.a", &dialect).unwrap(), "a");
        assert_eq!(SqlValidator::output_column("s.t.a", &dialect).unwrap(), "a");
        assert_eq!(
            SqlValidator::output_column("t.\"Order Id\"", &dialect).unwrap(),
            "\"Order Id\""
        );
        assert!(SqlValidator::output_column("a + 1", &dialect).is_err());
    }
}

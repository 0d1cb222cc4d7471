use std::collections::BTreeSet;
use std::ops::ControlFlow;

use sqlparser::ast::{visit_expressions, Expr, SelectItem, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Safety and shape checks for SQL payloads sent to relational sources.
pub struct PayloadValidator;

impl PayloadValidator {
    fn parse(sql: &str) -> Result<Vec<Statement>, String> {
        let dialect = PostgreSqlDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(sql)
            .map_err(|e| format!("SQL parsing error: {}", e))?;
        let statements = parser
            .parse_statements()
            .map_err(|e| format!("SQL parsing error: {}", e))?;
        if statements.is_empty() {
            return Err("Empty SQL query".to_string());
        }
        Ok(statements)
    }

    /// Accept exactly one read-only query.
    pub fn validate_select_only(sql: &str) -> Result<(), String> {
        let statements = Self::parse(sql)?;
        if statements.len() > 1 {
            return Err("Only a single statement is permitted".to_string());
        }
        match &statements[0] {
            Statement::Query(_) => Ok(()),
            Statement::Insert { .. } => Err("INSERT statements are not allowed".to_string()),
            Statement::Update { .. } => Err("UPDATE statements are not allowed".to_string()),
            Statement::Delete { .. } => Err("DELETE statements are not allowed".to_string()),
            Statement::Drop { .. } => Err("DROP statements are not allowed".to_string()),
            other => Err(format!(
                "Only SELECT queries are permitted. Found: {}",
                other.to_string().split_whitespace().next().unwrap_or("statement")
            )),
        }
    }

    /// Column names referenced by the query, lowercased, with projection aliases removed.
    ///
    /// Qualified references (`u.id`) contribute their last segment.
    pub fn referenced_columns(sql: &str) -> Result<BTreeSet<String>, String> {
        let statements = Self::parse(sql)?;
        let mut columns = BTreeSet::new();
        let mut aliases = BTreeSet::new();

        for statement in &statements {
            if let Statement::Query(query) = statement {
                if let SetExpr::Select(select) = query.body.as_ref() {
                    for item in &select.projection {
                        if let SelectItem::ExprWithAlias { alias, .. } = item {
                            aliases.insert(alias.value.to_lowercase());
                        }
                    }
                }
            }

            let _ = visit_expressions(statement, |expr| {
                match expr {
                    Expr::Identifier(ident) => {
                        columns.insert(ident.value.to_lowercase());
                    }
                    Expr::CompoundIdentifier(idents) => {
                        if let Some(last) = idents.last() {
                            columns.insert(last.value.to_lowercase());
                        }
                    }
                    _ => {}
                }
                ControlFlow::<()>::Continue(())
            });
        }

        Ok(columns.difference(&aliases).cloned().collect())
    }

    /// Append a LIMIT when the query has none.
    pub fn ensure_limit(sql: &str, default_limit: u64) -> Result<String, String> {
        let statements = Self::parse(sql)?;
        let has_limit = match &statements[0] {
            Statement::Query(query) => query.limit_clause.is_some(),
            _ => false,
        };
        if has_limit {
            Ok(sql.to_string())
        } else {
            let trimmed = sql.trim().trim_end_matches(';').trim_end();
            Ok(format!("{} LIMIT {}", trimmed, default_limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_select_only() {
        assert!(PayloadValidator::validate_select_only("SELECT * FROM users").is_ok());
        assert!(PayloadValidator::validate_select_only("INSERT INTO users VALUES (1)").is_err());
        assert!(PayloadValidator::validate_select_only("UPDATE users SET name = 'x'").is_err());
        assert!(PayloadValidator::validate_select_only("DELETE FROM users").is_err());
        assert!(PayloadValidator::validate_select_only("SELECT 1; DROP TABLE users").is_err());
        assert!(PayloadValidator::validate_select_only("").is_err());
    }

    #[test]
    fn test_referenced_columns() {
        let cols = PayloadValidator::referenced_columns(
            "SELECT u.id, name, SUM(amount) AS total FROM users u WHERE region = 'eu' GROUP BY u.id, name ORDER BY total",
        )
        .unwrap();
        let cols: Vec<&str> = cols.iter().map(String::as_str).collect();
        assert_eq!(cols, vec!["amount", "id", "name", "region"]);
    }

    #[test]
    fn test_wildcard_references_nothing() {
        assert!(PayloadValidator::referenced_columns("SELECT * FROM users")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_ensure_limit() {
        let sql = PayloadValidator::ensure_limit("SELECT * FROM users;", 100).unwrap();
        assert_eq!(sql, "SELECT * FROM users LIMIT 100");

        let sql = "SELECT * FROM table_limit LIMIT 5";
        assert_eq!(PayloadValidator::ensure_limit(sql, 100).unwrap(), sql);
    }
}

//! Input hygiene for configuration-supplied SQL fragments.
//!
//! Table names, column names, row filters, and regex patterns all originate
//! in control tables and end up spliced into SQL. Everything passes through
//! here first; a rejected value is a [`DatacraftError::Security`] raised at
//! configuration-load time, before any data is touched.

use crate::error::{DatacraftError, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// SQL identifier and expression validation utilities.
pub struct SqlGuard;

static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    // Letters, numbers, underscores; dots allowed for qualified names.
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z_][a-zA-Z0-9_]*)*$")
        .expect("hard-coded regex pattern is valid")
});

/// Tokens that must never appear inside a configured row filter. Filters are
/// restricted to plain predicates over the dataset's own columns.
const FORBIDDEN_FILTER_TOKENS: &[&str] = &[
    ";", "--", "/*", "*/", "insert ", "update ", "delete ", "drop ", "alter ", "create ",
    "attach ", "copy ", "pragma ",
];

impl SqlGuard {
    /// Validates a SQL identifier (table or column name) without escaping it.
    pub fn validate_identifier(identifier: &str) -> Result<()> {
        if identifier.trim().is_empty() {
            return Err(DatacraftError::Security(
                "SQL identifier cannot be empty".to_string(),
            ));
        }
        if identifier.len() > 128 {
            return Err(DatacraftError::Security(format!(
                "SQL identifier too long ({} characters, max 128)",
                identifier.len()
            )));
        }
        if identifier.contains('\0') {
            return Err(DatacraftError::Security(
                "SQL identifier cannot contain null bytes".to_string(),
            ));
        }
        if !IDENTIFIER_REGEX.is_match(identifier) {
            return Err(DatacraftError::Security(format!(
                "invalid SQL identifier '{identifier}': identifiers must start with a letter or \
                 underscore and contain only letters, numbers, underscores, and dots"
            )));
        }
        Ok(())
    }

    /// Validates and escapes a SQL identifier for direct use in a query.
    pub fn escape_identifier(identifier: &str) -> Result<String> {
        Self::validate_identifier(identifier)?;
        let escaped = identifier.replace('"', "\"\"");
        Ok(format!("\"{escaped}\""))
    }

    /// Validates a configured row-filter predicate.
    ///
    /// Filters are appended to the `WHERE` clause of generated queries, so
    /// they may contain comparisons and literals but never statement
    /// separators or DML/DDL keywords.
    pub fn validate_filter(filter: &str) -> Result<()> {
        if filter.trim().is_empty() {
            return Err(DatacraftError::Security(
                "row filter cannot be empty".to_string(),
            ));
        }
        if filter.len() > 1024 {
            return Err(DatacraftError::Security(
                "row filter too long (max 1024 characters)".to_string(),
            ));
        }
        let lowered = filter.to_lowercase();
        for token in FORBIDDEN_FILTER_TOKENS {
            if lowered.contains(token) {
                return Err(DatacraftError::Security(format!(
                    "row filter contains forbidden token '{}'",
                    token.trim()
                )));
            }
        }
        Ok(())
    }

    /// Escapes a string literal for embedding in generated SQL.
    pub fn escape_literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Validates a configured regex pattern and confirms it compiles.
    pub fn validate_pattern(pattern: &str) -> Result<()> {
        if pattern.len() > 512 {
            return Err(DatacraftError::Security(
                "regex pattern too long (max 512 characters)".to_string(),
            ));
        }
        Regex::new(pattern).map_err(|e| {
            DatacraftError::Security(format!("invalid regex pattern '{pattern}': {e}"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(SqlGuard::validate_identifier("customer_id").is_ok());
        assert!(SqlGuard::validate_identifier("silver.orders").is_ok());
        assert!(SqlGuard::validate_identifier("_t1").is_ok());
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(SqlGuard::validate_identifier("id; DROP TABLE users--").is_err());
        assert!(SqlGuard::validate_identifier("").is_err());
        assert!(SqlGuard::validate_identifier(&"x".repeat(200)).is_err());
        assert!(SqlGuard::validate_identifier("1starts_with_digit").is_err());
    }

    #[test]
    fn escape_quotes_identifier() {
        assert_eq!(SqlGuard::escape_identifier("region").unwrap(), "\"region\"");
    }

    #[test]
    fn filter_allows_predicates_only() {
        assert!(SqlGuard::validate_filter("country = 'US' AND amount > 10").is_ok());
        assert!(SqlGuard::validate_filter("1=1; DROP TABLE t").is_err());
        assert!(SqlGuard::validate_filter("x = 1 -- comment").is_err());
        assert!(SqlGuard::validate_filter("").is_err());
    }

    #[test]
    fn literal_escaping_doubles_quotes() {
        assert_eq!(SqlGuard::escape_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn pattern_must_compile() {
        assert!(SqlGuard::validate_pattern(r"^[A-Z]{2}\d+$").is_ok());
        assert!(SqlGuard::validate_pattern(r"([unclosed").is_err());
    }
}

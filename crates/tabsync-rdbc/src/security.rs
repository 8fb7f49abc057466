//! SQL injection prevention helpers.
//!
//! Table and field names reach generated SQL as quoted identifiers, so they are
//! validated once at configuration time. Everything a client sends travels as
//! a bound parameter; the only client text that needs rewriting is a LIKE
//! pattern, where `%`, `_` and the escape character itself are meaningful.

use crate::error::Error;

/// Character used in `LIKE ... ESCAPE` clauses
pub const LIKE_ESCAPE: char = '\\';

/// Validate a SQL identifier (table or column name).
///
/// Rules:
/// - Must not be empty
/// - Maximum 63 bytes (the PostgreSQL `NAMEDATALEN` limit)
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use tabsync_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("readings").is_ok());
/// assert!(validate_sql_identifier("sensor_id_2").is_ok());
/// assert!(validate_sql_identifier("_private").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 63 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 63)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}

/// Escape LIKE metacharacters so `value` matches only itself.
///
/// Meant to be used with `ESCAPE '\'`.
///
/// ```
/// use tabsync_rdbc::security::escape_like_pattern;
///
/// assert_eq!(escape_like_pattern("50%_off"), "50\\%\\_off");
/// assert_eq!(escape_like_pattern("a\\b"), "a\\\\b");
/// ```
pub fn escape_like_pattern(value: &str) -> String {
    if !value.contains(['%', '_', LIKE_ESCAPE]) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        if c == '%' || c == '_' || c == LIKE_ESCAPE {
            out.push(LIKE_ESCAPE);
        }
        out.push(c);
    }
    out
}

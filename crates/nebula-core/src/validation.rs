//! Input validation for NebulaDB
//!
//! Provides validation functions to prevent:
//! - SQL injection through table, column, or sort identifiers
//! - Path traversal through database identifiers
//! - Records that do not match their table schema
//! - Platform-level statements in tenant SQL

use crate::{FieldValue, NebulaError, Record, Result, TableSchema, SYSTEM_COLUMNS};
use std::collections::HashSet;

/// Maximum length for generic identifiers (project ids, user ids)
pub const MAX_IDENTIFIER_LEN: usize = 100;

/// Maximum length for table, column, and index names
pub const MAX_TABLE_NAME_LEN: usize = 63;

/// Maximum number of user columns per table
pub const MAX_COLUMNS: usize = 200;

/// Maximum length of a direct SQL statement
pub const MAX_SQL_LEN: usize = 100_000;

/// Name prefixes owned by SQLite and by the tenant store itself
pub const RESERVED_NAME_PREFIXES: &[&str] = &["sqlite_", "_nebula"];

/// Leading keyword sequences of statements tenants may never execute
const FORBIDDEN_STATEMENTS: &[&[&str]] = &[
    &["attach"],
    &["detach"],
    &["pragma"],
    &["vacuum"],
    &["truncate"],
    &["grant"],
    &["revoke"],
    &["drop", "database"],
    &["drop", "schema"],
    &["drop", "user"],
    &["drop", "role"],
    &["create", "user"],
    &["create", "role"],
    &["alter", "user"],
];

/// Functions tenants may never call
const FORBIDDEN_FUNCTIONS: &[&str] = &["load_extension"];

/// Validate a generic identifier
///
/// Requirements:
/// - Not empty
/// - <= 100 characters
/// - Alphanumeric, underscore, hyphen only
pub fn validate_identifier(identifier: &str, field_name: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(NebulaError::ValidationError(format!(
            "{} cannot be empty",
            field_name
        )));
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(NebulaError::ValidationError(format!(
            "{} too long: {} > {} characters",
            field_name,
            identifier.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(NebulaError::ValidationError(format!(
            "{} contains invalid characters (allowed: alphanumeric, _, -)",
            field_name
        )));
    }

    Ok(())
}

/// Validate a SQL object name (table, column, index)
///
/// Requirements:
/// - Not empty
/// - <= 63 characters
/// - ASCII alphanumeric and underscore only
/// - Starts with a letter or underscore
/// - Not in a reserved namespace (`sqlite_`, `_nebula`)
fn validate_sql_name(name: &str, kind: &str) -> Result<()> {
    if name.is_empty() {
        return Err(NebulaError::ValidationError(format!(
            "{} name cannot be empty",
            kind
        )));
    }

    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(NebulaError::ValidationError(format!(
            "{} name too long: {} > {} characters",
            kind,
            name.len(),
            MAX_TABLE_NAME_LEN
        )));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(NebulaError::ValidationError(format!(
            "{} name contains invalid characters (allowed: alphanumeric, _)",
            kind
        )));
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(NebulaError::ValidationError(format!(
            "{} name cannot start with a digit",
            kind
        )));
    }

    let lowered = name.to_ascii_lowercase();
    if let Some(prefix) = RESERVED_NAME_PREFIXES.iter().find(|p| lowered.starts_with(*p)) {
        return Err(NebulaError::ValidationError(format!(
            "{} name uses the reserved '{}' prefix",
            kind, prefix
        )));
    }

    Ok(())
}

pub fn validate_table_name(name: &str) -> Result<()> {
    validate_sql_name(name, "Table")
}

pub fn validate_column_name(name: &str) -> Result<()> {
    validate_sql_name(name, "Column")
}

/// Whether `name` is one of the server-managed columns.
pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS
        .iter()
        .any(|c| c.eq_ignore_ascii_case(name))
}

/// Validate a table definition before it is registered.
pub fn validate_table_schema(schema: &TableSchema) -> Result<()> {
    validate_table_name(&schema.name)?;

    if schema.columns.is_empty() {
        return Err(NebulaError::ValidationError(
            "Table must define at least one column".to_string(),
        ));
    }

    if schema.columns.len() > MAX_COLUMNS {
        return Err(NebulaError::ValidationError(format!(
            "Too many columns: {} > {}",
            schema.columns.len(),
            MAX_COLUMNS
        )));
    }

    let mut seen = HashSet::new();
    for column in &schema.columns {
        validate_column_name(&column.name)?;
        if is_system_column(&column.name) {
            return Err(NebulaError::ValidationError(format!(
                "Column '{}' is managed by the server and cannot be declared",
                column.name
            )));
        }
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(NebulaError::ValidationError(format!(
                "Duplicate column '{}'",
                column.name
            )));
        }
    }

    let mut index_names = HashSet::new();
    for index in &schema.indexes {
        validate_sql_name(&index.name, "Index")?;
        if !index_names.insert(index.name.to_ascii_lowercase()) {
            return Err(NebulaError::ValidationError(format!(
                "Duplicate index '{}'",
                index.name
            )));
        }
        if index.columns.is_empty() {
            return Err(NebulaError::ValidationError(format!(
                "Index '{}' must cover at least one column",
                index.name
            )));
        }
        for column in &index.columns {
            if !schema.is_sortable(column) {
                return Err(NebulaError::ValidationError(format!(
                    "Index '{}' references unknown column '{}'",
                    index.name, column
                )));
            }
        }
    }

    Ok(())
}

/// Convert each supplied field with its column type, rejecting unknown and system columns.
fn convert_fields(
    schema: &TableSchema,
    data: &serde_json::Map<String, serde_json::Value>,
) -> Result<Record> {
    if data.is_empty() {
        return Err(NebulaError::ValidationError(
            "Record data cannot be empty".to_string(),
        ));
    }

    let mut record = Record::new();
    for (name, value) in data {
        if is_system_column(name) {
            return Err(NebulaError::ValidationError(format!(
                "Column '{}' is managed by the server",
                name
            )));
        }
        let column = schema.column(name).ok_or_else(|| {
            NebulaError::ValidationError(format!(
                "Unknown column '{}' for table '{}'",
                name, schema.name
            ))
        })?;
        let converted = FieldValue::from_json(name, column.column_type, value)?;
        if column.required && converted.is_null() {
            return Err(NebulaError::ValidationError(format!(
                "Column '{}' is required and cannot be null",
                name
            )));
        }
        record.insert(name.clone(), converted);
    }
    Ok(record)
}

/// Validate a create payload against the table schema.
///
/// Every required column must be present and non-null; supplied values must
/// match their declared types.
pub fn validate_new_record(
    schema: &TableSchema,
    data: &serde_json::Map<String, serde_json::Value>,
) -> Result<Record> {
    let record = convert_fields(schema, data)?;

    if let Some(missing) = schema
        .columns
        .iter()
        .find(|c| c.required && !record.contains(&c.name))
    {
        return Err(NebulaError::ValidationError(format!(
            "Missing required column '{}'",
            missing.name
        )));
    }

    Ok(record)
}

/// Validate a partial update payload against the table schema.
///
/// Only the supplied columns are checked; absent required columns are fine
/// because they keep their stored value.
pub fn validate_record_patch(
    schema: &TableSchema,
    data: &serde_json::Map<String, serde_json::Value>,
) -> Result<Record> {
    convert_fields(schema, data)
}

/// Quote a validated identifier for interpolation into SQL text.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Lowercased keywords and identifiers of `query`, in order.
///
/// String literals, quoted identifiers, and comments are skipped. Statement
/// separators are kept as `;` so each statement's leading words can be found.
fn sql_words(query: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' {
            current.extend(c.to_lowercase());
            continue;
        }
        if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        match c {
            '\'' | '"' | '`' => {
                while let Some(next) = chars.next() {
                    if next == c {
                        // A doubled quote is an escaped quote inside the literal.
                        if chars.peek() == Some(&c) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '[' => {
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
            }
            ';' => words.push(";".to_string()),
            _ => {}
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Reject tenant SQL that targets platform-level objects
///
/// Each statement's leading keywords are matched, so data such as
/// `WHERE name = 'Grant'` or a table named `grants` is unaffected. The tenant
/// store enforces the same boundary again when the statement is prepared.
pub fn validate_sql_statement(query: &str) -> Result<()> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(NebulaError::ValidationError(
            "Query cannot be empty".to_string(),
        ));
    }

    if trimmed.len() > MAX_SQL_LEN {
        return Err(NebulaError::ValidationError(format!(
            "Query too long: {} > {} characters",
            trimmed.len(),
            MAX_SQL_LEN
        )));
    }

    let words = sql_words(trimmed);
    for statement in words.split(|w| w == ";") {
        for forbidden in FORBIDDEN_STATEMENTS {
            if statement.len() >= forbidden.len()
                && statement.iter().zip(forbidden.iter()).all(|(w, f)| w == f)
            {
                return Err(NebulaError::ValidationError(format!(
                    "Query contains forbidden operation: {}",
                    forbidden.join(" ")
                )));
            }
        }
    }

    if let Some(function) = words
        .iter()
        .find(|w| FORBIDDEN_FUNCTIONS.contains(&w.as_str()))
    {
        return Err(NebulaError::ValidationError(format!(
            "Query calls forbidden function: {}",
            function
        )));
    }

    Ok(())
}

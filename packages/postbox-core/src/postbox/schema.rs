//! # Database Schema
//!
//! SQL definitions for the ordered key-value engine.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐    ┌─────────────────────────────────────────┐    │
//! │  │ schema_version  │    │  t{id}  (one per ValueBoxTable)         │    │
//! │  ├─────────────────┤    ├─────────────────────────────────────────┤    │
//! │  │ version         │    │ key    BLOB PRIMARY KEY  (memcmp order) │    │
//! │  └─────────────────┘    │ value  BLOB NOT NULL                    │    │
//! │                         └─────────────────────────────────────────┘    │
//! │                                                                         │
//! │  Key/value tables are created lazily on first write and are            │
//! │  WITHOUT ROWID so the primary key b-tree is the table itself.          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create the bookkeeping tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);
"#;

/// Connection settings applied on open
pub const PRAGMAS: &str = r#"
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
"#;

/// Prefix of every key/value table name
pub const TABLE_PREFIX: &str = "t";

/// SQLite name of a key/value table
pub fn table_name(id: i32) -> String {
    format!("{}{}", TABLE_PREFIX, id)
}

/// SQL creating one key/value table
pub fn create_table_sql(id: i32) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (key BLOB PRIMARY KEY, value BLOB NOT NULL) WITHOUT ROWID",
        table_name(id)
    )
}

/// Parse a key/value table id back out of its SQLite name
pub fn parse_table_name(name: &str) -> Option<i32> {
    name.strip_prefix(TABLE_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_roundtrip() {
        assert_eq!(table_name(7), "t7");
        assert_eq!(parse_table_name("t7"), Some(7));
        assert_eq!(parse_table_name("schema_version"), None);
    }

    #[test]
    fn test_create_table_sql_is_without_rowid() {
        assert!(create_table_sql(3).contains("t3"));
        assert!(create_table_sql(3).ends_with("WITHOUT ROWID"));
    }
}

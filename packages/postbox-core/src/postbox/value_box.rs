//! # Value Box
//!
//! The ordered key-value engine every table is layered on.
//!
//! ## Engine Stack
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        KEY-VALUE ENGINE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │     Tables      │  Typed views (read states, history, metadata)     │
//! │  └────────┬────────┘                                                   │
//! │           │  ValueBoxKey + raw bytes                                    │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    ValueBox     │  get / set / remove / range                       │
//! │  │    (trait)      │  begin / commit / rollback                        │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │ SqliteValueBox  │  rusqlite, one WITHOUT ROWID table per id         │
//! │  │                 │  - In-memory for tests                            │
//! │  │                 │  - File for production                            │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys compare as raw bytes, so integers are written big-endian with the
//! sign bit flipped: byte order then matches numeric order.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::fmt;

use super::schema;
use crate::error::{Error, Result};

/// A named table inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueBoxTable {
    /// Stable numeric id, also the SQLite table suffix
    pub id: i32,
}

impl ValueBoxTable {
    /// Create a table handle
    pub const fn new(id: i32) -> Self {
        Self { id }
    }
}

/// Byte-string key with order-preserving integer encoding
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueBoxKey(Vec<u8>);

impl ValueBoxKey {
    /// Empty key with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Wrap raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Append a signed 32-bit integer
    pub fn push_i32(mut self, value: i32) -> Self {
        self.0.extend_from_slice(&((value as u32) ^ 0x8000_0000).to_be_bytes());
        self
    }

    /// Append a signed 64-bit integer
    pub fn push_i64(mut self, value: i64) -> Self {
        self.0
            .extend_from_slice(&((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        self
    }

    /// Append one raw byte
    pub fn push_u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    /// Read a signed 32-bit integer written by [`push_i32`](Self::push_i32)
    pub fn i32_at(&self, offset: usize) -> Option<i32> {
        let bytes: [u8; 4] = self.0.get(offset..offset + 4)?.try_into().ok()?;
        Some((u32::from_be_bytes(bytes) ^ 0x8000_0000) as i32)
    }

    /// Read a signed 64-bit integer written by [`push_i64`](Self::push_i64)
    pub fn i64_at(&self, offset: usize) -> Option<i64> {
        let bytes: [u8; 8] = self.0.get(offset..offset + 8)?.try_into().ok()?;
        Some((u64::from_be_bytes(bytes) ^ 0x8000_0000_0000_0000) as i64)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ValueBoxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueBoxKey({})", hex::encode(&self.0))
    }
}

/// Ordered byte-string key-value engine
///
/// Writes between [`begin`](ValueBox::begin) and
/// [`commit`](ValueBox::commit) become visible to other connections
/// atomically; reads inside the transaction see its own writes.
pub trait ValueBox: Send {
    /// Open a write transaction
    fn begin(&mut self) -> Result<()>;

    /// Make every write since `begin` durable
    fn commit(&mut self) -> Result<()>;

    /// Drop every write since `begin`
    fn rollback(&mut self) -> Result<()>;

    /// Read the value stored under `key`
    fn get(&self, table: ValueBoxTable, key: &ValueBoxKey) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&mut self, table: ValueBoxTable, key: &ValueBoxKey, value: &[u8]) -> Result<()>;

    /// Delete `key` if present
    fn remove(&mut self, table: ValueBoxTable, key: &ValueBoxKey) -> Result<()>;

    /// Visit entries with `lower <= key <= upper`.
    ///
    /// Entries arrive in ascending key order, or descending when `reverse`
    /// is set. The visitor returns `false` to stop early.
    fn range(
        &self,
        table: ValueBoxTable,
        lower: &ValueBoxKey,
        upper: &ValueBoxKey,
        reverse: bool,
        limit: Option<usize>,
        visitor: &mut dyn FnMut(&ValueBoxKey, &[u8]) -> bool,
    ) -> Result<()>;
}

/// SQLite-backed [`ValueBox`]
pub struct SqliteValueBox {
    conn: Connection,
    tables: HashSet<i32>,
    in_transaction: bool,
}

impl SqliteValueBox {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        let mut value_box = Self {
            conn,
            tables: HashSet::new(),
            in_transaction: false,
        };
        value_box.init_schema()?;
        value_box.reload_tables()?;
        Ok(value_box)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(schema::PRAGMAS)
            .map_err(|e| Error::DatabaseError(format!("Failed to configure database: {}", e)))?;

        let version: Option<i32> = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        match version {
            None => {
                self.conn
                    .execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;
                self.conn
                    .execute(
                        "INSERT INTO schema_version (version) VALUES (?)",
                        params![schema::SCHEMA_VERSION],
                    )
                    .map_err(|e| {
                        Error::DatabaseError(format!("Failed to set schema version: {}", e))
                    })?;
                tracing::info!("Value box schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::DatabaseError(format!(
                    "Database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!("Value box schema version: {}", v);
            }
        }
        Ok(())
    }

    /// Re-read the set of existing key/value tables from the catalog
    fn reload_tables(&mut self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tables = HashSet::new();
        for name in names {
            if let Some(id) = schema::parse_table_name(&name?) {
                tables.insert(id);
            }
        }
        drop(stmt);
        self.tables = tables;
        Ok(())
    }

    fn ensure_table(&mut self, table: ValueBoxTable) -> Result<()> {
        if !self.tables.contains(&table.id) {
            self.conn
                .execute_batch(&schema::create_table_sql(table.id))
                .map_err(|e| {
                    Error::DatabaseError(format!("Failed to create table {}: {}", table.id, e))
                })?;
            self.tables.insert(table.id);
        }
        Ok(())
    }
}

impl ValueBox for SqliteValueBox {
    fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::InvariantViolation(
                "value box transaction already open".into(),
            ));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::InvariantViolation("commit without begin".into()));
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.in_transaction = false;
        // Tables created inside the transaction are gone again.
        self.reload_tables()
    }

    fn get(&self, table: ValueBoxTable, key: &ValueBoxKey) -> Result<Option<Vec<u8>>> {
        if !self.tables.contains(&table.id) {
            return Ok(None);
        }
        let sql = format!("SELECT value FROM {} WHERE key = ?", schema::table_name(table.id));
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let value = stmt
            .query_row(params![key.as_bytes()], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, table: ValueBoxTable, key: &ValueBoxKey, value: &[u8]) -> Result<()> {
        self.ensure_table(table)?;
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)",
            schema::table_name(table.id)
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(params![key.as_bytes(), value])
            .map_err(|e| Error::StorageWriteError(format!("table {}: {}", table.id, e)))?;
        Ok(())
    }

    fn remove(&mut self, table: ValueBoxTable, key: &ValueBoxKey) -> Result<()> {
        if !self.tables.contains(&table.id) {
            return Ok(());
        }
        let sql = format!("DELETE FROM {} WHERE key = ?", schema::table_name(table.id));
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(params![key.as_bytes()])
            .map_err(|e| Error::StorageWriteError(format!("table {}: {}", table.id, e)))?;
        Ok(())
    }

    fn range(
        &self,
        table: ValueBoxTable,
        lower: &ValueBoxKey,
        upper: &ValueBoxKey,
        reverse: bool,
        limit: Option<usize>,
        visitor: &mut dyn FnMut(&ValueBoxKey, &[u8]) -> bool,
    ) -> Result<()> {
        if !self.tables.contains(&table.id) || lower > upper {
            return Ok(());
        }
        let sql = format!(
            "SELECT key, value FROM {} WHERE key >= ? AND key <= ? ORDER BY key {} LIMIT ?",
            schema::table_name(table.id),
            if reverse { "DESC" } else { "ASC" }
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params![lower.as_bytes(), upper.as_bytes(), limit])?;
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            if !visitor(&ValueBoxKey(key), &value) {
                break;
            }
        }
        Ok(())
    }
}

//! [`SqliteStore`] -- SQLite-backed entry store and value index.
//!
//! One mutex-protected connection serves the whole store. The outer
//! transaction maps to `BEGIN IMMEDIATE`, nested transactions map to
//! savepoints, and the checkpoint hook maps to `wal_checkpoint`. Only one
//! outer transaction can be open at a time; a second writer gets the
//! transient `NotGranted` error and restarts, which is exactly the contract
//! the driver retries on.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use dirserv_core::dn::Dn;
use dirserv_core::entry::Entry;
use dirserv_core::schema::{AttrDesc, Schema};

use crate::error::{Result, StorageError, map_sqlite};
use crate::sqlite::schema;
use crate::traits::{IndexOp, Store, TxnId};

/// Bookkeeping for the single open transaction stack.
#[derive(Debug, Default)]
struct TxnTable {
    next: u64,
    outer: Option<u64>,
    /// Open savepoints, innermost last.
    nested: Vec<u64>,
}

/// SQLite-backed implementation of the [`Store`] trait.
pub struct SqliteStore {
    /// The mutex-protected SQLite connection.
    conn: Mutex<Connection>,
    schema: Arc<Schema>,
    /// Lowercased names of attribute types mirrored into the value index.
    indexed: BTreeSet<String>,
    txns: Mutex<TxnTable>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    ///
    /// Enables WAL mode, then initialises the DDL.
    pub fn open(
        path: impl AsRef<Path>,
        dir_schema: Arc<Schema>,
        indexed: &[String],
    ) -> Result<Self> {
        let path = path.as_ref();
        info!(?path, "opening entry store");

        let conn = Connection::open(path).map_err(|e| {
            StorageError::Connection(format!("failed to open {}: {e}", path.display()))
        })?;
        Self::from_connection(conn, dir_schema, indexed)
    }

    /// Opens an in-memory store (useful for tests).
    pub fn open_in_memory(dir_schema: Arc<Schema>, indexed: &[String]) -> Result<Self> {
        debug!("opening in-memory entry store");
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Connection(format!("failed to open in-memory db: {e}")))?;
        Self::from_connection(conn, dir_schema, indexed)
    }

    fn from_connection(
        conn: Connection,
        dir_schema: Arc<Schema>,
        indexed: &[String],
    ) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            schema: dir_schema,
            indexed: indexed.iter().map(|s| s.to_ascii_lowercase()).collect(),
            txns: Mutex::new(TxnTable::default()),
        };
        store.configure_connection()?;
        store.init_schema()?;
        Ok(store)
    }

    /// Sets connection pragmas (WAL mode, busy timeout).
    fn configure_connection(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 100;",
        )
        .map_err(|e| StorageError::Connection(format!("failed to set pragmas: {e}")))?;
        Ok(())
    }

    /// Creates all tables and indexes if they do not exist.
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        let version: std::result::Result<i32, _> = conn.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| {
                let v: String = row.get(0)?;
                Ok(v.parse::<i32>().unwrap_or(0))
            },
        );
        if let Ok(v) = version {
            if v >= schema::CURRENT_SCHEMA_VERSION {
                debug!(version = v, "store schema already current, skipping init");
                return Ok(());
            }
        }

        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).map_err(StorageError::Query)?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![schema::CURRENT_SCHEMA_VERSION.to_string()],
        )
        .map_err(StorageError::Query)?;

        info!(version = schema::CURRENT_SCHEMA_VERSION, "entry store initialized");
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Connection(format!("mutex poisoned: {e}")))
    }

    fn lock_txns(&self) -> Result<MutexGuard<'_, TxnTable>> {
        self.txns
            .lock()
            .map_err(|e| StorageError::Connection(format!("mutex poisoned: {e}")))
    }

    /// Fails unless `txn` is an open transaction on this store.
    fn check_txn(&self, txn: TxnId) -> Result<()> {
        let txns = self.lock_txns()?;
        if txns.outer == Some(txn.0) || txns.nested.contains(&txn.0) {
            Ok(())
        } else {
            Err(StorageError::Transaction(format!("{txn} is not active")))
        }
    }

    fn decode_row(&self, id: i64, dn: &str, attrs_json: &str) -> Result<Entry> {
        let record: Vec<(String, Vec<String>)> = serde_json::from_str(attrs_json)?;
        let dn = Dn::parse(dn).map_err(|e| StorageError::Decode(e.to_string()))?;
        Entry::from_record(id as u64, dn, record, &self.schema)
            .map_err(|e| StorageError::Decode(e.to_string()))
    }

    // -- Convenience surface (outside any caller transaction) ----------------

    /// Inserts a new entry in its own transaction, indexing its values.
    pub fn insert_entry(&self, entry: &mut Entry) -> Result<()> {
        let txn = self.txn_begin(None)?;
        match self.id2entry_add(txn, entry) {
            Ok(()) => self.txn_commit(txn),
            Err(e) => {
                let _ = self.txn_abort(txn);
                Err(e)
            }
        }
    }

    /// Reads an entry by normalized DN without a caller transaction.
    pub fn read_entry(&self, ndn: &str) -> Result<Option<Entry>> {
        let conn = self.lock_conn()?;
        self.select_entry(&conn, ndn)
    }

    /// All `(normalized value, entry id)` index rows for an attribute, in
    /// value order. Diagnostic surface, used by consistency checks and tests.
    pub fn index_rows(&self, attr: &str) -> Result<Vec<(String, u64)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT value, entry_id FROM attr_index
                 WHERE attr = ?1 ORDER BY value, entry_id",
            )
            .map_err(StorageError::Query)?;
        let rows = stmt
            .query_map(params![attr.to_ascii_lowercase()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(StorageError::Query)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(StorageError::Query)?);
        }
        Ok(out)
    }

    fn select_entry(&self, conn: &Connection, ndn: &str) -> Result<Option<Entry>> {
        let row = conn
            .query_row(
                "SELECT id, dn, attrs FROM entries WHERE ndn = ?1",
                params![ndn],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(map_sqlite)?;
        match row {
            Some((id, dn, attrs)) => Ok(Some(self.decode_row(id, &dn, &attrs)?)),
            None => Ok(None),
        }
    }

    fn index_insert(
        &self,
        conn: &Connection,
        attr: &str,
        value: &str,
        entry_id: u64,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO attr_index (attr, value, entry_id) VALUES (?1, ?2, ?3)",
            params![attr, value, entry_id as i64],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }
}

impl Store for SqliteStore {
    fn txn_begin(&self, parent: Option<TxnId>) -> Result<TxnId> {
        let mut txns = self.lock_txns()?;
        match parent {
            None => {
                // Single writer: a second outer transaction is lock
                // contention, reported transient so the caller restarts.
                if txns.outer.is_some() {
                    return Err(StorageError::NotGranted);
                }
                let conn = self.lock_conn()?;
                conn.execute_batch("BEGIN IMMEDIATE").map_err(map_sqlite)?;
                txns.next += 1;
                let id = txns.next;
                txns.outer = Some(id);
                Ok(TxnId(id))
            }
            Some(parent) => {
                let innermost = txns.nested.last().copied().or(txns.outer);
                if innermost != Some(parent.0) {
                    return Err(StorageError::Transaction(format!(
                        "{parent} is not the innermost open transaction"
                    )));
                }
                let conn = self.lock_conn()?;
                txns.next += 1;
                let id = txns.next;
                conn.execute_batch(&format!("SAVEPOINT sp_{id}"))
                    .map_err(map_sqlite)?;
                txns.nested.push(id);
                Ok(TxnId(id))
            }
        }
    }

    fn txn_commit(&self, txn: TxnId) -> Result<()> {
        let mut txns = self.lock_txns()?;
        if txns.nested.last() == Some(&txn.0) {
            let conn = self.lock_conn()?;
            conn.execute_batch(&format!("RELEASE sp_{}", txn.0))
                .map_err(map_sqlite)?;
            txns.nested.pop();
            return Ok(());
        }
        if txns.outer == Some(txn.0) {
            if !txns.nested.is_empty() {
                return Err(StorageError::Transaction(
                    "nested transaction still open".to_owned(),
                ));
            }
            let conn = self.lock_conn()?;
            conn.execute_batch("COMMIT").map_err(map_sqlite)?;
            txns.outer = None;
            return Ok(());
        }
        Err(StorageError::Transaction(format!("{txn} is not active")))
    }

    fn txn_abort(&self, txn: TxnId) -> Result<()> {
        let mut txns = self.lock_txns()?;
        if txns.nested.last() == Some(&txn.0) {
            let conn = self.lock_conn()?;
            conn.execute_batch(&format!("ROLLBACK TO sp_{0}; RELEASE sp_{0}", txn.0))
                .map_err(map_sqlite)?;
            txns.nested.pop();
            return Ok(());
        }
        if txns.outer == Some(txn.0) {
            let conn = self.lock_conn()?;
            // Rolling back the outer transaction discards all savepoints.
            conn.execute_batch("ROLLBACK").map_err(map_sqlite)?;
            txns.nested.clear();
            txns.outer = None;
            return Ok(());
        }
        Err(StorageError::Transaction(format!("{txn} is not active")))
    }

    fn checkpoint(&self, kbytes: u32, minutes: u32) -> Result<()> {
        debug!(kbytes, minutes, "checkpointing entry store");
        let conn = self.lock_conn()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn dn2entry(&self, txn: TxnId, ndn: &str) -> Result<Option<Entry>> {
        self.check_txn(txn)?;
        let conn = self.lock_conn()?;
        self.select_entry(&conn, ndn)
    }

    fn id2entry_add(&self, txn: TxnId, entry: &mut Entry) -> Result<()> {
        self.check_txn(txn)?;
        let attrs = serde_json::to_string(&entry.to_record())?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO entries (dn, ndn, attrs) VALUES (?1, ?2, ?3)",
            params![entry.dn.as_str(), entry.dn.normalized(), attrs],
        )
        .map_err(map_sqlite)?;
        entry.id = conn.last_insert_rowid() as u64;

        for a in &entry.attrs {
            if self.is_indexed(&a.desc) {
                let attr = a.desc.name().to_ascii_lowercase();
                for v in &a.vals {
                    self.index_insert(&conn, &attr, v.norm(), entry.id)?;
                }
            }
        }
        Ok(())
    }

    fn id2entry_update(&self, txn: TxnId, entry: &Entry) -> Result<()> {
        self.check_txn(txn)?;
        let attrs = serde_json::to_string(&entry.to_record())?;
        let conn = self.lock_conn()?;
        let rows = conn
            .execute(
                "UPDATE entries SET dn = ?1, attrs = ?2 WHERE id = ?3",
                params![entry.dn.as_str(), attrs, entry.id as i64],
            )
            .map_err(map_sqlite)?;
        if rows == 0 {
            return Err(StorageError::not_found("entry", entry.id.to_string()));
        }
        Ok(())
    }

    fn is_indexed(&self, desc: &AttrDesc) -> bool {
        desc.names
            .iter()
            .any(|n| self.indexed.contains(&n.to_ascii_lowercase()))
    }

    fn index_values(
        &self,
        txn: TxnId,
        desc: &AttrDesc,
        norm_values: &[String],
        id: u64,
        op: IndexOp,
    ) -> Result<()> {
        self.check_txn(txn)?;
        let attr = desc.name().to_ascii_lowercase();
        let conn = self.lock_conn()?;
        for value in norm_values {
            match op {
                IndexOp::Add => self.index_insert(&conn, &attr, value, id)?,
                IndexOp::Delete => {
                    conn.execute(
                        "DELETE FROM attr_index
                         WHERE attr = ?1 AND value = ?2 AND entry_id = ?3",
                        params![attr, value, id as i64],
                    )
                    .map_err(map_sqlite)?;
                }
            }
        }
        Ok(())
    }
}

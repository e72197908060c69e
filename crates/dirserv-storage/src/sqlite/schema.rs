//! DDL statements for the SQLite entry store.
//!
//! The store keeps two tables: `entries` is the primary id-to-entry store
//! (the attribute list is a JSON blob of `(type, values)` pairs in list
//! order), and `attr_index` is the secondary value index mapping
//! `(attr, normalized value)` to entry ids.

/// Current schema version. Bumped whenever DDL changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Core DDL statements executed during `init_schema`.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // -- Primary entry store -------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS entries (
        id    INTEGER PRIMARY KEY AUTOINCREMENT,
        dn    TEXT NOT NULL,
        ndn   TEXT NOT NULL UNIQUE,
        attrs TEXT NOT NULL
    );
    "#,
    // -- Secondary value index -----------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS attr_index (
        attr     TEXT NOT NULL,
        value    TEXT NOT NULL,
        entry_id INTEGER NOT NULL
    );
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS attr_index_key
        ON attr_index (attr, value, entry_id);
    "#,
    // -- Store metadata ------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
];

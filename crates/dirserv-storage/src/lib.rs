//! Storage layer for the dirserv system.
//!
//! The [`traits::Store`] contract covers transactions, entry I/O and the
//! value index; [`sqlite::SqliteStore`] implements it over SQLite. On top of
//! the store sit the per-entry [`cache::EntryCache`], the
//! [`engine`] that applies a modification list atomically, and the
//! [`driver::ModifyDriver`] that wraps one modify in transactions with
//! deadlock restart.

pub mod cache;
pub mod driver;
pub mod engine;
pub mod error;
pub mod sqlite;
pub mod traits;

//! Core directory types for the dirserv system.
//!
//! This crate holds the domain model shared by the storage backends and the
//! frontend: distinguished names, the schema registry, entries and values,
//! modifications and the value-level engine, whole-entry schema validation,
//! and the operation/reply vocabulary.

pub mod acl;
pub mod clock;
pub mod dn;
pub mod entry;
pub mod modify;
pub mod operation;
pub mod schema;
pub mod validate;

//! The `Store` trait -- the contract between the modify pipeline and the
//! underlying entry store.
//!
//! The pipeline depends on this trait rather than on a concrete store so the
//! engine and driver can run over the SQLite store, an in-memory double, or a
//! fault-injecting wrapper in tests. Transactions are opaque tokens because
//! the driver's retry loop aborts and reopens them across attempts; a
//! closure-scoped transaction cannot express that.

use dirserv_core::entry::Entry;
use dirserv_core::schema::AttrDesc;

use crate::error::Result;

/// An open transaction. Nested transactions reference their parent at
/// `txn_begin`; aborting an outer transaction aborts everything under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(pub u64);

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Direction of a value-index maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Add,
    Delete,
}

/// Primary entry store plus its secondary value index.
///
/// Implementations report lock contention as
/// [`StorageError::Deadlock`](crate::error::StorageError::Deadlock) or
/// [`StorageError::NotGranted`](crate::error::StorageError::NotGranted); the
/// driver owns the restart policy.
pub trait Store: Send + Sync {
    // -- Transactions --------------------------------------------------------

    /// Begins a transaction; `parent` nests it inside an open one.
    fn txn_begin(&self, parent: Option<TxnId>) -> Result<TxnId>;

    /// Commits a transaction. Committing an outer transaction requires all
    /// nested transactions to be resolved.
    fn txn_commit(&self, txn: TxnId) -> Result<()>;

    /// Aborts a transaction; aborting an outer transaction discards any
    /// nested work under it.
    fn txn_abort(&self, txn: TxnId) -> Result<()>;

    /// Best-effort checkpoint of the underlying log, gated on the given
    /// kilobyte/minute thresholds where the engine supports them.
    fn checkpoint(&self, kbytes: u32, minutes: u32) -> Result<()>;

    // -- Entry I/O -----------------------------------------------------------

    /// Resolves a normalized DN to its entry, or `None`.
    fn dn2entry(&self, txn: TxnId, ndn: &str) -> Result<Option<Entry>>;

    /// Inserts a new entry, assigning its id.
    fn id2entry_add(&self, txn: TxnId, entry: &mut Entry) -> Result<()>;

    /// Writes back the modified image of an existing entry.
    fn id2entry_update(&self, txn: TxnId, entry: &Entry) -> Result<()>;

    // -- Value index ---------------------------------------------------------

    /// Whether values of this attribute type are mirrored into the value
    /// index.
    fn is_indexed(&self, desc: &AttrDesc) -> bool;

    /// Adds or removes `(attr, value) -> id` index entries for the given
    /// normalized values.
    fn index_values(
        &self,
        txn: TxnId,
        desc: &AttrDesc,
        norm_values: &[String],
        id: u64,
        op: IndexOp,
    ) -> Result<()>;
}

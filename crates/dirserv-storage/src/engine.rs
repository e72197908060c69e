//! The modify engine: applies an ordered modification list to a working
//! entry, keeps the value index consistent, and rolls back on any failure.
//!
//! The engine never touches the caller's durable state directly: it works on
//! the working copy the driver hands it, against the nested transaction the
//! driver opened. A shallow clone of the attribute list taken up front makes
//! "restore on failure" a container swap; value storage is shared throughout.

use dirserv_core::acl::AccessControl;
use dirserv_core::entry::{Attribute, Entry};
use dirserv_core::modify::{ModList, ModOp, ModifyError, apply_modification};
use dirserv_core::operation::{Operation, ResultCode};
use dirserv_core::schema::Schema;
use dirserv_core::validate::{SchemaViolation, entry_schema_check};

use crate::error::StorageError;
use crate::traits::{IndexOp, Store, TxnId};

/// Failure of the engine, preserving the underlying error for the driver's
/// retry decision.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("access denied")]
    AccessDenied,

    #[error(transparent)]
    Modify(#[from] ModifyError),

    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// The reply code this failure surfaces as. Transient storage errors are
    /// intercepted by the driver before this is consulted.
    pub fn result_code(&self) -> ResultCode {
        match self {
            EngineError::AccessDenied => ResultCode::InsufficientAccess,
            EngineError::Modify(e) => e.result_code(),
            EngineError::Schema(e) => e.result_code(),
            EngineError::Storage(_) => ResultCode::Other,
        }
    }

    /// Whether the driver should restart the whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(e) if e.is_retryable())
    }
}

/// What a successful apply did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// `false` means the list validated fully but the entry was restored
    /// (no-op request); the caller aborts instead of persisting.
    pub applied: bool,
}

/// Applies `mods` to `entry` in list order.
///
/// On success the entry holds the post-image, its index maintenance has been
/// issued against `txn`, and the schema check has passed. On any failure the
/// entry is byte-for-byte the pre-image.
pub fn apply_mods(
    store: &dyn Store,
    txn: TxnId,
    schema: &Schema,
    acl: &dyn AccessControl,
    op: &Operation,
    entry: &mut Entry,
    mods: &ModList,
) -> Result<ApplyOutcome, EngineError> {
    if !acl.check_modlist(op, entry, mods) {
        return Err(EngineError::AccessDenied);
    }

    let mut saved_attrs = entry.attrs_dup();

    // A modification that rewrites the structural class away from `glue`
    // promotes a subtree placeholder to a real entry: everything but the
    // operational attributes goes, and the list's deletes become no-ops.
    // Only placeholders are promoted; on any other entry a
    // structuralObjectClass change is an ordinary modification.
    let glue_delete = entry.is_glue()
        && mods.iter().any(|m| {
            matches!(m.op, ModOp::Add | ModOp::Replace)
                && m.attr.eq_ignore_ascii_case("structuralObjectClass")
                && m.values
                    .first()
                    .is_some_and(|v| !v.trim().eq_ignore_ascii_case("glue"))
        });
    if glue_delete {
        entry.attrs.retain(|a| a.desc.operational);
        entry.invalidate_oc_flags();
    }

    for m in mods {
        if glue_delete && m.op == ModOp::Delete {
            continue;
        }
        if let Err(e) = apply_modification(schema, entry, m, op.permissive) {
            restore(entry, saved_attrs);
            return Err(e.into());
        }

        // The modification applied, so the type resolves.
        let Some(desc) = schema.attr(&m.attr) else {
            continue;
        };
        if desc.named("objectClass") || desc.named("structuralObjectClass") {
            entry.invalidate_oc_flags();
        }
        if store.is_indexed(&desc) {
            if let Some(a) = saved_attrs.iter_mut().find(|a| a.is(&desc)) {
                a.ix_del = true;
            }
            if let Some(a) = entry.attr_find_mut(&desc) {
                a.ix_add = true;
            }
        }
    }

    if let Err(e) = entry_schema_check(schema, entry, op.manage_dsa_it) {
        restore(entry, saved_attrs);
        return Err(e.into());
    }

    if op.no_op {
        restore(entry, saved_attrs);
        return Ok(ApplyOutcome { applied: false });
    }

    if let Err(e) = run_index_passes(store, txn, &saved_attrs, entry) {
        restore(entry, saved_attrs);
        return Err(e.into());
    }

    for a in &mut entry.attrs {
        a.clear_index_flags();
    }
    entry.refresh_oc_flags();
    Ok(ApplyOutcome { applied: true })
}

/// One delete pass over the flagged pre-image attributes, then one add pass
/// over the flagged post-image attributes.
fn run_index_passes(
    store: &dyn Store,
    txn: TxnId,
    saved_attrs: &[Attribute],
    entry: &Entry,
) -> Result<(), StorageError> {
    for a in saved_attrs {
        if a.ix_del {
            store.index_values(txn, &a.desc, &a.norm_values(), entry.id, IndexOp::Delete)?;
        }
    }
    for a in &entry.attrs {
        if a.ix_add {
            store.index_values(txn, &a.desc, &a.norm_values(), entry.id, IndexOp::Add)?;
        }
    }
    Ok(())
}

/// Puts the pre-image attribute list back, with all scratch state cleared.
fn restore(entry: &mut Entry, mut saved_attrs: Vec<Attribute>) {
    for a in &mut saved_attrs {
        a.clear_index_flags();
    }
    entry.attrs = saved_attrs;
    entry.invalidate_oc_flags();
}

//! Access-control seam.
//!
//! The real evaluator lives outside this core; consumers depend on the trait
//! so an alternative implementation (or a test double) can be substituted.

use crate::entry::Entry;
use crate::modify::Modification;
use crate::operation::Operation;

/// Decides whether an operation may apply a modification list to an entry.
pub trait AccessControl: Send + Sync {
    fn check_modlist(&self, op: &Operation, entry: &Entry, mods: &[Modification]) -> bool;
}

/// Grants everything. The default when no evaluator is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn check_modlist(&self, _op: &Operation, _entry: &Entry, _mods: &[Modification]) -> bool {
        true
    }
}

/// Denies everything. Useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl AccessControl for DenyAll {
    fn check_modlist(&self, _op: &Operation, _entry: &Entry, _mods: &[Modification]) -> bool {
        false
    }
}

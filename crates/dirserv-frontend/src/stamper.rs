//! Operational-attribute stamping.
//!
//! Clients never write the lastmod attributes directly: any modification
//! targeting them is silently dropped, then the server prepends its own
//! `modifiersName` and `modifyTimestamp` replacements. Runs only when this
//! backend is authoritative and stamping is enabled.

use dirserv_core::clock::{Clock, generalized_time};
use dirserv_core::modify::{ModList, Modification};
use dirserv_core::operation::Operation;
use dirserv_core::schema::NULL_DN;

/// The attributes the server owns, case-folded.
const LASTMOD_ATTRS: [&str; 4] = [
    "modifytimestamp",
    "modifiersname",
    "createtimestamp",
    "creatorsname",
];

fn is_lastmod_attr(name: &str) -> bool {
    LASTMOD_ATTRS
        .iter()
        .any(|a| a.eq_ignore_ascii_case(name.trim()))
}

/// Strips client-supplied lastmod modifications and prepends the server's
/// own, preserving the order of everything that survives.
///
/// Stamping is idempotent: a second run drops the first run's stamps and
/// re-inserts fresh ones, leaving count and order stable.
pub fn stamp_mods(op: &Operation, clock: &dyn Clock, mods: &mut ModList) {
    mods.retain(|m| !is_lastmod_attr(&m.attr));

    let bind = op
        .bind_dn
        .as_ref()
        .map_or_else(|| NULL_DN.to_owned(), |dn| dn.as_str().to_owned());

    mods.insert(0, Modification::replace_one("modifiersName", bind));
    mods.insert(
        0,
        Modification::replace_one("modifyTimestamp", generalized_time(clock.now())),
    );
}

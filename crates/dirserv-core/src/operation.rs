//! Operations, controls, replies and result codes.
//!
//! An [`Operation`] carries everything the frontend decoded besides the
//! request itself: the authenticated identity, the request controls that
//! change modify semantics, and the abandon flag a concurrent Abandon request
//! may set. A [`Reply`] is what goes back through the [`ReplySink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::dn::Dn;
use crate::entry::Entry;
use crate::modify::ModifyError;
use crate::validate::SchemaViolation;

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

/// Reply codes the modify pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    ProtocolError,
    NoSuchAttribute,
    ConstraintViolation,
    TypeOrValueExists,
    InvalidSyntax,
    NoSuchObject,
    InsufficientAccess,
    Busy,
    UnwillingToPerform,
    ObjectClassViolation,
    AssertionFailed,
    Referral,
    PartialResults,
    /// The request validated fully but was not applied (no-op control).
    NoOperation,
    Other,
    /// Internal outcome: the operation was abandoned and no reply is sent.
    Abandoned,
}

impl ResultCode {
    /// The wire code, or `None` for internal-only outcomes.
    pub fn code(self) -> Option<u32> {
        match self {
            ResultCode::Success => Some(0),
            ResultCode::ProtocolError => Some(2),
            ResultCode::PartialResults => Some(9),
            ResultCode::Referral => Some(10),
            ResultCode::NoSuchAttribute => Some(16),
            ResultCode::ConstraintViolation => Some(19),
            ResultCode::TypeOrValueExists => Some(20),
            ResultCode::InvalidSyntax => Some(21),
            ResultCode::NoSuchObject => Some(32),
            ResultCode::InsufficientAccess => Some(50),
            ResultCode::Busy => Some(51),
            ResultCode::UnwillingToPerform => Some(53),
            ResultCode::ObjectClassViolation => Some(65),
            ResultCode::Other => Some(80),
            ResultCode::AssertionFailed => Some(122),
            // Experimental code used by the no-op control.
            ResultCode::NoOperation => Some(0x410e),
            ResultCode::Abandoned => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl ModifyError {
    /// The reply code this engine error surfaces as.
    pub fn result_code(&self) -> ResultCode {
        match self {
            ModifyError::TypeOrValueExists { .. } => ResultCode::TypeOrValueExists,
            ModifyError::NoSuchAttribute { .. } => ResultCode::NoSuchAttribute,
            ModifyError::ConstraintViolation { .. } => ResultCode::ConstraintViolation,
            ModifyError::InvalidSyntax { .. } => ResultCode::InvalidSyntax,
            ModifyError::Other(_) => ResultCode::Other,
        }
    }
}

impl SchemaViolation {
    /// Schema violations surface as objectClass/attribute violations.
    pub fn result_code(&self) -> ResultCode {
        match self {
            SchemaViolation::SingleValued(_)
            | SchemaViolation::DuplicateValue(_)
            | SchemaViolation::NotAllowed(_) => ResultCode::ConstraintViolation,
            SchemaViolation::InvalidValue { .. } => ResultCode::InvalidSyntax,
            _ => ResultCode::ObjectClassViolation,
        }
    }
}

// ---------------------------------------------------------------------------
// Operations and controls
// ---------------------------------------------------------------------------

/// An equality assertion control: the named attribute must hold the value.
#[derive(Debug, Clone)]
pub struct Assertion {
    pub attr: String,
    pub value: String,
}

/// Attribute selection for a pre- or post-read control; empty means all user
/// attributes.
#[derive(Debug, Clone, Default)]
pub struct ReadControl {
    pub attrs: Vec<String>,
}

/// Decoded per-request state accompanying a modify.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Authenticated bind DN; `None` for anonymous.
    pub bind_dn: Option<Dn>,
    /// The client asserts it is managing DSA-specific entries (referrals,
    /// glue) directly.
    pub manage_dsa_it: bool,
    /// Permissive modify: duplicate adds and missing deletes succeed.
    pub permissive: bool,
    /// Validate fully but persist nothing.
    pub no_op: bool,
    pub assertion: Option<Assertion>,
    pub pre_read: Option<ReadControl>,
    pub post_read: Option<ReadControl>,
    abandoned: Arc<AtomicBool>,
}

impl Operation {
    pub fn new(bind_dn: Option<Dn>) -> Self {
        Self {
            bind_dn,
            manage_dsa_it: false,
            permissive: false,
            no_op: false,
            assertion: None,
            pre_read: None,
            post_read: None,
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    /// A handle a concurrent Abandon request uses to cancel this operation.
    pub fn abandon_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abandoned)
    }

    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    /// Checked at retry boundaries only; a running attempt is never
    /// interrupted.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A materialized entry image for a pre- or post-read control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEntry {
    pub dn: String,
    pub attrs: Vec<(String, Vec<String>)>,
}

impl ReadEntry {
    /// Projects `entry` through the control's attribute selection.
    pub fn materialize(entry: &Entry, ctl: &ReadControl) -> Self {
        let attrs = entry
            .attrs
            .iter()
            .filter(|a| {
                if ctl.attrs.is_empty() {
                    !a.desc.operational
                } else {
                    ctl.attrs.iter().any(|want| a.desc.named(want))
                }
            })
            .map(|a| {
                (
                    a.desc.name().to_owned(),
                    a.vals.iter().map(|v| v.raw().to_owned()).collect(),
                )
            })
            .collect();
        Self {
            dn: entry.dn.as_str().to_owned(),
            attrs,
        }
    }
}

/// The outcome sent back to the client.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: ResultCode,
    pub text: String,
    pub matched: Option<String>,
    pub referrals: Vec<String>,
    pub pre_read: Option<ReadEntry>,
    pub post_read: Option<ReadEntry>,
}

impl Reply {
    pub fn success() -> Self {
        Self::with_code(ResultCode::Success)
    }

    pub fn with_code(code: ResultCode) -> Self {
        Self {
            code,
            text: String::new(),
            matched: None,
            referrals: Vec::new(),
            pre_read: None,
            post_read: None,
        }
    }

    pub fn error(code: ResultCode, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::with_code(code)
        }
    }

    pub fn referral(code: ResultCode, referrals: Vec<String>) -> Self {
        Self {
            referrals,
            ..Self::with_code(code)
        }
    }
}

/// Where replies go; the wire encoder lives behind this.
pub trait ReplySink: Send + Sync {
    fn send_result(&self, op: &Operation, reply: &Reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Attribute, Value};
    use crate::schema::Schema;

    #[test]
    fn wire_codes() {
        assert_eq!(ResultCode::Success.code(), Some(0));
        assert_eq!(ResultCode::NoSuchObject.code(), Some(32));
        assert_eq!(ResultCode::AssertionFailed.code(), Some(122));
        assert_eq!(ResultCode::Abandoned.code(), None);
    }

    #[test]
    fn abandon_flag_round_trips_through_handle() {
        let op = Operation::anonymous();
        assert!(!op.is_abandoned());
        let handle = op.abandon_handle();
        handle.store(true, std::sync::atomic::Ordering::Release);
        assert!(op.is_abandoned());
    }

    #[test]
    fn read_entry_excludes_operational_by_default() {
        let s = Schema::core();
        let mut e = Entry::new(7, Dn::parse("cn=x,dc=example").unwrap());
        for (name, raw) in [("cn", "x"), ("modifyTimestamp", "20260801120000Z")] {
            let desc = s.attr(name).unwrap();
            let v = Value::normalized(&desc, raw).unwrap();
            e.attrs.push(Attribute::with_values(desc, vec![v]));
        }

        let all_user = ReadEntry::materialize(&e, &ReadControl::default());
        assert_eq!(all_user.attrs.len(), 1);
        assert_eq!(all_user.attrs[0].0, "cn");

        let selected = ReadEntry::materialize(
            &e,
            &ReadControl {
                attrs: vec!["modifytimestamp".into()],
            },
        );
        assert_eq!(selected.attrs.len(), 1);
        assert_eq!(selected.attrs[0].0, "modifyTimestamp");
    }
}

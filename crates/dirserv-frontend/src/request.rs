//! The decoded modify request and its protocol validation.
//!
//! The wire decoder is outside this system; what arrives here is the decoded
//! frame: a DN string and a change list whose operations are still raw wire
//! enumeration values. Validation rejects anything a client may not send --
//! the internal increment/soft-add operations are produced by extensions,
//! never accepted off the wire.

use dirserv_core::dn::{Dn, DnError};
use dirserv_core::modify::{ModList, ModOp, Modification};
use dirserv_core::operation::ResultCode;

/// Wire value of a modify-add change.
pub const CHANGE_ADD: u32 = 0;
/// Wire value of a modify-delete change.
pub const CHANGE_DELETE: u32 = 1;
/// Wire value of a modify-replace change.
pub const CHANGE_REPLACE: u32 = 2;

/// One decoded change, operation still in wire form.
#[derive(Debug, Clone)]
pub struct Change {
    pub op: u32,
    pub attr: String,
    pub values: Vec<String>,
}

/// A decoded modify request.
#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Change>,
}

impl ModifyRequest {
    pub fn new(dn: impl Into<String>, changes: Vec<Change>) -> Self {
        Self {
            dn: dn.into(),
            changes,
        }
    }
}

/// A malformed request. Everything here surfaces as a protocol error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("unknown modify operation ({0})")]
    UnknownOp(u32),

    #[error("modify/add: {0}: no values")]
    NoValues(String),

    #[error("invalid DN: {0}")]
    InvalidDn(#[from] DnError),
}

impl RequestError {
    pub fn result_code(&self) -> ResultCode {
        ResultCode::ProtocolError
    }
}

/// Validates the decoded frame and produces the normalized name plus the
/// modification list, preserving change order.
///
/// Add changes must carry values; delete and replace accept an empty list
/// (delete-the-attribute and remove-the-attribute respectively).
pub fn parse_modify_request(req: &ModifyRequest) -> Result<(Dn, ModList), RequestError> {
    let dn = Dn::parse(&req.dn)?;

    let mut mods = Vec::with_capacity(req.changes.len());
    for change in &req.changes {
        let op = match change.op {
            CHANGE_ADD => ModOp::Add,
            CHANGE_DELETE => ModOp::Delete,
            CHANGE_REPLACE => ModOp::Replace,
            other => return Err(RequestError::UnknownOp(other)),
        };
        if change.values.is_empty() && op == ModOp::Add {
            return Err(RequestError::NoValues(change.attr.clone()));
        }
        mods.push(Modification::new(op, change.attr.clone(), change.values.clone()));
    }
    Ok((dn, mods))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(op: u32, attr: &str, values: &[&str]) -> Change {
        Change {
            op,
            attr: attr.to_owned(),
            values: values.iter().map(|v| (*v).to_owned()).collect(),
        }
    }

    #[test]
    fn valid_request_parses_in_order() {
        let req = ModifyRequest::new(
            "CN=Alice,DC=Example",
            vec![
                change(CHANGE_REPLACE, "cn", &["Alicia"]),
                change(CHANGE_ADD, "mail", &["a@x"]),
                change(CHANGE_DELETE, "description", &[]),
            ],
        );
        let (dn, mods) = parse_modify_request(&req).unwrap();
        assert_eq!(dn.normalized(), "cn=alice,dc=example");
        let ops: Vec<ModOp> = mods.iter().map(|m| m.op).collect();
        assert_eq!(ops, [ModOp::Replace, ModOp::Add, ModOp::Delete]);
    }

    #[test]
    fn internal_opcodes_are_rejected_from_the_wire() {
        for op in [3, 4, 99] {
            let req = ModifyRequest::new("cn=x", vec![change(op, "uidNumber", &["1"])]);
            let err = parse_modify_request(&req).unwrap_err();
            assert_eq!(err, RequestError::UnknownOp(op));
            assert_eq!(err.result_code(), ResultCode::ProtocolError);
        }
    }

    #[test]
    fn add_without_values_is_a_protocol_error() {
        let req = ModifyRequest::new("cn=x", vec![change(CHANGE_ADD, "mail", &[])]);
        assert_eq!(
            parse_modify_request(&req).unwrap_err(),
            RequestError::NoValues("mail".to_owned())
        );
    }

    #[test]
    fn replace_and_delete_accept_empty_values() {
        let req = ModifyRequest::new(
            "cn=x",
            vec![
                change(CHANGE_REPLACE, "mail", &[]),
                change(CHANGE_DELETE, "description", &[]),
            ],
        );
        assert!(parse_modify_request(&req).is_ok());
    }

    #[test]
    fn bad_dn_is_a_protocol_error() {
        let req = ModifyRequest::new("not a dn", vec![]);
        let err = parse_modify_request(&req).unwrap_err();
        assert!(matches!(err, RequestError::InvalidDn(_)));
        assert_eq!(err.result_code(), ResultCode::ProtocolError);
    }
}

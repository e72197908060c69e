//! Modifications and the value-level engine that applies them.
//!
//! A [`Modification`] is one `(op, attribute, values)` directive; a
//! [`ModList`] is an ordered sequence of them, applied in order. The
//! functions here mutate a single entry's attribute set for one modification
//! and are all-or-nothing per modification: a failed modification leaves the
//! entry untouched. List-level atomicity (restore on later failure) belongs
//! to the storage engine.

use num_bigint::BigInt;

use crate::entry::{Attribute, Entry, Value, value_match};
use crate::schema::{AttrDesc, Schema, SchemaError, Syntax};

// ---------------------------------------------------------------------------
// Modifications
// ---------------------------------------------------------------------------

/// The operation of a modification.
///
/// `Increment` and `SoftAdd` are internal operations produced by extensions;
/// clients can only request the first three. Soft-add is a distinct
/// operation, not a flag rewritten onto `Add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    Add,
    Delete,
    Replace,
    Increment,
    SoftAdd,
}

impl ModOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ModOp::Add => "add",
            ModOp::Delete => "delete",
            ModOp::Replace => "replace",
            ModOp::Increment => "increment",
            ModOp::SoftAdd => "softadd",
        }
    }
}

impl std::fmt::Display for ModOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single modification directive.
#[derive(Debug, Clone)]
pub struct Modification {
    pub op: ModOp,
    /// Attribute type name as supplied; resolved against the schema at apply
    /// time.
    pub attr: String,
    /// Raw values. Empty is meaningful only for `Delete` (delete the whole
    /// attribute) and `Replace` (remove the attribute).
    pub values: Vec<String>,
}

impl Modification {
    pub fn new(op: ModOp, attr: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            op,
            attr: attr.into(),
            values,
        }
    }

    /// Convenience constructor for a replace with a single value.
    pub fn replace_one(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(ModOp::Replace, attr, vec![value.into()])
    }
}

/// An ordered modification list. Order is part of the contract.
pub type ModList = Vec<Modification>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a single modification, with the text the client sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModifyError {
    #[error("modify/{op}: {attr}: value already exists")]
    TypeOrValueExists { op: ModOp, attr: String },

    #[error("modify/{op}: {attr}: no such attribute")]
    NoSuchAttribute { op: ModOp, attr: String },

    #[error("modify/{op}: {attr}: {text}")]
    ConstraintViolation {
        op: ModOp,
        attr: String,
        text: String,
    },

    #[error("modify/{op}: {attr}: invalid syntax: {text}")]
    InvalidSyntax {
        op: ModOp,
        attr: String,
        text: String,
    },

    #[error("{0}")]
    Other(String),
}

fn syntax_err(op: ModOp, e: SchemaError) -> ModifyError {
    match e {
        SchemaError::InvalidValue { attr, text } => ModifyError::InvalidSyntax { op, attr, text },
        SchemaError::UnknownAttribute(attr) => ModifyError::InvalidSyntax {
            op,
            attr,
            text: "attribute type undefined".to_owned(),
        },
        other => ModifyError::Other(other.to_string()),
    }
}

fn resolve(schema: &Schema, op: ModOp, name: &str) -> Result<AttrDesc, ModifyError> {
    schema.require_attr(name).map_err(|e| syntax_err(op, e))
}

// ---------------------------------------------------------------------------
// The value engine
// ---------------------------------------------------------------------------

/// Applies one modification to `entry`, dispatching on the operation.
pub fn apply_modification(
    schema: &Schema,
    entry: &mut Entry,
    m: &Modification,
    permissive: bool,
) -> Result<(), ModifyError> {
    match m.op {
        ModOp::Add => add_values(schema, entry, m, permissive),
        ModOp::Delete => delete_values(schema, entry, m, permissive),
        ModOp::Replace => replace_values(schema, entry, m, permissive),
        ModOp::Increment => increment_values(schema, entry, m, permissive),
        ModOp::SoftAdd => soft_add_values(schema, entry, m, permissive),
    }
}

/// Adds the supplied values to the attribute.
///
/// A value that already exists (under the equality rule) fails the whole
/// modification with `TypeOrValueExists`; under permissive modify duplicates
/// are skipped instead.
pub fn add_values(
    schema: &Schema,
    entry: &mut Entry,
    m: &Modification,
    permissive: bool,
) -> Result<(), ModifyError> {
    let desc = resolve(schema, m.op, &m.attr)?;

    let mut accepted: Vec<Value> = Vec::with_capacity(m.values.len());
    for raw in &m.values {
        let v = Value::normalized(&desc, raw).map_err(|e| syntax_err(m.op, e))?;
        let exists = entry
            .attr_find(&desc)
            .is_some_and(|a| a.find(&v).is_some())
            || accepted.iter().any(|x| value_match(&desc, x, &v));
        if exists {
            if permissive {
                continue;
            }
            return Err(ModifyError::TypeOrValueExists {
                op: m.op,
                attr: desc.name().to_owned(),
            });
        }
        accepted.push(v);
    }

    if accepted.is_empty() {
        return Ok(());
    }
    match entry.attr_find_mut(&desc) {
        Some(a) => a.vals.extend(accepted),
        None => entry.attrs.push(Attribute::with_values(desc, accepted)),
    }
    Ok(())
}

/// Deletes the supplied values, or the whole attribute when none are
/// supplied. Removing the last value removes the attribute.
pub fn delete_values(
    schema: &Schema,
    entry: &mut Entry,
    m: &Modification,
    permissive: bool,
) -> Result<(), ModifyError> {
    let desc = resolve(schema, m.op, &m.attr)?;

    if m.values.is_empty() {
        if entry.attr_remove(&desc).is_none() && !permissive {
            return Err(ModifyError::NoSuchAttribute {
                op: m.op,
                attr: desc.name().to_owned(),
            });
        }
        return Ok(());
    }

    let Some(pos) = entry.attr_position(&desc) else {
        if permissive {
            return Ok(());
        }
        return Err(ModifyError::NoSuchAttribute {
            op: m.op,
            attr: desc.name().to_owned(),
        });
    };

    // Work on a copy of the value list so a missing value leaves the entry
    // untouched.
    let mut vals = entry.attrs[pos].vals.clone();
    for raw in &m.values {
        let v = Value::normalized(&desc, raw).map_err(|e| syntax_err(m.op, e))?;
        match vals.iter().position(|x| value_match(&desc, x, &v)) {
            Some(i) => {
                vals.remove(i);
            }
            None if permissive => {}
            None => {
                return Err(ModifyError::NoSuchAttribute {
                    op: m.op,
                    attr: desc.name().to_owned(),
                });
            }
        }
    }

    if vals.is_empty() {
        entry.attrs.remove(pos);
    } else {
        entry.attrs[pos].vals = vals;
    }
    Ok(())
}

/// Replaces the attribute's values with the supplied set; an empty set
/// removes the attribute. Duplicates among the supplied values are a
/// constraint violation unless permissive, where they collapse.
pub fn replace_values(
    schema: &Schema,
    entry: &mut Entry,
    m: &Modification,
    permissive: bool,
) -> Result<(), ModifyError> {
    let desc = resolve(schema, m.op, &m.attr)?;

    let mut new_vals: Vec<Value> = Vec::with_capacity(m.values.len());
    for raw in &m.values {
        let v = Value::normalized(&desc, raw).map_err(|e| syntax_err(m.op, e))?;
        if new_vals.iter().any(|x| value_match(&desc, x, &v)) {
            if permissive {
                continue;
            }
            return Err(ModifyError::ConstraintViolation {
                op: m.op,
                attr: desc.name().to_owned(),
                text: "duplicate value supplied".to_owned(),
            });
        }
        new_vals.push(v);
    }

    if new_vals.is_empty() {
        entry.attr_remove(&desc);
    } else {
        entry.attr_put(Attribute::with_values(desc, new_vals));
    }
    Ok(())
}

/// Adds the supplied integer delta to every existing value.
///
/// Only single-valued Integer attributes may be incremented; anything else
/// is a constraint violation.
pub fn increment_values(
    schema: &Schema,
    entry: &mut Entry,
    m: &Modification,
    _permissive: bool,
) -> Result<(), ModifyError> {
    let desc = resolve(schema, m.op, &m.attr)?;
    let violation = |text: &str| ModifyError::ConstraintViolation {
        op: m.op,
        attr: desc.name().to_owned(),
        text: text.to_owned(),
    };

    if desc.syntax != Syntax::Integer || !desc.single_valued {
        return Err(violation("increment requires a single-valued Integer attribute"));
    }
    let [delta_raw] = m.values.as_slice() else {
        return Err(violation("increment takes exactly one delta value"));
    };
    let delta: BigInt = delta_raw
        .trim()
        .parse()
        .map_err(|_| violation("delta is not an integer"))?;

    let Some(pos) = entry.attr_position(&desc) else {
        return Err(violation("no such attribute"));
    };

    let mut out = Vec::with_capacity(entry.attrs[pos].vals.len());
    for v in &entry.attrs[pos].vals {
        let cur: BigInt = v
            .norm()
            .parse()
            .map_err(|_| violation("existing value is not an integer"))?;
        let next = (cur + &delta).to_string();
        out.push(Value::new(next.clone(), next));
    }
    entry.attrs[pos].vals = out;
    Ok(())
}

/// Like [`add_values`], but an already-present value is success rather than
/// `TypeOrValueExists`.
pub fn soft_add_values(
    schema: &Schema,
    entry: &mut Entry,
    m: &Modification,
    permissive: bool,
) -> Result<(), ModifyError> {
    match add_values(schema, entry, m, permissive) {
        Err(ModifyError::TypeOrValueExists { .. }) => Ok(()),
        r => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::schema::Schema;

    fn schema() -> Schema {
        Schema::core()
    }

    fn entry_with(s: &Schema, attrs: &[(&str, &[&str])]) -> Entry {
        let mut e = Entry::new(1, Dn::parse("cn=x,dc=example").unwrap());
        for (name, raws) in attrs {
            let desc = s.attr(name).unwrap();
            let vals = raws
                .iter()
                .map(|r| Value::normalized(&desc, r).unwrap())
                .collect();
            e.attrs.push(Attribute::with_values(desc, vals));
        }
        e
    }

    fn raw_values(e: &Entry, attr: &str) -> Vec<String> {
        e.attr_by_name(attr)
            .map(|a| a.vals.iter().map(|v| v.raw().to_owned()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn add_new_value() {
        let s = schema();
        let mut e = entry_with(&s, &[("cn", &["Alice"])]);
        let m = Modification::new(ModOp::Add, "cn", vec!["Alice Smith".into()]);
        add_values(&s, &mut e, &m, false).unwrap();
        assert_eq!(raw_values(&e, "cn"), ["Alice", "Alice Smith"]);
    }

    #[test]
    fn add_duplicate_fails_and_leaves_entry_unchanged() {
        let s = schema();
        let mut e = entry_with(&s, &[("cn", &["Alice"])]);
        // Second value is a duplicate under caseIgnore; the first must not land.
        let m = Modification::new(ModOp::Add, "cn", vec!["Bob".into(), "ALICE".into()]);
        let err = add_values(&s, &mut e, &m, false).unwrap_err();
        assert!(matches!(err, ModifyError::TypeOrValueExists { .. }));
        assert_eq!(raw_values(&e, "cn"), ["Alice"]);
    }

    #[test]
    fn add_duplicate_permissive_skips() {
        let s = schema();
        let mut e = entry_with(&s, &[("cn", &["Alice"])]);
        let m = Modification::new(ModOp::Add, "cn", vec!["ALICE".into(), "Bob".into()]);
        add_values(&s, &mut e, &m, true).unwrap();
        assert_eq!(raw_values(&e, "cn"), ["Alice", "Bob"]);
    }

    #[test]
    fn add_unknown_attribute_is_invalid_syntax() {
        let s = schema();
        let mut e = entry_with(&s, &[]);
        let m = Modification::new(ModOp::Add, "frobnitz", vec!["x".into()]);
        assert!(matches!(
            add_values(&s, &mut e, &m, false),
            Err(ModifyError::InvalidSyntax { .. })
        ));
    }

    #[test]
    fn delete_last_value_removes_attribute() {
        let s = schema();
        let mut e = entry_with(&s, &[("sn", &["Smith"])]);
        let m = Modification::new(ModOp::Delete, "sn", vec!["Smith".into()]);
        delete_values(&s, &mut e, &m, false).unwrap();
        assert!(e.attr_by_name("sn").is_none());
    }

    #[test]
    fn delete_whole_attribute() {
        let s = schema();
        let mut e = entry_with(&s, &[("mail", &["a@x", "b@x"])]);
        let m = Modification::new(ModOp::Delete, "mail", vec![]);
        delete_values(&s, &mut e, &m, false).unwrap();
        assert!(e.attr_by_name("mail").is_none());
    }

    #[test]
    fn delete_absent_attribute_fails_unless_permissive() {
        let s = schema();
        let mut e = entry_with(&s, &[]);
        let m = Modification::new(ModOp::Delete, "mail", vec![]);
        assert!(matches!(
            delete_values(&s, &mut e, &m, false),
            Err(ModifyError::NoSuchAttribute { .. })
        ));
        delete_values(&s, &mut e, &m, true).unwrap();
    }

    #[test]
    fn delete_missing_value_is_atomic() {
        let s = schema();
        let mut e = entry_with(&s, &[("mail", &["a@x", "b@x"])]);
        let m = Modification::new(
            ModOp::Delete,
            "mail",
            vec!["a@x".into(), "missing@x".into()],
        );
        let err = delete_values(&s, &mut e, &m, false).unwrap_err();
        assert!(matches!(err, ModifyError::NoSuchAttribute { .. }));
        assert_eq!(raw_values(&e, "mail"), ["a@x", "b@x"]);
    }

    #[test]
    fn replace_with_empty_removes_attribute() {
        let s = schema();
        let mut e = entry_with(&s, &[("mail", &["a@x", "b@x"])]);
        let m = Modification::new(ModOp::Replace, "mail", vec![]);
        replace_values(&s, &mut e, &m, false).unwrap();
        assert!(e.attr_by_name("mail").is_none());
    }

    #[test]
    fn replace_absent_attribute_creates_it() {
        let s = schema();
        let mut e = entry_with(&s, &[]);
        let m = Modification::new(ModOp::Replace, "description", vec!["hi".into()]);
        replace_values(&s, &mut e, &m, false).unwrap();
        assert_eq!(raw_values(&e, "description"), ["hi"]);
    }

    #[test]
    fn replace_duplicate_values_violate_constraint() {
        let s = schema();
        let mut e = entry_with(&s, &[]);
        let m = Modification::new(ModOp::Replace, "cn", vec!["A".into(), "a".into()]);
        assert!(matches!(
            replace_values(&s, &mut e, &m, false),
            Err(ModifyError::ConstraintViolation { .. })
        ));
        // Permissive collapses instead.
        replace_values(&s, &mut e, &m, true).unwrap();
        assert_eq!(raw_values(&e, "cn"), ["A"]);
    }

    #[test]
    fn increment_integer_attribute() {
        let s = schema();
        let mut e = entry_with(&s, &[("uidNumber", &["1000"])]);
        let m = Modification::new(ModOp::Increment, "uidNumber", vec!["5".into()]);
        increment_values(&s, &mut e, &m, false).unwrap();
        assert_eq!(raw_values(&e, "uidNumber"), ["1005"]);
    }

    #[test]
    fn increment_negative_delta() {
        let s = schema();
        let mut e = entry_with(&s, &[("uidNumber", &["1000"])]);
        let m = Modification::new(ModOp::Increment, "uidNumber", vec!["-1".into()]);
        increment_values(&s, &mut e, &m, false).unwrap();
        assert_eq!(raw_values(&e, "uidNumber"), ["999"]);
    }

    #[test]
    fn increment_rejects_non_integer_attribute() {
        let s = schema();
        let mut e = entry_with(&s, &[("cn", &["Alice"])]);
        let m = Modification::new(ModOp::Increment, "cn", vec!["1".into()]);
        assert!(matches!(
            increment_values(&s, &mut e, &m, false),
            Err(ModifyError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn increment_rejects_absent_attribute() {
        let s = schema();
        let mut e = entry_with(&s, &[]);
        let m = Modification::new(ModOp::Increment, "uidNumber", vec!["1".into()]);
        assert!(matches!(
            increment_values(&s, &mut e, &m, false),
            Err(ModifyError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn soft_add_converts_duplicate_to_ok() {
        let s = schema();
        let mut e = entry_with(&s, &[("cn", &["Alice"])]);
        let m = Modification::new(ModOp::SoftAdd, "cn", vec!["alice".into()]);
        soft_add_values(&s, &mut e, &m, false).unwrap();
        assert_eq!(raw_values(&e, "cn"), ["Alice"]);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_values() -> impl Strategy<Value = Vec<String>> {
            proptest::collection::vec("[a-c]{1,3}", 0..4)
        }

        fn arb_op() -> impl Strategy<Value = ModOp> {
            prop_oneof![
                Just(ModOp::Add),
                Just(ModOp::Delete),
                Just(ModOp::Replace),
                Just(ModOp::Increment),
                Just(ModOp::SoftAdd),
            ]
        }

        proptest! {
            // A failed modification never leaves a partial effect behind.
            #[test]
            fn failure_leaves_entry_unchanged(
                existing in arb_values(),
                supplied in arb_values(),
                op in arb_op(),
                permissive in proptest::bool::ANY,
            ) {
                let s = schema();
                let mut e = entry_with(&s, &[]);
                if !existing.is_empty() {
                    let uniq: Vec<&str> = {
                        let mut seen = std::collections::BTreeSet::new();
                        existing.iter().filter(|v| seen.insert(v.as_str())).map(String::as_str).collect()
                    };
                    let desc = s.attr("cn").unwrap();
                    let vals = uniq.iter().map(|r| Value::normalized(&desc, r).unwrap()).collect();
                    e.attrs.push(Attribute::with_values(desc, vals));
                }
                let before = e.to_record();
                let m = Modification::new(op, "cn", supplied);
                if apply_modification(&s, &mut e, &m, permissive).is_err() {
                    prop_assert_eq!(e.to_record(), before);
                }
            }
        }
    }
}

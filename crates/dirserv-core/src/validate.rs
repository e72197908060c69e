//! Whole-entry schema validation.
//!
//! Runs after a modification list has been applied and before anything is
//! persisted: required attributes present, single-valued attributes
//! single-valued, values conformant to their syntax, and the objectClass
//! chain resolvable with exactly one structural class.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::entry::Entry;
use crate::schema::{ClassKind, ObjectClass, Schema};

/// A schema violation found on an entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("no objectClass attribute")]
    NoObjectClass,

    #[error("unknown object class: {0}")]
    UnknownClass(String),

    #[error("no structural object class")]
    NoStructuralClass,

    #[error("invalid structural object class chain: {a} / {b}")]
    AmbiguousStructural { a: String, b: String },

    #[error("structuralObjectClass {0} is not a structural class")]
    NotStructural(String),

    #[error("required attribute missing: {attr} (objectClass {class})")]
    MissingRequired { attr: String, class: String },

    #[error("attribute not allowed: {0}")]
    NotAllowed(String),

    #[error("attribute {0} is single-valued")]
    SingleValued(String),

    #[error("attribute {0} has duplicate values")]
    DuplicateValue(String),

    #[error("{attr}: value does not conform to syntax: {text}")]
    InvalidValue { attr: String, text: String },
}

/// Validates `entry` against `schema`.
///
/// `manage_dit` relaxes the structural-class requirements (the caller is
/// restructuring the tree and knows what it is doing); per-attribute rules
/// still apply.
pub fn entry_schema_check(
    schema: &Schema,
    entry: &Entry,
    manage_dit: bool,
) -> Result<(), SchemaViolation> {
    // Per-attribute rules first; they hold for every entry including glue.
    for attr in &entry.attrs {
        if attr.desc.single_valued && attr.vals.len() > 1 {
            return Err(SchemaViolation::SingleValued(attr.desc.name().to_owned()));
        }
        let mut seen = BTreeSet::new();
        for v in &attr.vals {
            if !seen.insert(v.norm()) {
                return Err(SchemaViolation::DuplicateValue(attr.desc.name().to_owned()));
            }
            attr.desc
                .syntax
                .validate(v.raw())
                .map_err(|text| SchemaViolation::InvalidValue {
                    attr: attr.desc.name().to_owned(),
                    text,
                })?;
        }
    }

    let Some(oc_attr) = entry.attr_by_name("objectClass") else {
        return Err(SchemaViolation::NoObjectClass);
    };

    let mut classes: Vec<Arc<ObjectClass>> = Vec::with_capacity(oc_attr.vals.len());
    for v in &oc_attr.vals {
        let oc = schema
            .class(v.norm())
            .ok_or_else(|| SchemaViolation::UnknownClass(v.raw().to_owned()))?;
        classes.push(oc);
    }

    // Subtree placeholders carry nothing but their marker class; content
    // rules do not apply to them.
    if entry.is_glue() {
        return Ok(());
    }

    if !manage_dit {
        check_structural(schema, entry, &classes)?;
    }

    // Required attributes, walking each class's superclass chain.
    for oc in &classes {
        for chained in schema.class_chain(&oc.name) {
            for must in &chained.must {
                if entry.attr_by_name(must).is_none() {
                    return Err(SchemaViolation::MissingRequired {
                        attr: must.clone(),
                        class: oc.name.clone(),
                    });
                }
            }
        }
    }

    // Content rule: every user attribute must be allowed by some class.
    let extensible = classes
        .iter()
        .any(|oc| oc.name.eq_ignore_ascii_case("extensibleObject"));
    if !extensible {
        let mut allowed: BTreeSet<String> = BTreeSet::new();
        for oc in &classes {
            for chained in schema.class_chain(&oc.name) {
                for name in chained.must.iter().chain(chained.may.iter()) {
                    allowed.insert(name.to_ascii_lowercase());
                }
            }
        }
        for attr in &entry.attrs {
            // Server-maintained; content rules govern user attributes only.
            if attr.desc.operational {
                continue;
            }
            let permitted = attr
                .desc
                .names
                .iter()
                .any(|n| allowed.contains(&n.to_ascii_lowercase()));
            if !permitted {
                return Err(SchemaViolation::NotAllowed(attr.desc.name().to_owned()));
            }
        }
    }

    Ok(())
}

/// Exactly one structural chain: all structural classes must sit on a single
/// superclass line, and `structuralObjectClass` (when present) must name a
/// structural class.
fn check_structural(
    schema: &Schema,
    entry: &Entry,
    classes: &[Arc<ObjectClass>],
) -> Result<(), SchemaViolation> {
    let structural: Vec<&Arc<ObjectClass>> = classes
        .iter()
        .filter(|oc| oc.kind == ClassKind::Structural)
        .collect();

    if structural.is_empty() {
        return Err(SchemaViolation::NoStructuralClass);
    }
    for pair in structural.windows(2) {
        let (a, b) = (&pair[0].name, &pair[1].name);
        if !schema.is_subclass_of(a, b) && !schema.is_subclass_of(b, a) {
            return Err(SchemaViolation::AmbiguousStructural {
                a: a.clone(),
                b: b.clone(),
            });
        }
    }

    if let Some(soc) = entry.attr_by_name("structuralObjectClass") {
        if let Some(v) = soc.vals.first() {
            let named = schema
                .class(v.norm())
                .ok_or_else(|| SchemaViolation::NotStructural(v.raw().to_owned()))?;
            if named.kind != ClassKind::Structural {
                return Err(SchemaViolation::NotStructural(v.raw().to_owned()));
            }
        }
    }

    Ok(())
}

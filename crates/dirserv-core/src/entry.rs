//! Entries, attributes and values.
//!
//! An [`Entry`] is the in-memory image of one directory record: a numeric id,
//! a DN in both presentation and normalized form, and an ordered attribute
//! list. Values carry their normalized form next to the raw bytes so matching
//! never re-normalizes; cloning an attribute list duplicates the containers
//! while the value storage stays shared.

use std::sync::Arc;

use crate::dn::Dn;
use crate::schema::{AttrDesc, Schema, SchemaError};

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// One attribute value: raw bytes plus the normalized form used for matching.
///
/// Both sides are `Arc<str>`, so clones share storage.
#[derive(Debug, Clone)]
pub struct Value {
    raw: Arc<str>,
    norm: Arc<str>,
}

impl Value {
    pub fn new(raw: impl Into<Arc<str>>, norm: impl Into<Arc<str>>) -> Self {
        Self {
            raw: raw.into(),
            norm: norm.into(),
        }
    }

    /// Normalizes `raw` under the attribute type's equality rule.
    pub fn normalized(desc: &AttrDesc, raw: &str) -> Result<Self, SchemaError> {
        let norm = desc.normalize_value(raw)?;
        Ok(Self::new(raw, norm))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn norm(&self) -> &str {
        &self.norm
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Value {}

/// Matches two values under the attribute's equality rule.
///
/// The rule is baked into the normalized form at construction time, so the
/// match itself is a byte comparison; types without an equality rule get
/// byte-exact semantics the same way.
pub fn value_match(_desc: &AttrDesc, a: &Value, b: &Value) -> bool {
    a.norm == b.norm
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// An attribute on an entry: resolved type plus its values in list order.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub desc: AttrDesc,
    pub vals: Vec<Value>,
    /// Scratch: this attribute's post-image values need an index add pass.
    /// Owned by the thread holding the working copy; cleared when the
    /// operation finishes.
    pub ix_add: bool,
    /// Scratch: this attribute's pre-image values need an index delete pass.
    pub ix_del: bool,
}

impl Attribute {
    pub fn new(desc: AttrDesc) -> Self {
        Self {
            desc,
            vals: Vec::new(),
            ix_add: false,
            ix_del: false,
        }
    }

    pub fn with_values(desc: AttrDesc, vals: Vec<Value>) -> Self {
        Self {
            desc,
            vals,
            ix_add: false,
            ix_del: false,
        }
    }

    /// Returns `true` if this attribute is of type `desc` (alias-aware).
    pub fn is(&self, desc: &AttrDesc) -> bool {
        Arc::ptr_eq(&self.desc, desc) || self.desc.name().eq_ignore_ascii_case(desc.name())
    }

    /// Position of `value` in the value list under the equality rule.
    pub fn find(&self, value: &Value) -> Option<usize> {
        self.vals.iter().position(|v| value_match(&self.desc, v, value))
    }

    /// The normalized forms of all values, in order.
    pub fn norm_values(&self) -> Vec<String> {
        self.vals.iter().map(|v| v.norm().to_owned()).collect()
    }

    pub fn clear_index_flags(&mut self) {
        self.ix_add = false;
        self.ix_del = false;
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Cached objectClass-derived facts; invalidated whenever `objectClass` or
/// `structuralObjectClass` changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OcFlags {
    valid: bool,
    glue: bool,
}

/// One directory record in memory.
#[derive(Debug, Clone)]
pub struct Entry {
    pub id: u64,
    pub dn: Dn,
    pub attrs: Vec<Attribute>,
    oc_flags: OcFlags,
}

impl Entry {
    pub fn new(id: u64, dn: Dn) -> Self {
        Self {
            id,
            dn,
            attrs: Vec::new(),
            oc_flags: OcFlags::default(),
        }
    }

    /// Finds the attribute of type `desc`, if present.
    pub fn attr_find(&self, desc: &AttrDesc) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.is(desc))
    }

    pub fn attr_find_mut(&mut self, desc: &AttrDesc) -> Option<&mut Attribute> {
        self.attrs.iter_mut().find(|a| a.is(desc))
    }

    /// Finds an attribute by type name (alias-aware, case-insensitive).
    pub fn attr_by_name(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.desc.named(name))
    }

    /// Position of the attribute of type `desc` in the attribute list.
    pub fn attr_position(&self, desc: &AttrDesc) -> Option<usize> {
        self.attrs.iter().position(|a| a.is(desc))
    }

    /// Removes the attribute of type `desc`, returning it if present.
    pub fn attr_remove(&mut self, desc: &AttrDesc) -> Option<Attribute> {
        let pos = self.attr_position(desc)?;
        Some(self.attrs.remove(pos))
    }

    /// Appends `attr`, replacing an existing attribute of the same type in
    /// place to preserve attribute order.
    pub fn attr_put(&mut self, attr: Attribute) {
        match self.attr_position(&attr.desc) {
            Some(pos) => self.attrs[pos] = attr,
            None => self.attrs.push(attr),
        }
    }

    /// Shallow clone of the attribute list: containers duplicated, value
    /// storage shared.
    pub fn attrs_dup(&self) -> Vec<Attribute> {
        self.attrs.clone()
    }

    /// Drops the cached objectClass facts; the next query recomputes them.
    pub fn invalidate_oc_flags(&mut self) {
        self.oc_flags = OcFlags::default();
    }

    /// Recomputes and caches the objectClass facts.
    pub fn refresh_oc_flags(&mut self) {
        self.oc_flags = OcFlags {
            valid: true,
            glue: self.compute_glue(),
        };
    }

    /// Returns `true` for a subtree placeholder entry.
    ///
    /// An entry is glue when its structural class is the literal `glue`, or,
    /// lacking a `structuralObjectClass`, when `glue` appears among its
    /// objectClass values.
    pub fn is_glue(&self) -> bool {
        if self.oc_flags.valid {
            return self.oc_flags.glue;
        }
        self.compute_glue()
    }

    fn compute_glue(&self) -> bool {
        if let Some(soc) = self.attr_by_name("structuralObjectClass") {
            return soc.vals.first().is_some_and(|v| v.norm() == "glue");
        }
        self.attr_by_name("objectClass")
            .is_some_and(|oc| oc.vals.iter().any(|v| v.norm() == "glue"))
    }

    /// Returns `true` if the entry is a referral object.
    pub fn is_referral(&self) -> bool {
        self.attr_by_name("objectClass")
            .is_some_and(|oc| oc.vals.iter().any(|v| v.norm() == "referral"))
    }

    /// The entry's referral URIs (`ref` values), if any.
    pub fn referral_uris(&self) -> Vec<String> {
        self.attr_by_name("ref")
            .map(|a| a.vals.iter().map(|v| v.raw().to_owned()).collect())
            .unwrap_or_default()
    }

    // -- Store encoding ------------------------------------------------------

    /// Flattens the attribute list to `(type name, raw values)` pairs for
    /// persistence.
    pub fn to_record(&self) -> Vec<(String, Vec<String>)> {
        self.attrs
            .iter()
            .map(|a| {
                (
                    a.desc.name().to_owned(),
                    a.vals.iter().map(|v| v.raw().to_owned()).collect(),
                )
            })
            .collect()
    }

    /// Rebuilds an entry from a persisted record, re-resolving types and
    /// normalized forms against `schema`.
    pub fn from_record(
        id: u64,
        dn: Dn,
        record: Vec<(String, Vec<String>)>,
        schema: &Schema,
    ) -> Result<Self, SchemaError> {
        let mut entry = Self::new(id, dn);
        for (name, raws) in record {
            let desc = schema.require_attr(&name)?;
            let mut vals = Vec::with_capacity(raws.len());
            for raw in raws {
                vals.push(Value::normalized(&desc, &raw)?);
            }
            entry.attrs.push(Attribute::with_values(desc, vals));
        }
        Ok(entry)
    }
}

//! The schema registry: attribute types, object classes, syntaxes and
//! matching rules.
//!
//! The registry is built once at startup and shared read-only behind an
//! `Arc`; every attribute on an in-memory entry holds an `Arc` into it so
//! matching rules resolve without further lookups.

use std::collections::HashMap;
use std::sync::Arc;

use num_bigint::BigInt;

use crate::dn;

/// Sentinel DN value stamped into `modifiersName` when an operation has no
/// authenticated bind name. Recognized by the DN syntax so anonymous stamps
/// survive validation.
pub const NULL_DN: &str = "NULLDN";

/// Error type for schema lookups and value normalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("attribute type undefined: {0}")]
    UnknownAttribute(String),

    #[error("object class undefined: {0}")]
    UnknownClass(String),

    #[error("{attr}: value does not conform to syntax: {text}")]
    InvalidValue {
        /// The attribute whose value failed.
        attr: String,
        /// What the syntax rejected.
        text: String,
    },
}

// ---------------------------------------------------------------------------
// Syntaxes and matching rules
// ---------------------------------------------------------------------------

/// The value syntax of an attribute type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// UTF-8 string, case preserved on store.
    DirectoryString,
    /// ASCII-only string (mail addresses, host names).
    Ia5String,
    /// Arbitrary-precision signed integer.
    Integer,
    /// A distinguished name.
    Dn,
    /// `YYYYMMDDhhmmssZ` timestamps.
    GeneralizedTime,
    /// Uninterpreted bytes; compared byte-exact.
    OctetString,
    /// Object identifiers and schema descriptors (objectClass values).
    Oid,
}

/// The equality matching rule attached to an attribute type.
///
/// Normalization bakes the rule into the stored normalized form, so two
/// normalized values match exactly when they are byte-equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqualityRule {
    CaseIgnore,
    CaseExact,
    Integer,
    DistinguishedName,
    OctetString,
    ObjectIdentifier,
}

impl Syntax {
    /// The default equality rule for the syntax.
    pub fn default_equality(self) -> EqualityRule {
        match self {
            Syntax::DirectoryString => EqualityRule::CaseIgnore,
            Syntax::Ia5String => EqualityRule::CaseIgnore,
            Syntax::Integer => EqualityRule::Integer,
            Syntax::Dn => EqualityRule::DistinguishedName,
            Syntax::GeneralizedTime => EqualityRule::CaseExact,
            Syntax::OctetString => EqualityRule::OctetString,
            Syntax::Oid => EqualityRule::ObjectIdentifier,
        }
    }

    /// Checks a raw value against the syntax without normalizing it.
    pub fn validate(self, raw: &str) -> Result<(), String> {
        match self {
            Syntax::DirectoryString | Syntax::OctetString => Ok(()),
            Syntax::Ia5String => {
                if raw.is_ascii() {
                    Ok(())
                } else {
                    Err("non-ASCII character in IA5 string".to_owned())
                }
            }
            Syntax::Integer => match raw.trim().parse::<BigInt>() {
                Ok(_) => Ok(()),
                Err(_) => Err(format!("not an integer: {raw:?}")),
            },
            Syntax::Dn => {
                if raw == NULL_DN {
                    return Ok(());
                }
                match dn::normalize(raw) {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            }
            Syntax::GeneralizedTime => {
                let bytes = raw.as_bytes();
                let ok = bytes.len() == 15
                    && bytes[..14].iter().all(u8::is_ascii_digit)
                    && bytes[14] == b'Z';
                if ok {
                    Ok(())
                } else {
                    Err(format!("not a generalized time: {raw:?}"))
                }
            }
            Syntax::Oid => {
                let ok = !raw.is_empty()
                    && raw
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
                if ok {
                    Ok(())
                } else {
                    Err(format!("not an OID or descriptor: {raw:?}"))
                }
            }
        }
    }
}

impl EqualityRule {
    /// Produces the canonical normalized form a value is stored and matched
    /// under.
    pub fn normalize(self, raw: &str) -> Result<String, String> {
        match self {
            EqualityRule::CaseIgnore => Ok(squash(raw.trim()).to_lowercase()),
            EqualityRule::CaseExact => Ok(squash(raw.trim())),
            EqualityRule::Integer => raw
                .trim()
                .parse::<BigInt>()
                .map(|v| v.to_string())
                .map_err(|_| format!("not an integer: {raw:?}")),
            EqualityRule::DistinguishedName => {
                if raw == NULL_DN {
                    return Ok(NULL_DN.to_ascii_lowercase());
                }
                dn::normalize(raw).map_err(|e| e.to_string())
            }
            EqualityRule::OctetString => Ok(raw.to_owned()),
            EqualityRule::ObjectIdentifier => Ok(raw.trim().to_ascii_lowercase()),
        }
    }
}

fn squash(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for c in s.chars() {
        if c.is_whitespace() {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Attribute types
// ---------------------------------------------------------------------------

/// A schema attribute type definition.
#[derive(Debug, Clone)]
pub struct AttributeType {
    /// Primary name plus aliases; lookups are case-insensitive on all of them.
    pub names: Vec<String>,
    pub syntax: Syntax,
    /// `None` means values compare byte-exact on the normalized form.
    pub equality: Option<EqualityRule>,
    pub single_valued: bool,
    /// Maintained by the server, not part of user content.
    pub operational: bool,
    /// Clients may never write this attribute directly.
    pub no_user_mod: bool,
}

/// A resolved, shareable pointer to an attribute type.
pub type AttrDesc = Arc<AttributeType>;

impl AttributeType {
    fn new(name: &str, syntax: Syntax) -> Self {
        Self {
            names: vec![name.to_owned()],
            syntax,
            equality: Some(syntax.default_equality()),
            single_valued: false,
            operational: false,
            no_user_mod: false,
        }
    }

    fn alias(mut self, alias: &str) -> Self {
        self.names.push(alias.to_owned());
        self
    }

    fn single(mut self) -> Self {
        self.single_valued = true;
        self
    }

    fn operational(mut self) -> Self {
        self.operational = true;
        self
    }

    fn no_user_mod(mut self) -> Self {
        self.no_user_mod = true;
        self
    }

    /// The primary name.
    pub fn name(&self) -> &str {
        &self.names[0]
    }

    /// Case-insensitive name match against any of the type's names.
    pub fn named(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    /// Normalizes a raw value under this type's equality rule.
    ///
    /// Types without an equality rule keep the raw bytes, so matching
    /// degrades to byte-exact comparison.
    pub fn normalize_value(&self, raw: &str) -> Result<String, SchemaError> {
        self.syntax
            .validate(raw)
            .and_then(|()| match self.equality {
                Some(rule) => rule.normalize(raw),
                None => Ok(raw.to_owned()),
            })
            .map_err(|text| SchemaError::InvalidValue {
                attr: self.name().to_owned(),
                text,
            })
    }
}

// ---------------------------------------------------------------------------
// Object classes
// ---------------------------------------------------------------------------

/// Kind of an object class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Abstract,
    Structural,
    Auxiliary,
}

/// A schema object class definition.
#[derive(Debug, Clone)]
pub struct ObjectClass {
    pub name: String,
    pub kind: ClassKind,
    /// Superclass name, `None` only for `top` and standalone classes.
    pub sup: Option<String>,
    /// Required attribute names.
    pub must: Vec<String>,
    /// Permitted attribute names.
    pub may: Vec<String>,
}

impl ObjectClass {
    fn new(name: &str, kind: ClassKind, sup: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            sup: sup.map(str::to_owned),
            must: Vec::new(),
            may: Vec::new(),
        }
    }

    fn must(mut self, attrs: &[&str]) -> Self {
        self.must = attrs.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    fn may(mut self, attrs: &[&str]) -> Self {
        self.may = attrs.iter().map(|s| (*s).to_owned()).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The schema registry. Built at startup, then read-only.
#[derive(Debug, Default)]
pub struct Schema {
    attrs: HashMap<String, AttrDesc>,
    classes: HashMap<String, Arc<ObjectClass>>,
}

impl Schema {
    /// An empty registry; callers register their own elements.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in core schema: the operational lastmod attributes, the
    /// common user attributes the tests and built-in classes rely on, and the
    /// `top`/`glue`/`referral` machinery classes.
    pub fn core() -> Self {
        let mut s = Self::new();

        s.register_attr(
            AttributeType::new("objectClass", Syntax::Oid),
        );
        s.register_attr(
            AttributeType::new("structuralObjectClass", Syntax::Oid)
                .single()
                .operational(),
        );
        s.register_attr(AttributeType::new("cn", Syntax::DirectoryString).alias("commonName"));
        s.register_attr(AttributeType::new("sn", Syntax::DirectoryString).alias("surname"));
        s.register_attr(AttributeType::new("ou", Syntax::DirectoryString));
        s.register_attr(AttributeType::new("mail", Syntax::Ia5String));
        s.register_attr(AttributeType::new("description", Syntax::DirectoryString));
        s.register_attr(AttributeType::new("seeAlso", Syntax::Dn));
        s.register_attr(AttributeType::new("uidNumber", Syntax::Integer).single());
        s.register_attr(AttributeType::new("ref", Syntax::Ia5String));

        s.register_attr(
            AttributeType::new("creatorsName", Syntax::Dn)
                .single()
                .operational()
                .no_user_mod(),
        );
        s.register_attr(
            AttributeType::new("createTimestamp", Syntax::GeneralizedTime)
                .single()
                .operational()
                .no_user_mod(),
        );
        s.register_attr(
            AttributeType::new("modifiersName", Syntax::Dn)
                .single()
                .operational()
                .no_user_mod(),
        );
        s.register_attr(
            AttributeType::new("modifyTimestamp", Syntax::GeneralizedTime)
                .single()
                .operational()
                .no_user_mod(),
        );

        s.register_class(
            ObjectClass::new("top", ClassKind::Abstract, None).must(&["objectClass"]),
        );
        s.register_class(
            ObjectClass::new("person", ClassKind::Structural, Some("top"))
                .must(&["cn", "sn"])
                .may(&["mail", "description", "seeAlso", "uidNumber"]),
        );
        s.register_class(
            ObjectClass::new("organizationalUnit", ClassKind::Structural, Some("top"))
                .must(&["ou"])
                .may(&["description", "seeAlso"]),
        );
        s.register_class(
            ObjectClass::new("referral", ClassKind::Structural, Some("top")).must(&["ref"]),
        );
        // Subtree placeholder; entries of this class are synthesized, never
        // created by clients.
        s.register_class(ObjectClass::new("glue", ClassKind::Structural, Some("top")));
        s.register_class(ObjectClass::new("extensibleObject", ClassKind::Auxiliary, Some("top")));

        s
    }

    /// Registers an attribute type under all its names.
    pub fn register_attr(&mut self, at: AttributeType) {
        let desc: AttrDesc = Arc::new(at);
        for name in &desc.names {
            self.attrs.insert(name.to_ascii_lowercase(), Arc::clone(&desc));
        }
    }

    /// Registers an object class.
    pub fn register_class(&mut self, oc: ObjectClass) {
        let key = oc.name.to_ascii_lowercase();
        self.classes.insert(key, Arc::new(oc));
    }

    /// Resolves an attribute name (any alias, any case).
    pub fn attr(&self, name: &str) -> Option<AttrDesc> {
        self.attrs.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Resolves an attribute name or fails with [`SchemaError::UnknownAttribute`].
    pub fn require_attr(&self, name: &str) -> Result<AttrDesc, SchemaError> {
        self.attr(name)
            .ok_or_else(|| SchemaError::UnknownAttribute(name.to_owned()))
    }

    /// Resolves an object class name (any case).
    pub fn class(&self, name: &str) -> Option<Arc<ObjectClass>> {
        self.classes.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Walks the superclass chain starting at `name`, most-derived first.
    ///
    /// Unknown names terminate the walk; the caller validates resolvability
    /// separately.
    pub fn class_chain(&self, name: &str) -> Vec<Arc<ObjectClass>> {
        let mut out = Vec::new();
        let mut cur = self.class(name);
        while let Some(oc) = cur {
            cur = oc.sup.as_deref().and_then(|s| self.class(s));
            out.push(oc);
        }
        out
    }

    /// Returns `true` if `ancestor` appears in the superclass chain of
    /// `name` (inclusive).
    pub fn is_subclass_of(&self, name: &str, ancestor: &str) -> bool {
        self.class_chain(name)
            .iter()
            .any(|oc| oc.name.eq_ignore_ascii_case(ancestor))
    }
}

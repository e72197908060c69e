//! Distinguished names and their normalized form.
//!
//! Every entry is addressed by a DN in two shapes: the presentation string as
//! the client sent it, and the normalized form (`ndn`) used for lookups and
//! suffix matching. Normalization case-folds attribute types and values and
//! strips insignificant whitespace, so two spellings of the same name compare
//! byte-equal.

use serde::{Deserialize, Serialize};

/// Error type for DN parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DnError {
    #[error("RDN has no attribute type: {0:?}")]
    MissingType(String),

    #[error("RDN has an empty attribute type: {0:?}")]
    EmptyType(String),

    #[error("RDN has an empty value: {0:?}")]
    EmptyValue(String),

    #[error("trailing escape character")]
    TrailingEscape,
}

/// A distinguished name: presentation string plus normalized form.
///
/// The empty DN is valid and names the root of the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dn {
    raw: String,
    norm: String,
}

impl Dn {
    /// Parses and normalizes a DN string.
    pub fn parse(s: &str) -> Result<Self, DnError> {
        let norm = normalize(s)?;
        Ok(Self {
            raw: s.to_owned(),
            norm,
        })
    }

    /// The root DN (empty name).
    pub fn root() -> Self {
        Self {
            raw: String::new(),
            norm: String::new(),
        }
    }

    /// The presentation form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The normalized form used for lookup and comparison.
    pub fn normalized(&self) -> &str {
        &self.norm
    }

    /// Returns `true` for the empty (root) DN.
    pub fn is_root(&self) -> bool {
        self.norm.is_empty()
    }

    /// Returns `true` if `suffix` is this DN or an ancestor of it.
    ///
    /// The root DN is a suffix of every DN. Matching respects RDN
    /// boundaries: `ou=people,dc=example,dc=com` is within `dc=example,dc=com`
    /// but `dc=notexample,dc=com` is not within `dc=example,dc=com`.
    pub fn is_within(&self, suffix: &Dn) -> bool {
        if suffix.is_root() {
            return true;
        }
        if self.norm == suffix.norm {
            return true;
        }
        self.norm
            .strip_suffix(&suffix.norm)
            .is_some_and(|head| head.ends_with(','))
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Dn {}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.norm.hash(state);
    }
}

impl std::fmt::Display for Dn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Normalizes a DN string without building a [`Dn`].
///
/// Splits on unescaped commas, normalizes each RDN as
/// `lowercase(type)=casefold(value)` with outer whitespace trimmed and inner
/// runs collapsed to a single space.
pub fn normalize(s: &str) -> Result<String, DnError> {
    if s.trim().is_empty() {
        return Ok(String::new());
    }

    let mut out = Vec::new();
    for rdn in split_unescaped(s, ',')? {
        out.push(normalize_rdn(&rdn)?);
    }
    Ok(out.join(","))
}

fn normalize_rdn(rdn: &str) -> Result<String, DnError> {
    let Some(eq) = find_unescaped(rdn, '=') else {
        return Err(DnError::MissingType(rdn.trim().to_owned()));
    };
    let (ty, val) = rdn.split_at(eq);
    let val = &val[1..];

    let ty = ty.trim().to_ascii_lowercase();
    if ty.is_empty() {
        return Err(DnError::EmptyType(rdn.trim().to_owned()));
    }
    let val = squash_spaces(val.trim()).to_lowercase();
    if val.is_empty() {
        return Err(DnError::EmptyValue(rdn.trim().to_owned()));
    }
    Ok(format!("{ty}={val}"))
}

/// Collapses internal whitespace runs to a single space.
fn squash_spaces(s: &str) -> String {
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

/// Splits on unescaped occurrences of `sep`, keeping escapes in place.
fn split_unescaped(s: &str, sep: char) -> Result<Vec<String>, DnError> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let Some(next) = chars.next() else {
                return Err(DnError::TrailingEscape);
            };
            cur.push('\\');
            cur.push(next);
        } else if c == sep {
            parts.push(std::mem::take(&mut cur));
        } else {
            cur.push(c);
        }
    }
    parts.push(cur);
    Ok(parts)
}

/// Index of the first unescaped occurrence of `sep`, if any.
fn find_unescaped(s: &str, sep: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some(i);
        }
    }
    None
}

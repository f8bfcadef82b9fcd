//! Authorization Groups
//!
//! Callers reach the triple store through an authorizing proxy that scopes
//! every query to a set of allowed groups. Search indexes are partitioned
//! along those groups: two callers with the same canonical group set share
//! an index, everyone else gets their own.
//!
//! Canonicalization sorts groups by `name ∥ concat(variables)`. The order of
//! a group's `variables` is semantically significant and is never touched.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Header carrying the caller's allowed groups as a JSON array.
pub const ALLOWED_GROUPS_HEADER: &str = "MU-AUTH-ALLOWED-GROUPS";

/// Header marking a query as unrestricted.
pub const SUDO_HEADER: &str = "MU-AUTH-SUDO";

/// One authorization group: a name plus ordered variable bindings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthGroup {
    pub name: String,
    #[serde(default)]
    pub variables: Vec<String>,
}

impl AuthGroup {
    pub fn new(name: impl Into<String>, variables: Vec<String>) -> Self {
        AuthGroup {
            name: name.into(),
            variables,
        }
    }

    /// Sort key: name followed by the variables in their given order.
    fn sort_key(&self) -> String {
        let mut key = self.name.clone();
        for v in &self.variables {
            key.push_str(v);
        }
        key
    }
}

impl fmt::Display for AuthGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.variables.join(","))
    }
}

/// An ordered, canonicalized set of authorization groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupSet(Vec<AuthGroup>);

impl GroupSet {
    /// Canonicalize a list of groups: sort by the group sort key, with the
    /// full group value breaking ties so distinct groups sharing a sort key
    /// still land in one deterministic order. Group order in the input does
    /// not matter; variable order does.
    pub fn canonical(mut groups: Vec<AuthGroup>) -> Self {
        groups.sort_by(|a, b| {
            a.sort_key()
                .cmp(&b.sort_key())
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.variables.cmp(&b.variables))
        });
        GroupSet(groups)
    }

    pub fn groups(&self) -> &[AuthGroup] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The canonical JSON serialization, used as the index partition key and
    /// as the header value for group-scoped queries.
    pub fn serialized(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    /// Parse a `MU-AUTH-ALLOWED-GROUPS` header value and canonicalize it.
    pub fn parse_header(value: &str) -> Result<Self, serde_json::Error> {
        let groups: Vec<AuthGroup> = serde_json::from_str(value)?;
        Ok(Self::canonical(groups))
    }

    /// Drop groups matching any ignored pattern, then re-canonicalize.
    ///
    /// A pattern matches when its name equals the group's name and its
    /// variables are either empty (wildcard) or exactly equal.
    pub fn without_ignored(&self, ignored: &[AuthGroup]) -> Self {
        let kept = self
            .0
            .iter()
            .filter(|g| {
                !ignored.iter().any(|pattern| {
                    pattern.name == g.name
                        && (pattern.variables.is_empty() || pattern.variables == g.variables)
                })
            })
            .cloned()
            .collect();
        GroupSet(kept)
    }
}

//! RDF Terms and Triples
//!
//! Core data model for everything that crosses the triple-store boundary:
//! terms (URIs and literals), triples tagged with their delta direction, and
//! SPARQL text rendering for both.
//!
//! Terms are modeled as a tagged sum type with an explicit discriminator
//! rather than strings-with-markers, so downstream code matches on structure
//! instead of re-parsing.

pub mod client;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The `rdf:type` predicate.
pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

/// Platform UUID-tagging predicate. Carried on every resource by the
/// platform; has no bearing on path matching and is filtered out of delta
/// processing.
pub const UUID_PREDICATE: &str = "http://mu.semte.ch/vocabularies/core/uuid";

// XSD datatypes the document builder converts specially.
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_LONG: &str = "http://www.w3.org/2001/XMLSchema#long";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
pub const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
pub const XSD_FLOAT: &str = "http://www.w3.org/2001/XMLSchema#float";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
pub const XSD_DATE: &str = "http://www.w3.org/2001/XMLSchema#date";
pub const XSD_TIME: &str = "http://www.w3.org/2001/XMLSchema#time";
pub const XSD_DATETIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";

/// An RDF term: either a URI or a literal with optional datatype/language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Term {
    Uri {
        value: String,
    },
    Literal {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        datatype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

impl Term {
    /// Construct a URI term.
    pub fn uri(value: impl Into<String>) -> Self {
        Term::Uri {
            value: value.into(),
        }
    }

    /// Construct a plain literal term.
    pub fn literal(value: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: None,
            language: None,
        }
    }

    /// Construct a language-tagged literal.
    pub fn lang_literal(value: impl Into<String>, language: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: None,
            language: Some(language.into()),
        }
    }

    /// Construct a datatyped literal.
    pub fn typed_literal(value: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: Some(datatype.into()),
            language: None,
        }
    }

    pub fn is_uri(&self) -> bool {
        matches!(self, Term::Uri { .. })
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Term::Literal { .. })
    }

    /// The lexical value, regardless of term kind.
    pub fn value(&self) -> &str {
        match self {
            Term::Uri { value } | Term::Literal { value, .. } => value,
        }
    }

    /// Render this term as it appears in a SPARQL query.
    ///
    /// URIs become `<uri>`, plain literals `"value"`, language-tagged
    /// literals `"value"@lang`, datatyped literals `"value"^^<dt>`.
    pub fn to_sparql(&self) -> String {
        match self {
            Term::Uri { value } => format!("<{value}>"),
            Term::Literal {
                value,
                datatype,
                language,
            } => {
                let escaped = escape_literal(value);
                if let Some(lang) = language {
                    format!("\"{escaped}\"@{lang}")
                } else if let Some(dt) = datatype {
                    format!("\"{escaped}\"^^<{dt}>")
                } else {
                    format!("\"{escaped}\"")
                }
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sparql())
    }
}

/// A triple-diff entry: one triple tagged with its delta direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: Term,
    pub is_addition: bool,
}

impl Triple {
    pub fn addition(subject: impl Into<String>, predicate: impl Into<String>, object: Term) -> Self {
        Triple {
            subject: subject.into(),
            predicate: predicate.into(),
            object,
            is_addition: true,
        }
    }

    pub fn deletion(subject: impl Into<String>, predicate: impl Into<String>, object: Term) -> Self {
        Triple {
            subject: subject.into(),
            predicate: predicate.into(),
            object,
            is_addition: false,
        }
    }
}

/// Escape a literal value for embedding in a SPARQL string.
pub fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a string for embedding inside a `<...>` IRI reference.
///
/// URIs arriving from deltas are already absolute; this only guards the
/// characters that would terminate or corrupt the reference.
pub fn escape_uri(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | ' '))
        .collect()
}

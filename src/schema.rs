//! Search Type Schema
//!
//! Parses the configured document types into their runtime form: each type
//! names the RDF classes whose instances are its root subjects, and maps
//! document properties to property paths through the graph.
//!
//! Paths are parsed exactly once at config load. A caret prefix (`^pred`)
//! marks an inverse edge; after parsing, edges carry an explicit `inverse`
//! flag and the caret never appears again.

use crate::rdf::Triple;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Schema loading errors. All raised eagerly at config load.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Duplicate type name: {0}")]
    DuplicateTypeName(String),

    #[error("Duplicate on_path: {0}")]
    DuplicateOnPath(String),

    #[error("Type '{0}' has neither rdf_types nor composite_of")]
    MissingRdfTypes(String),

    #[error("Composite type '{0}' references unknown constituent '{1}'")]
    UnknownConstituent(String, String),

    #[error("Property '{1}' of type '{0}': {2}")]
    InvalidProperty(String, String, String),
}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

/// One step of a property path: a predicate, traversed forward or inverse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathEdge {
    pub predicate: String,
    pub inverse: bool,
}

impl PathEdge {
    /// Parse a configured edge string. A leading `^` marks an inverse edge.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('^') {
            Some(predicate) => PathEdge {
                predicate: predicate.to_string(),
                inverse: true,
            },
            None => PathEdge {
                predicate: raw.to_string(),
                inverse: false,
            },
        }
    }

    /// Render this edge as a SPARQL property-path step.
    pub fn to_sparql(&self) -> String {
        if self.inverse {
            format!("^<{}>", self.predicate)
        } else {
            format!("<{}>", self.predicate)
        }
    }
}

/// Render a sequence of edges as a SPARQL property path (`/` composition).
pub fn path_to_sparql(edges: &[PathEdge]) -> String {
    edges
        .iter()
        .map(PathEdge::to_sparql)
        .collect::<Vec<_>>()
        .join("/")
}

/// What a property's bindings mean for the document.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    /// Literal or URI values embedded as scalars.
    Simple,
    /// Language-tagged values grouped into a `{lang: value}` map.
    LanguageString,
    /// Related resources embedded as recursive sub-documents.
    Nested {
        rdf_type: Option<String>,
        sub_properties: Vec<PropertyDefinition>,
    },
    /// File resources run through the content extractor.
    Attachment { pipeline: String },
}

/// A single document property and the path that produces its values.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    pub path: Vec<PathEdge>,
    pub kind: PropertyKind,
}

/// A match of a predicate somewhere inside a property path.
#[derive(Debug, Clone, Copy)]
pub struct PathMatch<'a> {
    pub path: &'a [PathEdge],
    pub position: usize,
}

/// A configured document type.
#[derive(Debug, Clone)]
pub struct TypeDefinition {
    pub name: String,
    pub on_path: String,
    pub rdf_types: Vec<String>,
    pub properties: Vec<PropertyDefinition>,
    pub composite_of: Vec<String>,
}

impl TypeDefinition {
    pub fn is_composite(&self) -> bool {
        !self.composite_of.is_empty()
    }

    /// Does `class_uri` name one of this type's root classes?
    pub fn matches_class(&self, class_uri: &str) -> bool {
        self.rdf_types.iter().any(|t| t == class_uri)
    }

    /// Does any property path contain `predicate`, forward or inverse?
    pub fn matches_predicate(&self, predicate: &str) -> bool {
        self.properties
            .iter()
            .any(|p| p.path.iter().any(|e| e.predicate == predicate))
    }

    /// Every (path, position) at which `predicate` occurs across this
    /// type's property paths.
    pub fn path_matches<'a>(&'a self, predicate: &str) -> Vec<PathMatch<'a>> {
        let mut matches = Vec::new();
        for property in &self.properties {
            for (position, edge) in property.path.iter().enumerate() {
                if edge.predicate == predicate {
                    matches.push(PathMatch {
                        path: &property.path,
                        position,
                    });
                }
            }
        }
        matches
    }
}

// ── Raw (serde) form ────────────────────────────────────────────────────────

/// A type definition as it appears in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTypeDefinition {
    pub name: String,
    pub on_path: String,
    #[serde(default)]
    pub rdf_types: Vec<String>,
    #[serde(default)]
    pub composite_of: Vec<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

/// A property value in the settings file: a bare path, or a detailed object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawProperty {
    Single(String),
    Sequence(Vec<String>),
    Detailed(RawDetailedProperty),
}

#[derive(Debug, Clone, Deserialize)]
struct RawDetailedProperty {
    path: RawPath,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    rdf_type: Option<String>,
    #[serde(default)]
    properties: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pipeline: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawPath {
    Single(String),
    Sequence(Vec<String>),
}

impl RawPath {
    fn parse(self) -> Vec<PathEdge> {
        match self {
            RawPath::Single(s) => vec![PathEdge::parse(&s)],
            RawPath::Sequence(parts) => parts.iter().map(|s| PathEdge::parse(s)).collect(),
        }
    }
}

fn parse_properties(
    type_name: &str,
    raw: &serde_json::Map<String, Value>,
) -> SchemaResult<Vec<PropertyDefinition>> {
    let mut properties = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        let parsed: RawProperty = serde_json::from_value(value.clone()).map_err(|e| {
            SchemaError::InvalidProperty(type_name.to_string(), name.clone(), e.to_string())
        })?;
        properties.push(parse_property(type_name, name, parsed)?);
    }
    Ok(properties)
}

fn parse_property(
    type_name: &str,
    name: &str,
    raw: RawProperty,
) -> SchemaResult<PropertyDefinition> {
    let invalid = |reason: &str| {
        SchemaError::InvalidProperty(type_name.to_string(), name.to_string(), reason.to_string())
    };

    let (path, kind) = match raw {
        RawProperty::Single(s) => (vec![PathEdge::parse(&s)], PropertyKind::Simple),
        RawProperty::Sequence(parts) => (
            parts.iter().map(|s| PathEdge::parse(s)).collect(),
            PropertyKind::Simple,
        ),
        RawProperty::Detailed(detail) => {
            let path = detail.path.parse();
            let kind = match detail.kind.as_deref() {
                None | Some("simple") => PropertyKind::Simple,
                Some("language-string") => PropertyKind::LanguageString,
                Some("nested") => {
                    let sub_raw = detail
                        .properties
                        .ok_or_else(|| invalid("nested property requires sub-properties"))?;
                    PropertyKind::Nested {
                        rdf_type: detail.rdf_type,
                        sub_properties: parse_properties(type_name, &sub_raw)?,
                    }
                }
                Some("attachment") => PropertyKind::Attachment {
                    pipeline: detail.pipeline.unwrap_or_else(|| "text".to_string()),
                },
                Some(other) => return Err(invalid(&format!("unknown property kind '{other}'"))),
            };
            (path, kind)
        }
    };

    if path.is_empty() {
        return Err(invalid("property path must not be empty"));
    }

    Ok(PropertyDefinition {
        name: name.to_string(),
        path,
        kind,
    })
}

// ── Schema catalog ──────────────────────────────────────────────────────────

/// The validated set of configured types with lookup helpers.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: Vec<Arc<TypeDefinition>>,
}

impl Schema {
    /// Parse and validate the raw configured types.
    pub fn from_raw(raw: &[RawTypeDefinition]) -> SchemaResult<Self> {
        let mut seen_names = HashSet::new();
        let mut seen_paths = HashSet::new();
        let mut types = Vec::with_capacity(raw.len());

        for raw_type in raw {
            if !seen_names.insert(raw_type.name.clone()) {
                return Err(SchemaError::DuplicateTypeName(raw_type.name.clone()));
            }
            if !seen_paths.insert(raw_type.on_path.clone()) {
                return Err(SchemaError::DuplicateOnPath(raw_type.on_path.clone()));
            }
            if raw_type.rdf_types.is_empty() && raw_type.composite_of.is_empty() {
                return Err(SchemaError::MissingRdfTypes(raw_type.name.clone()));
            }

            types.push(Arc::new(TypeDefinition {
                name: raw_type.name.clone(),
                on_path: raw_type.on_path.clone(),
                rdf_types: raw_type.rdf_types.clone(),
                properties: parse_properties(&raw_type.name, &raw_type.properties)?,
                composite_of: raw_type.composite_of.clone(),
            }));
        }

        // Composite constituents must resolve to configured non-composite types.
        for t in &types {
            for constituent in &t.composite_of {
                if !types.iter().any(|c| &c.name == constituent) {
                    return Err(SchemaError::UnknownConstituent(
                        t.name.clone(),
                        constituent.clone(),
                    ));
                }
            }
        }

        Ok(Schema { types })
    }

    pub fn types(&self) -> &[Arc<TypeDefinition>] {
        &self.types
    }

    pub fn type_named(&self, name: &str) -> Option<Arc<TypeDefinition>> {
        self.types.iter().find(|t| t.name == name).cloned()
    }

    pub fn type_on_path(&self, on_path: &str) -> Option<Arc<TypeDefinition>> {
        self.types.iter().find(|t| t.on_path == on_path).cloned()
    }

    /// Constituent definitions of a composite type, in declared order.
    pub fn constituents(&self, composite: &TypeDefinition) -> Vec<Arc<TypeDefinition>> {
        composite
            .composite_of
            .iter()
            .filter_map(|name| self.type_named(name))
            .collect()
    }

    /// Types a single delta triple can affect. Composite types never take
    /// part in delta-driven discovery; their constituents do.
    ///
    /// `rdf:type` triples match on the object class; all others match on
    /// predicate containment in some property path.
    pub fn affected_types(&self, triple: &Triple) -> Vec<Arc<TypeDefinition>> {
        self.types
            .iter()
            .filter(|t| !t.is_composite())
            .filter(|t| {
                if triple.predicate == crate::rdf::RDF_TYPE {
                    triple.object.is_uri() && t.matches_class(triple.object.value())
                } else {
                    t.matches_predicate(&triple.predicate)
                }
            })
            .cloned()
            .collect()
    }
}

//! Shape Grouping
//!
//! Stage two of delta dispatch: for one affected type, split a batch of
//! triples into
//!
//! - *known subjects*: subjects of `rdf:type` triples naming one of the
//!   type's root classes. These are root subjects by definition and need no
//!   query at all.
//! - *shape buckets*: every other triple is bucketed under the 4-tuple
//!   `(path, position, inverse, is_addition)` for each position at which its
//!   predicate occurs in a property path. One discovery query is issued per
//!   bucket slice, so triples sharing a shape share a query.
//!
//! Two matches are discarded up front because they cannot produce new
//! roots: a literal object sitting at a non-terminal forward position (the
//! traversal cannot continue through a literal), and a position-0 forward
//! match whose subject is already in the known set.

use crate::rdf::{Triple, RDF_TYPE};
use crate::schema::{PathEdge, TypeDefinition};
use std::collections::{BTreeSet, HashMap};

/// Identifies one discovery-query pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey {
    pub path: Vec<PathEdge>,
    pub position: usize,
    pub inverse: bool,
    pub is_addition: bool,
}

/// The per-type dispatch split.
#[derive(Debug, Default)]
pub struct TypeDispatch {
    /// Root subjects known without querying.
    pub known_subjects: BTreeSet<String>,
    /// Triples grouped by discovery-query shape.
    pub buckets: HashMap<ShapeKey, Vec<Triple>>,
}

impl TypeDispatch {
    pub fn is_empty(&self) -> bool {
        self.known_subjects.is_empty() && self.buckets.is_empty()
    }
}

/// Split `triples` for one affected type definition.
pub fn dispatch_for_type(type_def: &TypeDefinition, triples: &[Triple]) -> TypeDispatch {
    let mut dispatch = TypeDispatch::default();

    // Known subjects first: the position-0 discard below depends on them.
    for triple in triples {
        if is_known_subject_triple(type_def, triple) {
            dispatch.known_subjects.insert(triple.subject.clone());
        }
    }

    for triple in triples {
        if is_known_subject_triple(type_def, triple) {
            continue;
        }
        for path_match in type_def.path_matches(&triple.predicate) {
            let position = path_match.position;
            let edge = &path_match.path[position];
            let terminal = position == path_match.path.len() - 1;

            // A literal cannot be traversed through on a forward edge.
            if !terminal && !edge.inverse && triple.object.is_literal() {
                continue;
            }
            // Position-0 forward match on an already-known subject adds
            // no information.
            if position == 0
                && !edge.inverse
                && dispatch.known_subjects.contains(&triple.subject)
            {
                continue;
            }

            let key = ShapeKey {
                path: path_match.path.to_vec(),
                position,
                inverse: edge.inverse,
                is_addition: triple.is_addition,
            };
            dispatch.buckets.entry(key).or_default().push(triple.clone());
        }
    }

    dispatch
}

fn is_known_subject_triple(type_def: &TypeDefinition, triple: &Triple) -> bool {
    triple.predicate == RDF_TYPE
        && triple.object.is_uri()
        && type_def.matches_class(triple.object.value())
}

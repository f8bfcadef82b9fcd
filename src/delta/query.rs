//! Discovery Query Construction
//!
//! Builds one parameterized SELECT per shape bucket slice. All triples in a
//! slice share `(path, position, inverse, is_addition)`, so they differ only
//! in the terms bound through the VALUES clause; the graph patterns around
//! it are fixed by the shape.
//!
//! The query always asserts `?s a ?type` over the type's root classes, then
//!
//! - walks `path[0..position-1]` from `?s` down to `?target_sub` (absent at
//!   position 0, where `?target_sub` ≡ `?s`),
//! - for additions, re-asserts the changed edge itself (`triple_check`) and
//!   requires the rest of the path to exist (`path_from_target`),
//! - for deletions, stops at the target: the deleted triple cannot be
//!   re-traversed, so its target end is bound directly from the delta and
//!   only the path prefix is composed.
//!
//! For an inverse edge the changed triple points *at* the target: the
//! target end is the triple's object and the source end its subject. That
//! holds at position 0 too, where the target end is the root itself.

use crate::delta::shapes::ShapeKey;
use crate::rdf::{escape_uri, Triple};
use crate::schema::path_to_sparql;

/// Build the discovery query for one slice of a shape bucket.
/// Returns the SELECT text; every bound `?s` is a stale root subject.
pub fn build_discovery_query(
    rdf_types: &[String],
    shape: &ShapeKey,
    slice: &[Triple],
) -> String {
    let type_values = rdf_types
        .iter()
        .map(|t| format!("<{}>", escape_uri(t)))
        .collect::<Vec<_>>()
        .join(" ");

    let terminal_var = if shape.position == 0 { "?s" } else { "?target_sub" };

    let (vars, rows) = values_clause(shape, slice, terminal_var);

    let mut patterns: Vec<String> = Vec::new();
    patterns.push(format!("VALUES ?type {{ {type_values} }}"));
    patterns.push(format!("VALUES ({vars}) {{ {rows} }}"));
    patterns.push("?s a ?type .".to_string());

    if shape.position > 0 {
        let prefix = path_to_sparql(&shape.path[..shape.position]);
        patterns.push(format!("?s {prefix} ?target_sub ."));
    }

    if shape.is_addition {
        let predicate = escape_uri(&shape.path[shape.position].predicate);
        if shape.inverse {
            patterns.push(format!("?triple_sub <{predicate}> {terminal_var} ."));
        } else {
            patterns.push(format!("{terminal_var} <{predicate}> ?obj ."));
        }

        let suffix = &shape.path[shape.position + 1..];
        if !suffix.is_empty() {
            let suffix_root = if shape.inverse { "?triple_sub" } else { "?obj" };
            let suffix_path = path_to_sparql(suffix);
            patterns.push(format!("{suffix_root} {suffix_path} ?foo ."));
        }
    }

    format!(
        "SELECT DISTINCT ?s WHERE {{\n  {}\n}}",
        patterns.join("\n  ")
    )
}

/// The VALUES variable tuple and its rows for this shape.
fn values_clause(shape: &ShapeKey, slice: &[Triple], terminal_var: &str) -> (String, String) {
    let vars = if shape.is_addition {
        if shape.inverse {
            format!("{terminal_var} ?triple_sub")
        } else {
            format!("{terminal_var} ?obj")
        }
    } else {
        terminal_var.to_string()
    };

    let rows = slice
        .iter()
        .map(|triple| {
            let subject = format!("<{}>", escape_uri(&triple.subject));
            if shape.is_addition {
                if shape.inverse {
                    // Target end is the object, source end the subject.
                    format!("({} {})", triple.object.to_sparql(), subject)
                } else {
                    format!("({} {})", subject, triple.object.to_sparql())
                }
            } else if shape.inverse {
                format!("({})", triple.object.to_sparql())
            } else {
                format!("({subject})")
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    (vars, rows)
}

//! End-to-end delta dispatch scenarios: wire message in, shape buckets and
//! discovery queries out. Everything here is exercised without a running
//! triple store; the discovery stage is split so that query construction is
//! observable before execution.

use deltasearch::delta::query::build_discovery_query;
use deltasearch::delta::shapes::dispatch_for_type;
use deltasearch::delta::DeltaHandler;
use deltasearch::schema::{RawTypeDefinition, Schema};
use deltasearch::{Term, Triple};
use serde_json::json;
use std::sync::Arc;

const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

fn schema_from(types: serde_json::Value) -> Arc<Schema> {
    let raw: Vec<RawTypeDefinition> = serde_json::from_value(types).unwrap();
    Arc::new(Schema::from_raw(&raw).unwrap())
}

fn session_schema() -> Arc<Schema> {
    schema_from(json!([{
        "name": "session",
        "on_path": "sessions",
        "rdf_types": ["http://example.org/Session"],
        "properties": {
            "title": "http://example.org/title",
            "children": "^http://example.org/hasChild",
            "author_name": ["http://example.org/author", "http://example.org/name"]
        }
    }]))
}

fn wire_insert(subject: &str, predicate: &str, object: serde_json::Value) -> serde_json::Value {
    json!([{
        "inserts": [{
            "subject": { "type": "uri", "value": subject },
            "predicate": { "type": "uri", "value": predicate },
            "object": object
        }],
        "deletes": []
    }])
}

/// An `rdf:type` insert makes the subject a known root: exactly one update,
/// zero discovery queries.
#[test]
fn test_rdf_type_insert_needs_no_query() {
    let schema = session_schema();
    let (handler, mut rx) = DeltaHandler::new(Arc::clone(&schema));

    let body = wire_insert(
        "http://example.org/s1",
        RDF_TYPE,
        json!({ "type": "uri", "value": "http://example.org/Session" }),
    );
    assert_eq!(handler.handle_message(&body).unwrap(), 1);

    let item = rx.try_recv().unwrap();
    assert_eq!(item.configs.len(), 1);

    let dispatch = dispatch_for_type(&item.configs[0], &item.triples);
    assert_eq!(
        dispatch.known_subjects.iter().collect::<Vec<_>>(),
        vec!["http://example.org/s1"]
    );
    assert!(dispatch.buckets.is_empty(), "no discovery query needed");
}

/// A literal property insert on an unknown subject produces one batched
/// VALUES query binding both ends of the changed edge.
#[test]
fn test_simple_literal_insert_builds_values_query() {
    let schema = session_schema();
    let (handler, mut rx) = DeltaHandler::new(Arc::clone(&schema));

    let body = wire_insert(
        "http://example.org/s2",
        "http://example.org/title",
        json!({ "type": "literal", "value": "Hello", "xml:lang": "en" }),
    );
    handler.handle_message(&body).unwrap();
    let item = rx.try_recv().unwrap();

    let dispatch = dispatch_for_type(&item.configs[0], &item.triples);
    assert!(dispatch.known_subjects.is_empty());
    assert_eq!(dispatch.buckets.len(), 1);

    let (shape, triples) = dispatch.buckets.iter().next().unwrap();
    let query = build_discovery_query(&item.configs[0].rdf_types, shape, triples);
    assert!(query.contains(
        "VALUES (?s ?obj) { (<http://example.org/s2> \"Hello\"@en) }"
    ));
    assert!(query.contains("?s <http://example.org/title> ?obj ."));
}

/// An inverse edge at position 0 roots at the triple's object.
#[test]
fn test_inverse_edge_query_binds_object_as_root() {
    let schema = session_schema();
    let (handler, mut rx) = DeltaHandler::new(Arc::clone(&schema));

    let body = wire_insert(
        "http://example.org/child1",
        "http://example.org/hasChild",
        json!({ "type": "uri", "value": "http://example.org/s1" }),
    );
    handler.handle_message(&body).unwrap();
    let item = rx.try_recv().unwrap();

    let dispatch = dispatch_for_type(&item.configs[0], &item.triples);
    let (shape, triples) = dispatch.buckets.iter().next().unwrap();
    assert!(shape.inverse);

    let query = build_discovery_query(&item.configs[0].rdf_types, shape, triples);
    assert!(query.contains(
        "VALUES (?s ?triple_sub) { (<http://example.org/s1> <http://example.org/child1>) }"
    ));
    assert!(query.contains("?triple_sub <http://example.org/hasChild> ?s ."));
}

/// Deleting an inverse-edge triple at the head of a path still roots
/// discovery at the triple's object: it is the parent's document that went
/// stale, not the child's.
#[test]
fn test_inverse_edge_deletion_binds_object_as_root() {
    let schema = session_schema();
    let (handler, mut rx) = DeltaHandler::new(Arc::clone(&schema));

    let body = json!([{
        "inserts": [],
        "deletes": [{
            "subject": { "type": "uri", "value": "http://example.org/child1" },
            "predicate": { "type": "uri", "value": "http://example.org/hasChild" },
            "object": { "type": "uri", "value": "http://example.org/s1" }
        }]
    }]);
    handler.handle_message(&body).unwrap();
    let item = rx.try_recv().unwrap();

    let dispatch = dispatch_for_type(&item.configs[0], &item.triples);
    assert_eq!(dispatch.buckets.len(), 1);
    let (shape, triples) = dispatch.buckets.iter().next().unwrap();
    assert!(shape.inverse);
    assert!(!shape.is_addition);
    assert_eq!(shape.position, 0);

    let query = build_discovery_query(&item.configs[0].rdf_types, shape, triples);
    assert!(query.contains("VALUES (?s) { (<http://example.org/s1>) }"));
    assert!(
        !query.contains("child1"),
        "the child end of the deleted edge must not be bound as root"
    );
}

/// A literal object at a non-terminal forward position can never reach a
/// root: the match is discarded before any query is built.
#[test]
fn test_literal_at_nonterminal_position_discards_match() {
    let schema = session_schema();
    let (handler, mut rx) = DeltaHandler::new(Arc::clone(&schema));

    let body = wire_insert(
        "http://example.org/s2",
        "http://example.org/author",
        json!({ "type": "literal", "value": "literal" }),
    );
    handler.handle_message(&body).unwrap();
    let item = rx.try_recv().unwrap();

    let dispatch = dispatch_for_type(&item.configs[0], &item.triples);
    assert!(dispatch.is_empty(), "no query, no update");
}

/// Batching must preserve the naive per-triple semantics: the VALUES rows of
/// the sliced queries cover exactly the triples a per-triple query would.
#[test]
fn test_batched_slices_cover_every_triple() {
    let schema = session_schema();
    let session = schema.type_named("session").unwrap();

    let triples: Vec<Triple> = (0..7)
        .map(|i| {
            Triple::addition(
                format!("http://example.org/s{i}"),
                "http://example.org/title",
                Term::literal(format!("t{i}")),
            )
        })
        .collect();

    let dispatch = dispatch_for_type(&session, &triples);
    assert_eq!(dispatch.buckets.len(), 1);
    let (shape, bucket) = dispatch.buckets.iter().next().unwrap();
    assert_eq!(bucket.len(), 7);

    let batch_size = 3;
    let queries: Vec<String> = bucket
        .chunks(batch_size)
        .map(|slice| build_discovery_query(&session.rdf_types, shape, slice))
        .collect();
    assert_eq!(queries.len(), 3, "7 triples at slice size 3");

    for i in 0..7 {
        let row = format!("<http://example.org/s{i}>");
        assert_eq!(
            queries.iter().filter(|q| q.contains(&row)).count(),
            1,
            "subject s{i} appears in exactly one slice"
        );
    }
}

/// Composite types never take part in delta dispatch; their constituents do.
#[test]
fn test_composite_type_is_not_dispatched() {
    let schema = schema_from(json!([
        {
            "name": "session",
            "on_path": "sessions",
            "rdf_types": ["http://example.org/Session"],
            "properties": { "title": "http://example.org/title" }
        },
        {
            "name": "everything",
            "on_path": "everything",
            "composite_of": ["session"],
            "properties": { "title": "http://example.org/title" }
        }
    ]));
    let (handler, mut rx) = DeltaHandler::new(schema);

    let body = wire_insert(
        "http://example.org/s1",
        "http://example.org/title",
        json!({ "type": "literal", "value": "x" }),
    );
    handler.handle_message(&body).unwrap();
    let item = rx.try_recv().unwrap();

    let names: Vec<&str> = item.configs.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["session"]);
}

/// Deletions bind the pre-delete target directly from the delta, so root
/// discovery never depends on the deleted triple still being present.
#[test]
fn test_deletion_query_does_not_reassert_deleted_edge() {
    let schema = session_schema();
    let session = schema.type_named("session").unwrap();

    let triples = vec![Triple::deletion(
        "http://example.org/someone",
        "http://example.org/author",
        Term::uri("http://example.org/person"),
    )];
    let dispatch = dispatch_for_type(&session, &triples);
    // author is position 0 of the two-hop author_name path.
    let (shape, bucket) = dispatch.buckets.iter().next().unwrap();
    assert!(!shape.is_addition);

    let query = build_discovery_query(&session.rdf_types, shape, bucket);
    assert!(query.contains("VALUES (?s) { (<http://example.org/someone>) }"));
    assert!(
        !query.contains("<http://example.org/author>"),
        "deleted edge must not appear as a graph pattern"
    );
}

//! Delta Handler
//!
//! Consumes the triple-diff notifications the graph store emits after every
//! write and turns them into per-subject index updates.
//!
//! ## Pipeline
//!
//! ```text
//! POST /update (changesets)
//!     |
//!     v
//! ingest: flatten, drop platform-uuid triples          (request thread)
//!     |
//!     v
//! per-triple type matching -> one work item            (request thread)
//!     |
//!     v
//! dispatcher: per type                                 (single worker)
//!     |-- known subjects (rdf:type triples, no query)
//!     |-- shape grouping
//!     |-- batched VALUES discovery queries (sudo)
//!     `-- UpdateHandler.add_update(subject, type)
//! ```
//!
//! The ingest side is cheap and synchronous so the HTTP endpoint can accept
//! immediately; everything that touches the triple store happens on the
//! dispatcher worker, in arrival order.

pub mod query;
pub mod shapes;
pub mod worker;

use crate::rdf::{Term, Triple, UUID_PREDICATE};
use crate::schema::{Schema, TypeDefinition};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Delta ingestion errors
#[derive(Error, Debug)]
pub enum DeltaError {
    /// The request body was not a changeset array
    #[error("Malformed delta message: {0}")]
    Malformed(String),

    /// The dispatcher is gone (shutdown)
    #[error("Delta dispatcher is not running")]
    Closed,
}

// ── Wire format ─────────────────────────────────────────────────────────────

/// One changeset as the graph store posts it.
#[derive(Debug, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub inserts: Vec<WireTriple>,
    #[serde(default)]
    pub deletes: Vec<WireTriple>,
}

#[derive(Debug, Deserialize)]
pub struct WireTriple {
    pub subject: WireTerm,
    pub predicate: WireTerm,
    pub object: WireTerm,
}

#[derive(Debug, Deserialize)]
pub struct WireTerm {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(default, rename = "xml:lang")]
    pub language: Option<String>,
}

impl WireTerm {
    fn to_term(&self) -> Term {
        if self.kind == "uri" {
            Term::uri(self.value.clone())
        } else {
            Term::Literal {
                value: self.value.clone(),
                datatype: self.datatype.clone(),
                language: self.language.clone(),
            }
        }
    }
}

impl WireTriple {
    fn to_triple(&self, is_addition: bool) -> Triple {
        Triple {
            subject: self.subject.value.clone(),
            predicate: self.predicate.value.clone(),
            object: self.object.to_term(),
            is_addition,
        }
    }
}

// ── Ingest ──────────────────────────────────────────────────────────────────

/// One unit of dispatcher work: a flattened triple batch plus the union of
/// type definitions it affects.
#[derive(Debug)]
pub struct WorkItem {
    pub triples: Vec<Triple>,
    pub configs: Vec<Arc<TypeDefinition>>,
}

/// Accepts delta messages and feeds the dispatcher queue.
pub struct DeltaHandler {
    schema: Arc<Schema>,
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl DeltaHandler {
    /// Returns the handler and the receiving end for the dispatcher worker.
    pub fn new(schema: Arc<Schema>) -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeltaHandler { schema, tx }, rx)
    }

    /// Ingest one delta message (a JSON array of changesets).
    ///
    /// Returns the number of triples enqueued for dispatch; zero when the
    /// message holds nothing relevant after filtering.
    pub fn handle_message(&self, body: &serde_json::Value) -> Result<usize, DeltaError> {
        if !body.is_array() {
            return Err(DeltaError::Malformed("expected a changeset array".to_string()));
        }
        let changesets: Vec<ChangeSet> = serde_json::from_value(body.clone())
            .map_err(|e| DeltaError::Malformed(e.to_string()))?;

        let triples = flatten(&changesets);
        if triples.is_empty() {
            return Ok(0);
        }

        let configs = self.affected_configs(&triples);
        if configs.is_empty() {
            debug!(triples = triples.len(), "delta_matched_no_types");
            return Ok(0);
        }

        let count = triples.len();
        self.tx
            .send(WorkItem { triples, configs })
            .map_err(|_| DeltaError::Closed)?;
        Ok(count)
    }

    /// Union of the type definitions affected by any triple in the batch.
    fn affected_configs(&self, triples: &[Triple]) -> Vec<Arc<TypeDefinition>> {
        let mut seen = HashSet::new();
        let mut configs = Vec::new();
        for triple in triples {
            for type_def in self.schema.affected_types(triple) {
                if seen.insert(type_def.name.clone()) {
                    configs.push(type_def);
                }
            }
        }
        configs
    }
}

/// Merge all changesets into one flat triple list, tagging direction and
/// dropping platform-uuid triples.
fn flatten(changesets: &[ChangeSet]) -> Vec<Triple> {
    let mut triples = Vec::new();
    for changeset in changesets {
        for wire in &changeset.inserts {
            triples.push(wire.to_triple(true));
        }
        for wire in &changeset.deletes {
            triples.push(wire.to_triple(false));
        }
    }
    triples.retain(|t| t.predicate != UUID_PREDICATE);
    triples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RawTypeDefinition;
    use serde_json::json;

    fn make_handler() -> (DeltaHandler, mpsc::UnboundedReceiver<WorkItem>) {
        let session: RawTypeDefinition = serde_json::from_value(json!({
            "name": "session",
            "on_path": "sessions",
            "rdf_types": ["http://example.org/Session"],
            "properties": { "title": "http://example.org/title" }
        }))
        .unwrap();
        let schema = Arc::new(Schema::from_raw(&[session]).unwrap());
        DeltaHandler::new(schema)
    }

    fn uri(value: &str) -> serde_json::Value {
        json!({ "type": "uri", "value": value })
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        let (handler, _rx) = make_handler();
        let result = handler.handle_message(&json!({"not": "a list"}));
        assert!(matches!(result, Err(DeltaError::Malformed(_))));
    }

    #[test]
    fn test_uuid_triples_are_filtered() {
        let (handler, mut rx) = make_handler();
        let body = json!([{
            "inserts": [{
                "subject": uri("http://example.org/s1"),
                "predicate": uri(UUID_PREDICATE),
                "object": { "type": "literal", "value": "abc-123" }
            }],
            "deletes": []
        }]);
        assert_eq!(handler.handle_message(&body).unwrap(), 0);
        assert!(rx.try_recv().is_err(), "nothing enqueued");
    }

    #[test]
    fn test_relevant_triples_enqueue_one_work_item() {
        let (handler, mut rx) = make_handler();
        let body = json!([{
            "inserts": [{
                "subject": uri("http://example.org/s1"),
                "predicate": uri("http://example.org/title"),
                "object": { "type": "literal", "value": "Hello", "xml:lang": "en" }
            }],
            "deletes": [{
                "subject": uri("http://example.org/s2"),
                "predicate": uri("http://example.org/title"),
                "object": { "type": "literal", "value": "Bye" }
            }]
        }]);
        assert_eq!(handler.handle_message(&body).unwrap(), 2);

        let item = rx.try_recv().unwrap();
        assert_eq!(item.triples.len(), 2);
        assert!(item.triples[0].is_addition);
        assert!(!item.triples[1].is_addition);
        assert_eq!(item.configs.len(), 1);
        assert_eq!(item.configs[0].name, "session");
    }

    #[test]
    fn test_irrelevant_triples_enqueue_nothing() {
        let (handler, mut rx) = make_handler();
        let body = json!([{
            "inserts": [{
                "subject": uri("http://example.org/s1"),
                "predicate": uri("http://example.org/unrelated"),
                "object": { "type": "literal", "value": "x" }
            }],
            "deletes": []
        }]);
        assert_eq!(handler.handle_message(&body).unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_changesets_are_a_noop() {
        let (handler, mut rx) = make_handler();
        assert_eq!(handler.handle_message(&json!([])).unwrap(), 0);
        assert_eq!(
            handler
                .handle_message(&json!([{ "inserts": [], "deletes": [] }]))
                .unwrap(),
            0
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_language_tag_survives_wire_conversion() {
        let wire: WireTriple = serde_json::from_value(json!({
            "subject": uri("http://example.org/s"),
            "predicate": uri("http://example.org/title"),
            "object": { "type": "literal", "value": "hoi", "xml:lang": "nl" }
        }))
        .unwrap();
        let triple = wire.to_triple(true);
        assert_eq!(triple.object, Term::lang_literal("hoi", "nl"));
    }
}

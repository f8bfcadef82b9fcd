//! Document Builder
//!
//! Materializes one indexable document for a root subject by evaluating each
//! configured property path against the triple store under the caller's
//! group scope. The builder never sees more of the graph than the scope
//! allows; a subject that is invisible (or no longer of the required type)
//! produces no document, which the update worker turns into a delete.
//!
//! Composite documents merge their constituents' documents with a shape
//! merge over the closed set {nil, scalar, list, map}; anything else is a
//! configuration error and is raised, not coerced.

use crate::extractor::{ContentExtractor, ExtractError};
use crate::rdf::client::{AuthScope, BoundValue, RdfClientPool, RdfError};
use crate::rdf::{self, escape_uri};
use crate::schema::{path_to_sparql, PropertyDefinition, PropertyKind, Schema, TypeDefinition};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Document construction errors
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Rdf(#[from] RdfError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// Composite constituents produced values the shape merge cannot combine
    #[error("Cannot merge {left} with {right} for key '{key}'")]
    IncompatibleShapes {
        key: String,
        left: &'static str,
        right: &'static str,
    },
}

/// Result type for document construction
pub type BuildResult<T> = Result<T, BuildError>;

/// Builds search documents from the graph.
pub struct DocumentBuilder {
    rdf: Arc<RdfClientPool>,
    extractor: Arc<ContentExtractor>,
    schema: Arc<Schema>,
}

impl DocumentBuilder {
    pub fn new(
        rdf: Arc<RdfClientPool>,
        extractor: Arc<ContentExtractor>,
        schema: Arc<Schema>,
    ) -> Self {
        DocumentBuilder {
            rdf,
            extractor,
            schema,
        }
    }

    /// Build the document for `subject` as an instance of `type_def`.
    ///
    /// Returns `Ok(None)` when the subject is not (visibly) an instance of
    /// the type under `scope`.
    pub async fn build(
        &self,
        subject: &str,
        type_def: &TypeDefinition,
        scope: &AuthScope,
    ) -> BuildResult<Option<Value>> {
        if type_def.is_composite() {
            return self.build_composite(subject, type_def, scope).await;
        }

        if !self.is_instance(subject, type_def, scope).await? {
            return Ok(None);
        }

        let mut doc = self.build_properties(subject, &type_def.properties, scope).await?;

        // The platform uuid is always queried and attached.
        let uuid = self.query_path_values(subject, &uuid_path(), scope).await?;
        doc.insert(
            "uuid".to_string(),
            reduce(uuid.iter().map(convert_simple).collect()),
        );

        Ok(Some(Value::Object(doc)))
    }

    /// Composite documents merge the documents of every constituent the
    /// subject is an instance of.
    async fn build_composite(
        &self,
        subject: &str,
        composite: &TypeDefinition,
        scope: &AuthScope,
    ) -> BuildResult<Option<Value>> {
        let mut merged: Option<Value> = None;
        for constituent in self.schema.constituents(composite) {
            if let Some(doc) = Box::pin(self.build(subject, &constituent, scope)).await? {
                merged = Some(match merged {
                    None => doc,
                    Some(acc) => smart_merge_documents(acc, doc)?,
                });
            }
        }
        Ok(merged)
    }

    async fn is_instance(
        &self,
        subject: &str,
        type_def: &TypeDefinition,
        scope: &AuthScope,
    ) -> BuildResult<bool> {
        let classes = type_def
            .rdf_types
            .iter()
            .map(|t| format!("<{}>", escape_uri(t)))
            .collect::<Vec<_>>()
            .join(" ");
        let query = format!(
            "ASK {{ VALUES ?type {{ {classes} }} <{subject}> a ?type }}",
            subject = escape_uri(subject),
        );
        Ok(self.rdf.ask(&query, scope).await?)
    }

    async fn build_properties(
        &self,
        subject: &str,
        properties: &[PropertyDefinition],
        scope: &AuthScope,
    ) -> BuildResult<Map<String, Value>> {
        let mut doc = Map::new();
        for property in properties {
            let bindings = self.query_path_values(subject, &property.path, scope).await?;
            let value = match &property.kind {
                PropertyKind::Simple => reduce(bindings.iter().map(convert_simple).collect()),
                PropertyKind::LanguageString => group_by_language(&bindings),
                PropertyKind::Nested { sub_properties, .. } => {
                    let mut nested = Vec::new();
                    for binding in &bindings {
                        if !binding.is_uri() {
                            continue;
                        }
                        let mut sub = Box::pin(self.build_properties(
                            &binding.value,
                            sub_properties,
                            scope,
                        ))
                        .await?;
                        sub.insert("uri".to_string(), Value::String(binding.value.clone()));
                        nested.push(Value::Object(sub));
                    }
                    reduce(nested)
                }
                PropertyKind::Attachment { pipeline } => {
                    let mut contents = Vec::new();
                    for binding in &bindings {
                        contents.push(self.attachment_value(&binding.value, pipeline).await);
                    }
                    reduce(contents)
                }
            };
            doc.insert(property.name.clone(), value);
        }
        Ok(doc)
    }

    /// Extraction failures degrade to a content-less attachment; the rest of
    /// the document still gets indexed.
    async fn attachment_value(&self, file_uri: &str, pipeline: &str) -> Value {
        match self.extractor.extract(file_uri, pipeline).await {
            Ok(Some(text)) => json!({ "content": text }),
            Ok(None) => json!({ "content": null }),
            Err(e @ ExtractError::Io(_)) => {
                warn!(uri = file_uri, error = %e, "attachment_read_failed");
                json!({ "content": null })
            }
            Err(e) => {
                warn!(uri = file_uri, error = %e, "attachment_extraction_failed");
                json!({ "content": null })
            }
        }
    }

    async fn query_path_values(
        &self,
        subject: &str,
        path: &[crate::schema::PathEdge],
        scope: &AuthScope,
    ) -> BuildResult<Vec<BoundValue>> {
        let query = format!(
            "SELECT DISTINCT ?value WHERE {{ <{subject}> {path} ?value }}",
            subject = escape_uri(subject),
            path = path_to_sparql(path),
        );
        let rows = self.rdf.select(&query, scope).await?;
        Ok(rows.into_iter().filter_map(|mut r| r.remove("value")).collect())
    }
}

fn uuid_path() -> Vec<crate::schema::PathEdge> {
    vec![crate::schema::PathEdge {
        predicate: rdf::UUID_PREDICATE.to_string(),
        inverse: false,
    }]
}

/// Convert one bound value by its RDF datatype.
pub fn convert_simple(binding: &BoundValue) -> Value {
    if binding.is_uri() || binding.kind == "bnode" {
        return Value::String(binding.value.clone());
    }
    match binding.datatype.as_deref() {
        Some(rdf::XSD_INTEGER) | Some(rdf::XSD_LONG) => binding
            .value
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(binding.value.clone())),
        Some(rdf::XSD_DOUBLE) | Some(rdf::XSD_DECIMAL) | Some(rdf::XSD_FLOAT) => binding
            .value
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(binding.value.clone())),
        Some(rdf::XSD_BOOLEAN) => match binding.value.as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },
        // Dates keep their lexical form.
        _ => Value::String(binding.value.clone()),
    }
}

/// Group language-tagged bindings into `{lang: value | [values]}`.
/// Untagged bindings land under `"default"`.
fn group_by_language(bindings: &[BoundValue]) -> Value {
    if bindings.is_empty() {
        return Value::Null;
    }
    let mut grouped: Map<String, Value> = Map::new();
    for binding in bindings {
        let lang = binding.language.clone().unwrap_or_else(|| "default".to_string());
        let value = Value::String(binding.value.clone());
        match grouped.remove(&lang) {
            None => {
                grouped.insert(lang, value);
            }
            Some(Value::Array(mut list)) => {
                if !list.contains(&value) {
                    list.push(value);
                }
                grouped.insert(lang, Value::Array(list));
            }
            Some(existing) => {
                if existing == value {
                    grouped.insert(lang, existing);
                } else {
                    grouped.insert(lang, Value::Array(vec![existing, value]));
                }
            }
        }
    }
    Value::Object(grouped)
}

/// Reduce a property's values: none → null, one → the scalar, many → list.
fn reduce(mut values: Vec<Value>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    }
}

// ── Composite merge ─────────────────────────────────────────────────────────

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
        _ => "scalar",
    }
}

/// Merge two constituent documents key by key.
pub fn smart_merge_documents(a: Value, b: Value) -> BuildResult<Value> {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            let mut merged = left;
            for (key, right_value) in right {
                let combined = match merged.remove(&key) {
                    None => right_value,
                    Some(left_value) => smart_merge(&key, left_value, right_value)?,
                };
                merged.insert(key, combined);
            }
            Ok(Value::Object(merged))
        }
        (a, b) => Err(BuildError::IncompatibleShapes {
            key: "<document>".to_string(),
            left: shape_name(&a),
            right: shape_name(&b),
        }),
    }
}

/// The shape merge: total over {nil, scalar, list, map}, an error beyond.
pub fn smart_merge(key: &str, a: Value, b: Value) -> BuildResult<Value> {
    match (a, b) {
        (Value::Null, x) | (x, Value::Null) => Ok(x),
        (Value::Array(left), Value::Array(right)) => {
            let mut merged = left;
            for item in right {
                if !merged.contains(&item) {
                    merged.push(item);
                }
            }
            Ok(Value::Array(merged))
        }
        (Value::Array(mut list), x) => {
            if !list.contains(&x) {
                list.push(x);
            }
            Ok(Value::Array(list))
        }
        (x, Value::Array(list)) => {
            let mut merged = vec![x];
            for item in list {
                if !merged.contains(&item) {
                    merged.push(item);
                }
            }
            Ok(Value::Array(merged))
        }
        (Value::Object(left), Value::Object(right)) => {
            smart_merge_documents(Value::Object(left), Value::Object(right))
        }
        (a, b) => {
            let (left, right) = (shape_name(&a), shape_name(&b));
            if left == "scalar" && right == "scalar" {
                if a == b {
                    Ok(Value::Array(vec![a]))
                } else {
                    Ok(Value::Array(vec![a, b]))
                }
            } else {
                Err(BuildError::IncompatibleShapes {
                    key: key.to_string(),
                    left,
                    right,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(kind: &str, value: &str) -> BoundValue {
        serde_json::from_value(json!({ "type": kind, "value": value })).unwrap()
    }

    fn typed(value: &str, datatype: &str) -> BoundValue {
        serde_json::from_value(json!({
            "type": "typed-literal", "value": value, "datatype": datatype
        }))
        .unwrap()
    }

    #[test]
    fn test_convert_integer_literal() {
        assert_eq!(convert_simple(&typed("42", rdf::XSD_INTEGER)), json!(42));
    }

    #[test]
    fn test_convert_double_literal() {
        assert_eq!(convert_simple(&typed("2.5", rdf::XSD_DOUBLE)), json!(2.5));
    }

    #[test]
    fn test_convert_boolean_literal() {
        assert_eq!(convert_simple(&typed("true", rdf::XSD_BOOLEAN)), json!(true));
        assert_eq!(convert_simple(&typed("0", rdf::XSD_BOOLEAN)), json!(false));
    }

    #[test]
    fn test_convert_date_keeps_lexical_form() {
        assert_eq!(
            convert_simple(&typed("2024-01-15", rdf::XSD_DATE)),
            json!("2024-01-15")
        );
    }

    #[test]
    fn test_convert_unparsable_number_falls_back_to_string() {
        assert_eq!(
            convert_simple(&typed("not-a-number", rdf::XSD_INTEGER)),
            json!("not-a-number")
        );
    }

    #[test]
    fn test_convert_uri_to_string() {
        assert_eq!(
            convert_simple(&bound("uri", "http://example.org/x")),
            json!("http://example.org/x")
        );
    }

    #[test]
    fn test_reduce_shapes() {
        assert_eq!(reduce(vec![]), Value::Null);
        assert_eq!(reduce(vec![json!("a")]), json!("a"));
        assert_eq!(reduce(vec![json!("a"), json!("b")]), json!(["a", "b"]));
    }

    #[test]
    fn test_group_by_language() {
        let bindings = vec![
            serde_json::from_value::<BoundValue>(
                json!({"type": "literal", "value": "hallo", "xml:lang": "nl"}),
            )
            .unwrap(),
            serde_json::from_value::<BoundValue>(
                json!({"type": "literal", "value": "hello", "xml:lang": "en"}),
            )
            .unwrap(),
            serde_json::from_value::<BoundValue>(
                json!({"type": "literal", "value": "hi", "xml:lang": "en"}),
            )
            .unwrap(),
        ];
        let grouped = group_by_language(&bindings);
        assert_eq!(grouped["nl"], json!("hallo"));
        assert_eq!(grouped["en"], json!(["hello", "hi"]));
    }

    #[test]
    fn test_group_by_language_untagged_goes_to_default() {
        let bindings = vec![bound("literal", "plain")];
        let grouped = group_by_language(&bindings);
        assert_eq!(grouped["default"], json!("plain"));
    }

    // ── smart merge ─────────────────────────────────────────────────────────

    #[test]
    fn test_merge_nil_takes_other_side() {
        assert_eq!(smart_merge("k", Value::Null, json!("x")).unwrap(), json!("x"));
        assert_eq!(smart_merge("k", json!([1]), Value::Null).unwrap(), json!([1]));
    }

    #[test]
    fn test_merge_scalars_dedupes() {
        assert_eq!(smart_merge("k", json!("a"), json!("b")).unwrap(), json!(["a", "b"]));
        assert_eq!(smart_merge("k", json!("a"), json!("a")).unwrap(), json!(["a"]));
    }

    #[test]
    fn test_merge_list_and_scalar() {
        assert_eq!(
            smart_merge("k", json!(["a"]), json!("b")).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(
            smart_merge("k", json!("b"), json!(["a"])).unwrap(),
            json!(["b", "a"])
        );
        assert_eq!(
            smart_merge("k", json!(["a"]), json!("a")).unwrap(),
            json!(["a"])
        );
    }

    #[test]
    fn test_merge_lists_deduped_concat() {
        assert_eq!(
            smart_merge("k", json!(["a", "b"]), json!(["b", "c"])).unwrap(),
            json!(["a", "b", "c"])
        );
    }

    #[test]
    fn test_merge_maps_recursively() {
        let merged = smart_merge(
            "k",
            json!({"nl": "hallo", "en": "hello"}),
            json!({"en": "hi", "fr": "salut"}),
        )
        .unwrap();
        assert_eq!(merged["nl"], json!("hallo"));
        assert_eq!(merged["en"], json!(["hello", "hi"]));
        assert_eq!(merged["fr"], json!("salut"));
    }

    #[test]
    fn test_merge_map_with_scalar_is_config_error() {
        let result = smart_merge("title", json!({"nl": "x"}), json!("y"));
        assert!(matches!(
            result,
            Err(BuildError::IncompatibleShapes { ref key, .. }) if key == "title"
        ));
    }

    #[test]
    fn test_merge_documents_key_by_key() {
        let merged = smart_merge_documents(
            json!({"title": "a", "uuid": "u1"}),
            json!({"title": "b", "tags": ["x"]}),
        )
        .unwrap();
        assert_eq!(merged["title"], json!(["a", "b"]));
        assert_eq!(merged["uuid"], json!("u1"));
        assert_eq!(merged["tags"], json!(["x"]));
    }
}

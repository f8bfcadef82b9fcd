//! Settings file loading, environment overrides, and schema validation.

use deltasearch::Config;

fn write_settings(tmp: &tempfile::TempDir, body: &str) -> String {
    let path = tmp.path().join("settings.json");
    std::fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_string()
}

#[test]
fn test_missing_settings_file_falls_back_to_defaults() {
    let config = Config::from_file("/nonexistent/settings.json").unwrap();
    assert_eq!(config.delta_batch_size, 100);
    assert_eq!(config.number_of_threads, 2);
}

#[test]
fn test_full_settings_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_settings(
        &tmp,
        r#"{
            "database_url": "http://localhost:8890/sparql",
            "search_url": "http://localhost:9200",
            "batch_size": 64,
            "max_batches": 10,
            "automatic_index_updates": false,
            "persist_indexes": false,
            "eager_indexing_groups": [
                [{ "name": "public", "variables": [] }]
            ],
            "ignored_allowed_groups": [{ "name": "clean" }],
            "update_wait_interval_minutes": 3,
            "number_of_threads": 4,
            "delta_batch_size": 50,
            "attachments_path_base": "/data/share/",
            "types": [
                {
                    "name": "session",
                    "on_path": "sessions",
                    "rdf_types": ["http://example.org/Session"],
                    "properties": {
                        "title": "http://example.org/title",
                        "speaker": {
                            "path": "http://example.org/speaker",
                            "kind": "nested",
                            "properties": { "name": "http://example.org/name" }
                        }
                    }
                }
            ]
        }"#,
    );

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.batch_size, 64);
    assert_eq!(config.max_batches, 10);
    assert!(!config.automatic_index_updates);
    assert!(!config.persist_indexes);
    assert_eq!(config.eager_indexing_groups.len(), 1);
    assert_eq!(config.ignored_allowed_groups[0].name, "clean");
    assert_eq!(config.wait_interval().as_secs(), 180);
    assert_eq!(config.number_of_threads, 4);
    assert_eq!(config.delta_batch_size, 50);

    let schema = config.schema().unwrap();
    let session = schema.type_named("session").unwrap();
    assert_eq!(session.properties.len(), 2);
}

// Env vars are process-global and tests run in parallel, so the override
// tests use keys (log_level, queue_file) that no other test in this file
// asserts on.

#[test]
fn test_env_override_wins_over_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_settings(&tmp, r#"{ "log_level": "info" }"#);

    std::env::set_var("LOG_LEVEL", "debug");
    let config = Config::from_file(&path).unwrap();
    std::env::remove_var("LOG_LEVEL");

    assert_eq!(config.log_level, "debug");
}

#[test]
fn test_empty_env_value_does_not_override() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_settings(&tmp, r#"{ "queue_file": "/tmp/custom-queue.json" }"#);

    std::env::set_var("QUEUE_FILE", "");
    let config = Config::from_file(&path).unwrap();
    std::env::remove_var("QUEUE_FILE");

    assert_eq!(
        config.queue_file,
        std::path::PathBuf::from("/tmp/custom-queue.json")
    );
}

#[test]
fn test_duplicate_type_names_fail_validation() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_settings(
        &tmp,
        r#"{
            "types": [
                { "name": "a", "on_path": "as", "rdf_types": ["http://example.org/A"] },
                { "name": "a", "on_path": "others", "rdf_types": ["http://example.org/B"] }
            ]
        }"#,
    );
    let config = Config::from_file(&path).unwrap();
    assert!(config.schema().is_err());
}

#[test]
fn test_composite_type_configuration() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_settings(
        &tmp,
        r#"{
            "types": [
                { "name": "a", "on_path": "as", "rdf_types": ["http://example.org/A"] },
                { "name": "b", "on_path": "bs", "rdf_types": ["http://example.org/B"] },
                { "name": "all", "on_path": "all", "composite_of": ["a", "b"] }
            ]
        }"#,
    );
    let schema = Config::from_file(&path).unwrap().schema().unwrap();
    let composite = schema.type_named("all").unwrap();
    assert!(composite.is_composite());
    assert_eq!(schema.constituents(&composite).len(), 2);
}

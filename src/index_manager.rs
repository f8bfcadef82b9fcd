//! Index Manager
//!
//! Orchestrates the lifecycle of search indexes: ensures an index exists and
//! is fresh before use, fans out invalidation and removal, and pre-builds
//! the configured eager partitions at startup.
//!
//! ## Lifecycle
//!
//! ```text
//! fetch(type, groups)
//!     |-- absent --> create physical index, register, persist  [invalid]
//!     |-- invalid or forced --> claim rebuild                  [updating]
//!     |       `--> paginated bulk build under group scope
//!     |               |-- success --> [valid]
//!     |               `-- failure --> [invalid]
//!     `-- valid --> return as-is
//! ```
//!
//! Search requests arriving mid-rebuild wait on the index readiness gate
//! with a bounded timeout.

use crate::auth::GroupSet;
use crate::config::Config;
use crate::document::{BuildError, DocumentBuilder};
use crate::rdf::client::{AuthScope, RdfClientPool, RdfError};
use crate::rdf::escape_uri;
use crate::registry::{
    physical_index_name, IndexRegistry, IndexStatus, PersistedIndex, RegistryError,
    RegistryPersistence, SearchIndex,
};
use crate::schema::{Schema, TypeDefinition};
use crate::search_client::{document_id, SearchClient, SearchError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Bound on waiting for a rebuilding index.
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Index management errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Rdf(#[from] RdfError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("No configured type named '{0}'")]
    UnknownType(String),

    /// The readiness gate did not open in time; retryable by the caller
    #[error("Timed out waiting for index '{0}' to become ready")]
    ReadyTimeout(String),
}

/// Result type for index management operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Owns the registry and drives index builds.
pub struct IndexManager {
    config: Arc<Config>,
    schema: Arc<Schema>,
    registry: IndexRegistry,
    persistence: RegistryPersistence,
    search: Arc<SearchClient>,
    rdf: Arc<RdfClientPool>,
    builder: Arc<DocumentBuilder>,
}

impl IndexManager {
    pub fn new(
        config: Arc<Config>,
        schema: Arc<Schema>,
        rdf: Arc<RdfClientPool>,
        search: Arc<SearchClient>,
        builder: Arc<DocumentBuilder>,
    ) -> Self {
        let persistence = RegistryPersistence::new(Arc::clone(&rdf), config.persist_indexes);
        IndexManager {
            config,
            schema,
            registry: IndexRegistry::new(),
            persistence,
            search,
            rdf,
            builder,
        }
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Restore persisted registry entries at boot. Entries whose physical
    /// index disappeared from the engine are dropped; they will be recreated
    /// on first use.
    pub async fn restore(&self) -> IndexResult<()> {
        for persisted in self.persistence.restore().await? {
            if self.schema.type_named(&persisted.type_name).is_none() {
                warn!(
                    type_name = %persisted.type_name,
                    "persisted_index_for_unconfigured_type"
                );
                continue;
            }
            if !self.search.index_exists(&persisted.name).await? {
                warn!(index = %persisted.name, "persisted_index_missing_in_engine");
                self.forget_persisted(&persisted).await;
                continue;
            }
            let index = SearchIndex::new(
                persisted.uri,
                persisted.name,
                persisted.type_name,
                persisted.groups,
                persisted.is_eager,
                IndexStatus::Valid,
            );
            if self.registry.insert(Arc::clone(&index)).is_err() {
                warn!(index = %index.name, "persisted_index_duplicate_partition");
            }
        }
        Ok(())
    }

    async fn forget_persisted(&self, persisted: &PersistedIndex) {
        // Best effort; a stale registry triple is harmless.
        let orphan = SearchIndex::new(
            persisted.uri.clone(),
            persisted.name.clone(),
            persisted.type_name.clone(),
            persisted.groups.clone(),
            persisted.is_eager,
            IndexStatus::Invalid,
        );
        if let Err(e) = self.persistence.remove(&orphan).await {
            warn!(error = %e, "persisted_index_cleanup_failed");
        }
    }

    /// Resolve (creating and building if needed) the indexes serving
    /// `type_name` for a caller with `groups`.
    pub async fn fetch_indexes(
        &self,
        type_name: &str,
        groups: &GroupSet,
        force_update: bool,
    ) -> IndexResult<Vec<Arc<SearchIndex>>> {
        let type_def = self
            .schema
            .type_named(type_name)
            .ok_or_else(|| IndexError::UnknownType(type_name.to_string()))?;

        let groups = groups.without_ignored(&self.config.ignored_allowed_groups);
        let index = self.ensure_index(&type_def, &groups, false).await?;

        let needs_build = force_update || index.status() == IndexStatus::Invalid;
        if needs_build {
            if index.begin_update() {
                self.run_build(&type_def, &index).await?;
            } else if !index.wait_until_ready(READY_TIMEOUT).await {
                return Err(IndexError::ReadyTimeout(index.name.clone()));
            }
        }

        Ok(vec![index])
    }

    /// Look up or create the index record and its physical index.
    async fn ensure_index(
        &self,
        type_def: &TypeDefinition,
        groups: &GroupSet,
        is_eager: bool,
    ) -> IndexResult<Arc<SearchIndex>> {
        if let Some(existing) = self.registry.get(&type_def.name, groups) {
            return Ok(existing);
        }

        let name = physical_index_name(&type_def.name, groups);
        self.search
            .create_index(&name, self.config.default_settings.as_ref())
            .await?;

        let index = SearchIndex::new(
            RegistryPersistence::new_resource_uri(),
            name,
            type_def.name.clone(),
            groups.clone(),
            is_eager,
            IndexStatus::Invalid,
        );

        match self.registry.insert(Arc::clone(&index)) {
            Ok(()) => {
                self.persistence.store(&index).await?;
                info!(
                    index = %index.name,
                    type_name = %index.type_name,
                    "index_created"
                );
                Ok(index)
            }
            // Lost a creation race; the winner's record is authoritative.
            Err(RegistryError::Duplicate { .. }) => Ok(self
                .registry
                .get(&type_def.name, groups)
                .expect("registry entry present after duplicate insert")),
        }
    }

    /// Run a claimed rebuild and settle the status on both exits.
    async fn run_build(&self, type_def: &TypeDefinition, index: &SearchIndex) -> IndexResult<()> {
        info!(index = %index.name, "index_build_started");
        match self.build_index(type_def, index).await {
            Ok(count) => {
                index.set_status(IndexStatus::Valid);
                info!(index = %index.name, documents = count, "index_build_finished");
                Ok(())
            }
            Err(e) => {
                index.set_status(IndexStatus::Invalid);
                error!(index = %index.name, error = %e, "index_build_failed");
                Err(e)
            }
        }
    }

    /// Paginated bulk build: list root subjects under the index's group
    /// scope, build their documents, and bulk-upsert page by page.
    async fn build_index(&self, type_def: &TypeDefinition, index: &SearchIndex) -> IndexResult<usize> {
        let scope = AuthScope::Groups(index.groups.clone());
        let classes = root_classes(&self.schema, type_def);
        let values = classes
            .iter()
            .map(|c| format!("<{}>", escape_uri(c)))
            .collect::<Vec<_>>()
            .join(" ");

        let batch_size = self.config.batch_size.max(1);
        let mut offset = 0usize;
        let mut batches = 0usize;
        let mut total = 0usize;

        loop {
            let query = format!(
                "SELECT DISTINCT ?s WHERE {{ VALUES ?type {{ {values} }} ?s a ?type }} \
                 ORDER BY ?s LIMIT {batch_size} OFFSET {offset}"
            );
            let rows = self.rdf.select(&query, &scope).await?;
            if rows.is_empty() {
                break;
            }

            let mut page = Vec::with_capacity(rows.len());
            for row in &rows {
                let Some(subject) = row.get("s").map(|b| b.value.clone()) else {
                    continue;
                };
                match self.builder.build(&subject, type_def, &scope).await {
                    Ok(Some(doc)) => page.push((document_id(&subject), doc)),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(subject = %subject, error = %e, "document_build_dropped");
                    }
                }
            }
            total += page.len();
            self.search.bulk_upsert(&index.name, &page).await?;

            offset += batch_size;
            batches += 1;
            if self.config.max_batches > 0 && batches >= self.config.max_batches {
                warn!(
                    index = %index.name,
                    batches,
                    "index_build_capped_before_exhaustion"
                );
                break;
            }
        }

        self.search.refresh_index(&index.name).await?;
        Ok(total)
    }

    /// Flip matching indexes to `invalid` in memory. Engine contents and the
    /// persisted registry are left untouched.
    pub fn invalidate_indexes(
        &self,
        type_name: Option<&str>,
        groups: Option<&GroupSet>,
    ) -> Vec<Arc<SearchIndex>> {
        let matching = self.registry.matching(type_name, groups);
        for index in &matching {
            index.set_status(IndexStatus::Invalid);
            info!(index = %index.name, "index_invalidated");
        }
        matching
    }

    /// Delete matching physical indexes and their registry entries.
    pub async fn remove_indexes(
        &self,
        type_name: Option<&str>,
        groups: Option<&GroupSet>,
    ) -> Vec<Arc<SearchIndex>> {
        let matching = self.registry.matching(type_name, groups);
        for index in &matching {
            if let Err(e) = self.search.delete_index(&index.name).await {
                warn!(index = %index.name, error = %e, "index_engine_delete_failed");
            }
            if let Err(e) = self.persistence.remove(index).await {
                warn!(index = %index.name, error = %e, "index_registry_delete_failed");
            }
            self.registry.remove(index);
            info!(index = %index.name, "index_removed");
        }
        matching
    }

    /// Block until `index` leaves `updating`; `false` on timeout.
    pub async fn wait_until_ready(&self, index: &SearchIndex, timeout: Duration) -> bool {
        index.wait_until_ready(timeout).await
    }

    /// Pre-create and build every configured eager partition.
    pub async fn ensure_eager_indexes(&self) {
        for raw_groups in &self.config.eager_indexing_groups {
            let groups = GroupSet::canonical(raw_groups.clone())
                .without_ignored(&self.config.ignored_allowed_groups);
            for type_def in self.schema.types() {
                match self.ensure_index(type_def, &groups, true).await {
                    Ok(index) => {
                        if index.status() == IndexStatus::Invalid && index.begin_update() {
                            if let Err(e) = self.run_build(type_def, &index).await {
                                warn!(
                                    index = %index.name,
                                    error = %e,
                                    "eager_index_build_failed"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            type_name = %type_def.name,
                            error = %e,
                            "eager_index_creation_failed"
                        );
                    }
                }
            }
        }
    }
}

/// Root classes to enumerate for a type: its own `rdf_types`, or the union
/// of its constituents' for composites.
fn root_classes(schema: &Schema, type_def: &TypeDefinition) -> Vec<String> {
    if !type_def.is_composite() {
        return type_def.rdf_types.clone();
    }
    let mut classes = Vec::new();
    for constituent in schema.constituents(type_def) {
        for class in &constituent.rdf_types {
            if !classes.contains(class) {
                classes.push(class.clone());
            }
        }
    }
    classes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema_with_composite() -> Schema {
        let session: crate::schema::RawTypeDefinition = serde_json::from_value(json!({
            "name": "session",
            "on_path": "sessions",
            "rdf_types": ["http://example.org/Session"],
        }))
        .unwrap();
        let agenda: crate::schema::RawTypeDefinition = serde_json::from_value(json!({
            "name": "agenda",
            "on_path": "agendas",
            "rdf_types": ["http://example.org/Agenda", "http://example.org/Session"],
        }))
        .unwrap();
        let both: crate::schema::RawTypeDefinition = serde_json::from_value(json!({
            "name": "everything",
            "on_path": "everything",
            "composite_of": ["session", "agenda"],
        }))
        .unwrap();
        Schema::from_raw(&[session, agenda, both]).unwrap()
    }

    #[test]
    fn test_root_classes_for_plain_type() {
        let schema = schema_with_composite();
        let session = schema.type_named("session").unwrap();
        assert_eq!(
            root_classes(&schema, &session),
            vec!["http://example.org/Session".to_string()]
        );
    }

    #[test]
    fn test_root_classes_for_composite_deduplicates() {
        let schema = schema_with_composite();
        let composite = schema.type_named("everything").unwrap();
        let classes = root_classes(&schema, &composite);
        assert_eq!(classes.len(), 2);
        assert!(classes.contains(&"http://example.org/Session".to_string()));
        assert!(classes.contains(&"http://example.org/Agenda".to_string()));
    }
}

//! Search Index Registry
//!
//! Owns the mapping `(document type, canonical group set)` → search index.
//! Each index carries its own status and readiness gate; the gate is a
//! last-value broadcast so a waiter arriving after the transition still
//! observes it (no lost wakeups — status change and gate update happen under
//! the index's mutex).
//!
//! When `persist_indexes` is on, every index is mirrored as a resource in
//! the triple store so the partition map survives restarts.

use crate::auth::GroupSet;
use crate::rdf::client::{AuthScope, RdfClientPool, RdfResult};
use crate::rdf::{escape_literal, escape_uri};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

// Registry vocabulary in the platform namespace.
const INDEX_CLASS: &str = "http://mu.semte.ch/vocabularies/search/SearchIndex";
const P_TYPE_NAME: &str = "http://mu.semte.ch/vocabularies/search/typeName";
const P_INDEX_NAME: &str = "http://mu.semte.ch/vocabularies/search/indexName";
const P_GROUPS: &str = "http://mu.semte.ch/vocabularies/search/allowedGroups";
const P_EAGER: &str = "http://mu.semte.ch/vocabularies/search/isEager";
const RESOURCE_BASE: &str = "http://mu.semte.ch/search-indexes/";

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Two indexes under the same (type, canonical groups) are forbidden
    #[error("Index already registered for type '{type_name}' and groups {groups}")]
    Duplicate { type_name: String, groups: String },
}

/// Index lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Valid,
    Invalid,
    Updating,
}

struct IndexState {
    status: IndexStatus,
    ready_tx: watch::Sender<bool>,
}

/// One search index partition.
pub struct SearchIndex {
    pub uri: String,
    /// Physical index name in the engine.
    pub name: String,
    pub type_name: String,
    pub groups: GroupSet,
    pub is_eager: bool,
    state: Mutex<IndexState>,
    ready_rx: watch::Receiver<bool>,
}

impl SearchIndex {
    pub fn new(
        uri: String,
        name: String,
        type_name: String,
        groups: GroupSet,
        is_eager: bool,
        status: IndexStatus,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(status != IndexStatus::Updating);
        Arc::new(SearchIndex {
            uri,
            name,
            type_name,
            groups,
            is_eager,
            state: Mutex::new(IndexState { status, ready_tx }),
            ready_rx,
        })
    }

    pub fn status(&self) -> IndexStatus {
        self.state.lock().status
    }

    /// Transition status and keep the readiness gate in step: the gate
    /// opens on `valid`/`invalid` and closes on `updating`.
    pub fn set_status(&self, status: IndexStatus) {
        let mut state = self.state.lock();
        state.status = status;
        let _ = state.ready_tx.send(status != IndexStatus::Updating);
    }

    /// Atomically claim the rebuild: `updating` is entered only if no other
    /// worker holds it. Returns `false` when a rebuild is already running.
    pub fn begin_update(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == IndexStatus::Updating {
            return false;
        }
        state.status = IndexStatus::Updating;
        let _ = state.ready_tx.send(false);
        true
    }

    /// Block until the index leaves `updating`, or `false` on timeout.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_rx.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .is_ok();
        result
    }
}

/// Partition key inside the registry map.
fn partition_key(type_name: &str, groups: &GroupSet) -> (String, String) {
    (type_name.to_string(), groups.serialized())
}

/// Synthesize a stable physical index name for a partition.
pub fn physical_index_name(type_name: &str, groups: &GroupSet) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());
    hasher.update(groups.serialized().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", type_name.to_lowercase(), &digest[..16])
}

/// In-memory registry of search indexes.
#[derive(Default)]
pub struct IndexRegistry {
    indexes: RwLock<HashMap<(String, String), Arc<SearchIndex>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, index: Arc<SearchIndex>) -> Result<(), RegistryError> {
        let key = partition_key(&index.type_name, &index.groups);
        let mut map = self.indexes.write();
        if map.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                type_name: index.type_name.clone(),
                groups: index.groups.serialized(),
            });
        }
        map.insert(key, index);
        Ok(())
    }

    pub fn get(&self, type_name: &str, groups: &GroupSet) -> Option<Arc<SearchIndex>> {
        self.indexes
            .read()
            .get(&partition_key(type_name, groups))
            .cloned()
    }

    pub fn remove(&self, index: &SearchIndex) -> Option<Arc<SearchIndex>> {
        self.indexes
            .write()
            .remove(&partition_key(&index.type_name, &index.groups))
    }

    /// All indexes registered under a type.
    pub fn for_type(&self, type_name: &str) -> Vec<Arc<SearchIndex>> {
        self.indexes
            .read()
            .values()
            .filter(|i| i.type_name == type_name)
            .cloned()
            .collect()
    }

    /// Indexes matching an optional type filter and optional group filter.
    pub fn matching(
        &self,
        type_name: Option<&str>,
        groups: Option<&GroupSet>,
    ) -> Vec<Arc<SearchIndex>> {
        let group_key = groups.map(GroupSet::serialized);
        self.indexes
            .read()
            .values()
            .filter(|i| type_name.map_or(true, |t| i.type_name == t))
            .filter(|i| group_key.as_deref().map_or(true, |g| i.groups.serialized() == g))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<SearchIndex>> {
        self.indexes.read().values().cloned().collect()
    }
}

// ── Triple store persistence ────────────────────────────────────────────────

/// A registry entry as restored from the triple store.
#[derive(Debug, Clone)]
pub struct PersistedIndex {
    pub uri: String,
    pub name: String,
    pub type_name: String,
    pub groups: GroupSet,
    pub is_eager: bool,
}

/// Mirrors registry entries into the triple store.
pub struct RegistryPersistence {
    rdf: Arc<RdfClientPool>,
    enabled: bool,
}

impl RegistryPersistence {
    pub fn new(rdf: Arc<RdfClientPool>, enabled: bool) -> Self {
        RegistryPersistence { rdf, enabled }
    }

    /// Allocate a fresh registry resource URI.
    pub fn new_resource_uri() -> String {
        format!("{}{}", RESOURCE_BASE, uuid::Uuid::new_v4())
    }

    /// Write one index as a resource. No-op when persistence is off.
    pub async fn store(&self, index: &SearchIndex) -> RdfResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let update = format!(
            "INSERT DATA {{ \
             <{uri}> a <{class}> ; \
             <{p_type}> \"{type_name}\" ; \
             <{p_name}> \"{name}\" ; \
             <{p_groups}> \"{groups}\" ; \
             <{p_eager}> \"{eager}\" . }}",
            uri = escape_uri(&index.uri),
            class = INDEX_CLASS,
            p_type = P_TYPE_NAME,
            type_name = escape_literal(&index.type_name),
            p_name = P_INDEX_NAME,
            name = escape_literal(&index.name),
            p_groups = P_GROUPS,
            groups = escape_literal(&index.groups.serialized()),
            p_eager = P_EAGER,
            eager = index.is_eager,
        );
        self.rdf.update(&update, &AuthScope::Sudo).await
    }

    /// Remove one index resource. No-op when persistence is off.
    pub async fn remove(&self, index: &SearchIndex) -> RdfResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let update = format!(
            "DELETE WHERE {{ <{uri}> ?p ?o }}",
            uri = escape_uri(&index.uri)
        );
        self.rdf.update(&update, &AuthScope::Sudo).await
    }

    /// Read back every persisted index.
    pub async fn restore(&self) -> RdfResult<Vec<PersistedIndex>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT ?index ?typeName ?name ?groups ?eager WHERE {{ \
             ?index a <{class}> ; \
             <{p_type}> ?typeName ; \
             <{p_name}> ?name ; \
             <{p_groups}> ?groups ; \
             <{p_eager}> ?eager . }}",
            class = INDEX_CLASS,
            p_type = P_TYPE_NAME,
            p_name = P_INDEX_NAME,
            p_groups = P_GROUPS,
            p_eager = P_EAGER,
        );
        let rows = self.rdf.select(&query, &AuthScope::Sudo).await?;

        let mut restored = Vec::with_capacity(rows.len());
        for row in rows {
            let field = |name: &str| row.get(name).map(|b| b.value.clone());
            let (Some(uri), Some(type_name), Some(name), Some(groups_json)) = (
                field("index"),
                field("typeName"),
                field("name"),
                field("groups"),
            ) else {
                warn!("persisted_index_row_incomplete");
                continue;
            };
            let Ok(groups) = GroupSet::parse_header(&groups_json) else {
                warn!(index = %uri, "persisted_index_groups_unreadable");
                continue;
            };
            restored.push(PersistedIndex {
                uri,
                name,
                type_name,
                groups,
                is_eager: field("eager").as_deref() == Some("true"),
            });
        }
        info!(count = restored.len(), "registry_restored");
        Ok(restored)
    }
}

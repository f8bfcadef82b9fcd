//! Update Handler
//!
//! Debounced FIFO work queue of per-subject index updates, drained by a
//! bounded pool of async workers.
//!
//! ## Queue policy
//!
//! - At most one live entry per subject. Further notifications for a queued
//!   subject only add their type name to the sidecar map.
//! - The sidecar map (`subject → set of type names`) is drained atomically
//!   with the dequeue, so a subject is processed at most once per
//!   coalescing window and carries the union of types accumulated since it
//!   was enqueued.
//! - An entry becomes eligible once it is `wait_interval` old. A worker
//!   whose head entry is too young sleeps until eligibility or until a new
//!   insertion signals the queue.
//!
//! ## Durability
//!
//! Every five minutes the queue and sidecar map are serialized together to
//! a snapshot file (write-then-rename); both are restored before workers
//! start, so in-flight work survives restart. They are persisted together
//! because the sidecar map alone carries the coalesced type names.

use crate::document::DocumentBuilder;
use crate::index_manager::IndexManager;
use crate::rdf::client::AuthScope;
use crate::schema::Schema;
use crate::search_client::{document_id, SearchClient};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval between durable snapshots of the queue.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// What a dequeued subject needs done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    Update,
    Delete,
}

/// One queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    #[serde(rename = "type")]
    pub action: UpdateAction,
}

/// Queue plus sidecar map, serialized together as the durable snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    queue: VecDeque<QueueEntry>,
    index: HashMap<String, BTreeSet<String>>,
}

/// The debounced update queue.
pub struct UpdateHandler {
    state: Mutex<QueueState>,
    notify: Notify,
    wait_interval: Duration,
    queue_file: PathBuf,
}

impl UpdateHandler {
    pub fn new(wait_interval: Duration, queue_file: PathBuf) -> Self {
        UpdateHandler {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            wait_interval,
            queue_file,
        }
    }

    /// Enqueue a rebuild of `subject`'s documents for `type_name`.
    pub fn add_update(&self, subject: &str, type_name: &str) {
        self.add(subject, type_name, UpdateAction::Update);
    }

    /// Enqueue a removal of `subject`'s documents for `type_name`.
    pub fn add_delete(&self, subject: &str, type_name: &str) {
        self.add(subject, type_name, UpdateAction::Delete);
    }

    fn add(&self, subject: &str, type_name: &str, action: UpdateAction) {
        let was_empty;
        {
            let mut state = self.state.lock();
            was_empty = state.queue.is_empty();
            let types = state.index.entry(subject.to_string()).or_default();
            let newly_queued = types.is_empty();
            types.insert(type_name.to_string());
            if newly_queued {
                state.queue.push_back(QueueEntry {
                    timestamp: Utc::now(),
                    subject: subject.to_string(),
                    action,
                });
            }
        }
        debug!(subject, type_name, ?action, "update_enqueued");
        if was_empty {
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Type names currently coalesced for a subject.
    pub fn pending_types(&self, subject: &str) -> Vec<String> {
        self.state
            .lock()
            .index
            .get(subject)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pop the head entry once it is old enough, draining its sidecar set
    /// in the same critical section. Returns `None` on shutdown.
    async fn next_eligible(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<(String, Vec<String>, UpdateAction)> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let pending = {
                let mut state = self.state.lock();
                match state.queue.front().map(|head| head.timestamp) {
                    None => None,
                    Some(enqueued_at) => {
                        let age = Utc::now()
                            .signed_duration_since(enqueued_at)
                            .to_std()
                            .unwrap_or_default();
                        if age >= self.wait_interval {
                            let entry = state.queue.pop_front().expect("head checked above");
                            let types = state
                                .index
                                .remove(&entry.subject)
                                .map(|set| set.into_iter().collect())
                                .unwrap_or_default();
                            return Some((entry.subject, types, entry.action));
                        }
                        Some(self.wait_interval - age)
                    }
                }
            };

            match pending {
                // Head exists but is too young: sleep until eligible, or
                // until signalled / shut down.
                Some(remaining) => {
                    tokio::select! {
                        () = tokio::time::sleep(remaining) => {}
                        () = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                // Empty queue: wait for an insertion.
                None => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Spawn `count` workers. Each worker dequeues eligible subjects and
    /// hands them to `handler`; handler failures are logged and the entry is
    /// not re-enqueued.
    pub fn spawn_workers<F, Fut, E>(
        self: &Arc<Self>,
        count: usize,
        shutdown: watch::Receiver<bool>,
        handler: F,
    ) -> Vec<JoinHandle<()>>
    where
        F: Fn(String, Vec<String>, UpdateAction) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send,
        E: std::fmt::Display,
    {
        (0..count.max(1))
            .map(|worker| {
                let queue = Arc::clone(self);
                let handler = handler.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(worker, "update_worker_started");
                    while let Some((subject, types, action)) =
                        queue.next_eligible(&mut shutdown).await
                    {
                        debug!(worker, subject = %subject, ?types, "update_dequeued");
                        if let Err(e) = handler(subject.clone(), types, action).await {
                            error!(worker, subject = %subject, error = %e, "update_failed");
                        }
                    }
                    info!(worker, "update_worker_stopped");
                })
            })
            .collect()
    }

    // ── Durability ──────────────────────────────────────────────────────────

    /// Snapshot queue and sidecar map atomically (write-then-rename).
    pub fn persist(&self) -> std::io::Result<()> {
        let serialized = {
            let state = self.state.lock();
            serde_json::to_vec(&*state)?
        };
        if let Some(parent) = self.queue_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.queue_file.with_extension("tmp");
        std::fs::write(&tmp, &serialized)?;
        std::fs::rename(&tmp, &self.queue_file)?;
        Ok(())
    }

    /// Restore a previous snapshot. Call before spawning workers.
    /// Returns the number of restored entries.
    pub fn restore(&self) -> std::io::Result<usize> {
        let bytes = match std::fs::read(&self.queue_file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let restored: QueueState = serde_json::from_slice(&bytes)?;
        let count = restored.queue.len();
        *self.state.lock() = restored;
        if count > 0 {
            info!(count, "update_queue_restored");
            self.notify.notify_one();
        }
        Ok(count)
    }

    /// Spawn the background persister: a snapshot every five minutes and a
    /// final one on shutdown.
    pub fn spawn_persister(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PERSIST_INTERVAL);
            interval.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = queue.persist() {
                            warn!(error = %e, "queue_persist_failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = queue.persist() {
                            warn!(error = %e, "queue_final_persist_failed");
                        }
                        break;
                    }
                }
            }
        })
    }
}

// ── Worker handler ──────────────────────────────────────────────────────────

/// Applies one dequeued subject to every index registered for its types.
///
/// Discovery ran sudo, but each build runs under the index's own group
/// scope; a build that comes back empty for an id that may exist in that
/// index is treated as a delete, preserving per-group isolation.
pub struct UpdateProcessor {
    manager: Arc<IndexManager>,
    builder: Arc<DocumentBuilder>,
    search: Arc<SearchClient>,
    schema: Arc<Schema>,
}

impl UpdateProcessor {
    pub fn new(
        manager: Arc<IndexManager>,
        builder: Arc<DocumentBuilder>,
        search: Arc<SearchClient>,
        schema: Arc<Schema>,
    ) -> Self {
        UpdateProcessor {
            manager,
            builder,
            search,
            schema,
        }
    }

    /// Process one dequeued `(subject, types, action)`. Failures on one
    /// index never stop the others.
    pub async fn process(
        &self,
        subject: String,
        type_names: Vec<String>,
        action: UpdateAction,
    ) -> Result<(), std::convert::Infallible> {
        let id = document_id(&subject);
        for type_name in &type_names {
            let Some(type_def) = self.schema.type_named(type_name) else {
                warn!(type_name, "update_for_unconfigured_type");
                continue;
            };
            for index in self.manager.registry().for_type(type_name) {
                let result = match action {
                    UpdateAction::Delete => self.remove(&index.name, &id).await,
                    UpdateAction::Update => {
                        let scope = AuthScope::Groups(index.groups.clone());
                        match self.builder.build(&subject, &type_def, &scope).await {
                            Ok(Some(doc)) => self
                                .search
                                .upsert_document(&index.name, &id, &doc)
                                .await
                                .map(|()| ())
                                .map_err(|e| e.to_string()),
                            Ok(None) => self.remove(&index.name, &id).await,
                            Err(e) => Err(e.to_string()),
                        }
                    }
                };
                if let Err(e) = result {
                    error!(
                        subject = %subject,
                        index = %index.name,
                        error = %e,
                        "index_update_failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, index_name: &str, id: &str) -> Result<(), String> {
        match self.search.delete_document(index_name, id).await {
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}

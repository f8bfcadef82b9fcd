//! Delta Dispatcher
//!
//! The single worker that drains the delta work queue. Items are processed
//! in arrival order; within an item, each affected type is handled
//! independently so one type's failure never starves the others.
//!
//! Discovery queries run *sudo*: a root subject may sit outside any
//! caller's visibility at enqueue time, and the per-group scoping happens
//! later, when the update worker builds the document under each index's
//! own groups.

use crate::config::Config;
use crate::delta::query::build_discovery_query;
use crate::delta::shapes::dispatch_for_type;
use crate::delta::WorkItem;
use crate::index_manager::IndexManager;
use crate::rdf::client::{AuthScope, RdfClientPool};
use crate::schema::TypeDefinition;
use crate::update_handler::UpdateHandler;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Drains delta work items and feeds the update queue.
pub struct DeltaDispatcher {
    config: Arc<Config>,
    rdf: Arc<RdfClientPool>,
    updates: Arc<UpdateHandler>,
    manager: Arc<IndexManager>,
}

impl DeltaDispatcher {
    pub fn new(
        config: Arc<Config>,
        rdf: Arc<RdfClientPool>,
        updates: Arc<UpdateHandler>,
        manager: Arc<IndexManager>,
    ) -> Self {
        DeltaDispatcher {
            config,
            rdf,
            updates,
            manager,
        }
    }

    /// Spawn the dispatcher worker.
    pub fn spawn(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WorkItem>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("delta_dispatcher_started");
            loop {
                tokio::select! {
                    item = rx.recv() => {
                        match item {
                            Some(item) => self.process_item(item).await,
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("delta_dispatcher_stopped");
        })
    }

    async fn process_item(&self, item: WorkItem) {
        for type_def in &item.configs {
            if !self.config.automatic_index_updates {
                // Invalidating mode: skip discovery, mark the type's
                // partitions stale and let the next search rebuild them.
                self.manager.invalidate_indexes(Some(&type_def.name), None);
                continue;
            }
            self.process_type(type_def, &item).await;
        }
    }

    /// Stages 3a-3d for one type: known subjects, shape buckets, batched
    /// discovery, update dispatch.
    async fn process_type(&self, type_def: &Arc<TypeDefinition>, item: &WorkItem) {
        let dispatch = dispatch_for_type(type_def, &item.triples);
        if dispatch.is_empty() {
            return;
        }

        let mut roots: BTreeSet<String> = dispatch.known_subjects;

        let batch_size = self.config.delta_batch_size.max(1);
        for (shape, triples) in &dispatch.buckets {
            for slice in triples.chunks(batch_size) {
                let query = build_discovery_query(&type_def.rdf_types, shape, slice);
                match self.rdf.select(&query, &AuthScope::Sudo).await {
                    Ok(rows) => {
                        for row in rows {
                            if let Some(bound) = row.get("s") {
                                if bound.is_uri() {
                                    roots.insert(bound.value.clone());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        // Retries are exhausted inside the client; this
                        // slice is lost for this type, others continue.
                        warn!(
                            type_name = %type_def.name,
                            slice_len = slice.len(),
                            error = %e,
                            "discovery_query_dropped"
                        );
                    }
                }
            }
        }

        debug!(
            type_name = %type_def.name,
            roots = roots.len(),
            "delta_roots_discovered"
        );
        for root in roots {
            self.updates.add_update(&root, &type_def.name);
        }
    }
}

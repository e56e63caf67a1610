//! In-process [`EventStore`] with the same chunking, pruning and operator
//! semantics as the Postgres backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use crate::event::{Event, ShapeSignature, validate_namespace};
use crate::metrics::Metrics;
use crate::query::{EventQuery, ParsedQuery, merge_results};
use crate::store::{EventStore, group_by_chunk};
use crate::{Error, Result};

#[derive(Default)]
struct MemoryNamespace {
    chunks: BTreeMap<(i64, ShapeSignature), Vec<Event>>,
}

impl MemoryNamespace {
    /// Chunks whose bucket intersects the range and whose shape carries every queried key.
    fn candidates<'a>(
        &'a self,
        window_ms: i64,
        query: &'a ParsedQuery,
    ) -> impl Iterator<Item = (&'a (i64, ShapeSignature), &'a Vec<Event>)> + 'a {
        let required = query.required_keys();
        self.chunks.iter().filter(move |((start, shape), _)| {
            *start <= query.end
                && start.saturating_add(window_ms) > query.start
                && required.iter().all(|key| shape.contains(key))
        })
    }
}

#[derive(Clone)]
pub struct MemoryEvents {
    chunk_window_ms: i64,
    metrics: Arc<Metrics>,
    namespaces: Arc<RwLock<HashMap<String, MemoryNamespace>>>,
}

impl MemoryEvents {
    pub fn new(chunk_window_ms: i64) -> Self {
        Self::with_metrics(chunk_window_ms, Arc::default())
    }

    pub fn with_metrics(chunk_window_ms: i64, metrics: Arc<Metrics>) -> Self {
        Self {
            chunk_window_ms: chunk_window_ms.max(1),
            metrics,
            namespaces: Arc::default(),
        }
    }

    /// Number of distinct chunks a namespace currently holds.
    pub fn chunk_count(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .expect("memory store poisoned")
            .get(namespace)
            .map(|ns| ns.chunks.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryEvents {
    fn default() -> Self {
        Self::new(60 * 60 * 1000)
    }
}

fn missing(namespace: &str) -> Error {
    Error::NamespaceNotFound(namespace.to_string())
}

#[async_trait]
impl EventStore for MemoryEvents {
    async fn namespaces(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .namespaces
            .read()
            .expect("memory store poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create(&self, namespace: &str) -> Result<()> {
        validate_namespace(namespace)?;
        let mut guard = self.namespaces.write().expect("memory store poisoned");
        if !guard.contains_key(namespace) {
            guard.insert(namespace.to_string(), MemoryNamespace::default());
            info!(namespace, "created namespace");
        }
        Ok(())
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        if self
            .namespaces
            .write()
            .expect("memory store poisoned")
            .remove(namespace)
            .is_some()
        {
            info!(namespace, "dropped namespace");
        }
        Ok(())
    }

    async fn store(&self, namespace: &str, events: &[Event]) -> Result<()> {
        validate_namespace(namespace)?;
        for event in events {
            event.validate()?;
        }
        let groups = group_by_chunk(events, self.chunk_window_ms);
        let mut guard = self.namespaces.write().expect("memory store poisoned");
        let ns = guard.get_mut(namespace).ok_or_else(|| missing(namespace))?;
        for ((shape, start), batch) in groups {
            let created = !ns.chunks.contains_key(&(start, shape.clone()));
            ns.chunks.entry((start, shape)).or_default().extend(batch);
            if created {
                Metrics::add(&self.metrics.chunk_tables_created_total, 1);
            }
        }
        Metrics::add(&self.metrics.events_stored_total, events.len() as u64);
        Ok(())
    }

    async fn get(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let parsed = query.parse_for_read()?;
        let guard = self.namespaces.read().expect("memory store poisoned");
        let ns = guard
            .get(&query.namespace)
            .ok_or_else(|| missing(&query.namespace))?;
        let batches = ns
            .candidates(self.chunk_window_ms, &parsed)
            .map(|(_, events)| {
                events
                    .iter()
                    .filter(|event| parsed.matches(event))
                    .map(|event| {
                        let mut event = event.clone();
                        if !parsed.include_payloads {
                            event.payload = None;
                        }
                        event
                    })
                    .collect()
            })
            .collect();
        Metrics::add(&self.metrics.queries_total, 1);
        Ok(merge_results(batches, parsed.ascending, parsed.limit))
    }

    async fn expire(&self, query: &EventQuery) -> Result<u64> {
        let parsed = query.parse()?;
        let mut guard = self.namespaces.write().expect("memory store poisoned");
        let ns = guard
            .get_mut(&query.namespace)
            .ok_or_else(|| missing(&query.namespace))?;
        let keys: Vec<(i64, ShapeSignature)> = ns
            .candidates(self.chunk_window_ms, &parsed)
            .map(|(key, _)| key.clone())
            .collect();
        let mut deleted = 0;
        for key in keys {
            if let Some(events) = ns.chunks.get_mut(&key) {
                let before = events.len();
                events.retain(|event| !parsed.matches(event));
                deleted += (before - events.len()) as u64;
            }
        }
        Ok(deleted)
    }

    async fn metadata_values(&self, query: &EventQuery, key: &str) -> Result<BTreeSet<String>> {
        let parsed = query.parse_for_read()?;
        let guard = self.namespaces.read().expect("memory store poisoned");
        let ns = guard
            .get(&query.namespace)
            .ok_or_else(|| missing(&query.namespace))?;
        Ok(ns
            .candidates(self.chunk_window_ms, &parsed)
            .flat_map(|(_, events)| events.iter())
            .filter(|event| parsed.matches(event))
            .filter_map(|event| event.metadata.get(key).cloned())
            .collect())
    }
}

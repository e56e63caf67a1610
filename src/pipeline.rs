//! Middleware stages applied once at construction. Each stage is a plain
//! function from one [`EventStore`] to another.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{Instrument, debug, debug_span, warn};

use crate::archive::Archiver;
use crate::event::Event;
use crate::metrics::Metrics;
use crate::query::EventQuery;
use crate::store::EventStore;
use crate::{Error, Result};

pub type Stage = Box<dyn Fn(Arc<dyn EventStore>) -> Arc<dyn EventStore> + Send + Sync>;

/// Ordered list of stages. The first stage added wraps the backend directly;
/// the last one added is what callers talk to.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<(&'static str, Stage)>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage<F>(mut self, name: &'static str, stage: F) -> Self
    where
        F: Fn(Arc<dyn EventStore>) -> Arc<dyn EventStore> + Send + Sync + 'static,
    {
        self.stages.push((name, Box::new(stage)));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn apply(&self, backend: Arc<dyn EventStore>) -> Arc<dyn EventStore> {
        self.stages
            .iter()
            .fold(backend, |inner, (_, stage)| stage(inner))
    }
}

/// Span per operation, error logging and error counters.
pub fn traced(metrics: Arc<Metrics>) -> impl Fn(Arc<dyn EventStore>) -> Arc<dyn EventStore> + Send + Sync {
    move |inner: Arc<dyn EventStore>| -> Arc<dyn EventStore> {
        Arc::new(TracedEvents {
            inner,
            metrics: metrics.clone(),
        })
    }
}

/// Bound every call by `timeout`. Queries also carry the deadline so the
/// compiler stops between chunks.
pub fn deadline(timeout: Duration) -> impl Fn(Arc<dyn EventStore>) -> Arc<dyn EventStore> + Send + Sync {
    move |inner: Arc<dyn EventStore>| -> Arc<dyn EventStore> {
        Arc::new(DeadlineEvents { inner, timeout })
    }
}

/// Archive the expired range into `dir` before deleting it.
pub fn archiving(
    dir: PathBuf,
    window: Duration,
    metrics: Arc<Metrics>,
) -> impl Fn(Arc<dyn EventStore>) -> Arc<dyn EventStore> + Send + Sync {
    move |inner: Arc<dyn EventStore>| -> Arc<dyn EventStore> {
        let archiver = Archiver::new(inner.clone(), dir.clone()).with_metrics(metrics.clone());
        Arc::new(ArchivingEvents {
            inner,
            archiver,
            window,
        })
    }
}

struct TracedEvents {
    inner: Arc<dyn EventStore>,
    metrics: Arc<Metrics>,
}

impl TracedEvents {
    async fn observe<T, F>(&self, operation: &'static str, namespace: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let span = debug_span!("eventide", operation, namespace);
        let started = Instant::now();
        let result = fut.instrument(span).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(operation, namespace, elapsed_ms, "operation finished"),
            Err(err) => {
                Metrics::add(&self.metrics.operation_errors_total, 1);
                if matches!(err.root(), Error::Timeout { .. }) {
                    Metrics::add(&self.metrics.timeouts_total, 1);
                }
                warn!(operation, namespace, elapsed_ms, error = %err, "operation failed");
            }
        }
        result
    }
}

#[async_trait]
impl EventStore for TracedEvents {
    async fn namespaces(&self) -> Result<Vec<String>> {
        self.observe("namespaces", "*", self.inner.namespaces()).await
    }

    async fn create(&self, namespace: &str) -> Result<()> {
        self.observe("create", namespace, self.inner.create(namespace))
            .await
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        self.observe("drop", namespace, self.inner.drop_namespace(namespace))
            .await
    }

    async fn store(&self, namespace: &str, events: &[Event]) -> Result<()> {
        self.observe("store", namespace, self.inner.store(namespace, events))
            .await
    }

    async fn get(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.observe("get", &query.namespace, self.inner.get(query))
            .await
    }

    async fn expire(&self, query: &EventQuery) -> Result<u64> {
        self.observe("expire", &query.namespace, self.inner.expire(query))
            .await
    }

    async fn metadata_values(&self, query: &EventQuery, key: &str) -> Result<BTreeSet<String>> {
        self.observe(
            "metadata_values",
            &query.namespace,
            self.inner.metadata_values(query, key),
        )
        .await
    }
}

struct DeadlineEvents {
    inner: Arc<dyn EventStore>,
    timeout: Duration,
}

impl DeadlineEvents {
    fn bounded(&self, query: &EventQuery) -> EventQuery {
        let mut query = query.clone();
        query.timeout = Some(query.timeout.map_or(self.timeout, |t| t.min(self.timeout)));
        query
    }

    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
            }),
        }
    }
}

#[async_trait]
impl EventStore for DeadlineEvents {
    async fn namespaces(&self) -> Result<Vec<String>> {
        self.run("namespaces", self.inner.namespaces()).await
    }

    async fn create(&self, namespace: &str) -> Result<()> {
        self.run("create", self.inner.create(namespace)).await
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        self.run("drop", self.inner.drop_namespace(namespace)).await
    }

    async fn store(&self, namespace: &str, events: &[Event]) -> Result<()> {
        self.run("store", self.inner.store(namespace, events)).await
    }

    async fn get(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let query = self.bounded(query);
        self.run("get", self.inner.get(&query)).await
    }

    async fn expire(&self, query: &EventQuery) -> Result<u64> {
        let query = self.bounded(query);
        self.run("expire", self.inner.expire(&query)).await
    }

    async fn metadata_values(&self, query: &EventQuery, key: &str) -> Result<BTreeSet<String>> {
        let query = self.bounded(query);
        self.run("metadata_values", self.inner.metadata_values(&query, key))
            .await
    }
}

struct ArchivingEvents {
    inner: Arc<dyn EventStore>,
    archiver: Archiver,
    window: Duration,
}

#[async_trait]
impl EventStore for ArchivingEvents {
    async fn namespaces(&self) -> Result<Vec<String>> {
        self.inner.namespaces().await
    }

    async fn create(&self, namespace: &str) -> Result<()> {
        self.inner.create(namespace).await
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        self.inner.drop_namespace(namespace).await
    }

    async fn store(&self, namespace: &str, events: &[Event]) -> Result<()> {
        self.inner.store(namespace, events).await
    }

    async fn get(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.inner.get(query).await
    }

    /// The inclusive expiry range `[start, end]` is archived as `[start, end + 1)`.
    async fn expire(&self, query: &EventQuery) -> Result<u64> {
        let mut range = query.clone();
        range.end = query.end.saturating_add(1);
        if let Some(summary) = self.archiver.archive(&range, self.window).await? {
            debug!(
                namespace = %query.namespace,
                path = %summary.path.display(),
                events = summary.events,
                "archived before expiry"
            );
        }
        self.inner.expire(query).await
    }

    async fn metadata_values(&self, query: &EventQuery, key: &str) -> Result<BTreeSet<String>> {
        self.inner.metadata_values(query, key).await
    }
}

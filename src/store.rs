use crate::{
    Error, Result,
    event::{Event, ShapeSignature, chunk_start, validate_namespace},
    metrics::Metrics,
    query::{EventQuery, QueryCompiler},
    schema::{ChunkManager, ChunkSettings, DEFAULT_MAX_CACHED_CHUNKS, NamespaceHandle},
};
use async_trait::async_trait;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

/// The capability every backend, router and pipeline stage implements.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn namespaces(&self) -> Result<Vec<String>>;

    /// Idempotent: creating an existing namespace succeeds.
    async fn create(&self, namespace: &str) -> Result<()>;

    /// Dropping a missing namespace is a no-op.
    async fn drop_namespace(&self, namespace: &str) -> Result<()>;

    async fn store(&self, namespace: &str, events: &[Event]) -> Result<()>;

    async fn get(&self, query: &EventQuery) -> Result<Vec<Event>>;

    /// Delete every event matching `query`. Returns the number of rows removed.
    async fn expire(&self, query: &EventQuery) -> Result<u64>;

    /// Distinct values of metadata `key` across events matching `query`.
    async fn metadata_values(&self, query: &EventQuery, key: &str) -> Result<BTreeSet<String>>;
}

/// Group events by the chunk table they belong to.
pub(crate) fn group_by_chunk(
    events: &[Event],
    window_ms: i64,
) -> BTreeMap<(ShapeSignature, i64), Vec<Event>> {
    let mut groups: BTreeMap<(ShapeSignature, i64), Vec<Event>> = BTreeMap::new();
    for event in events {
        groups
            .entry((event.shape(), chunk_start(event.timestamp, window_ms)))
            .or_default()
            .push(event.clone());
    }
    groups
}

/// Postgres backend: chunked tables managed by [`ChunkManager`], read
/// through [`QueryCompiler`].
#[derive(Clone)]
pub struct ChunkedStore {
    pool: PgPool,
    chunks: ChunkManager,
    compiler: QueryCompiler,
    metrics: Arc<Metrics>,
}

impl ChunkedStore {
    pub async fn connect(url: &str) -> Result<Self> {
        StoreBuilder::new(url).build().await
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn chunks(&self) -> &ChunkManager {
        &self.chunks
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }

    /// A chunk table vanishing mid-query means the namespace was dropped.
    fn settle(&self, handle: &NamespaceHandle, err: Error) -> Error {
        match err {
            Error::Db(err) => self.chunks.classify(handle, err),
            other => other,
        }
    }
}

#[async_trait]
impl EventStore for ChunkedStore {
    async fn namespaces(&self) -> Result<Vec<String>> {
        self.chunks.namespaces().await
    }

    async fn create(&self, namespace: &str) -> Result<()> {
        self.chunks.create_namespace(namespace).await.map(|_| ())
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        self.chunks.drop_namespace(namespace).await
    }

    async fn store(&self, namespace: &str, events: &[Event]) -> Result<()> {
        validate_namespace(namespace)?;
        for event in events {
            event.validate()?;
        }
        let handle = self.chunks.handle(namespace).await?;
        if events.is_empty() {
            return Ok(());
        }

        for ((signature, start), batch) in group_by_chunk(events, handle.chunk_window_ms) {
            let chunk = self.chunks.ensure_chunk(&handle, &signature, start).await?;
            let written = self.chunks.insert(&handle, &chunk, &batch).await?;
            Metrics::add(&self.metrics.events_stored_total, written);
        }
        Ok(())
    }

    async fn get(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let parsed = query.parse_for_read()?;
        let deadline = query.deadline();
        let handle = self.chunks.handle(&query.namespace).await?;
        let candidates = self
            .chunks
            .candidate_chunks(&handle, parsed.start, parsed.end)
            .await?;
        self.compiler
            .fetch(
                &handle.namespace,
                candidates,
                handle.chunk_window_ms,
                &parsed,
                deadline,
            )
            .await
            .map_err(|err| self.settle(&handle, err))
    }

    async fn expire(&self, query: &EventQuery) -> Result<u64> {
        let parsed = query.parse()?;
        let deadline = query.deadline();
        let handle = self.chunks.handle(&query.namespace).await?;
        let candidates = self
            .chunks
            .candidate_chunks(&handle, parsed.start, parsed.end)
            .await?;
        self.compiler
            .delete(
                &handle.namespace,
                candidates,
                handle.chunk_window_ms,
                &parsed,
                deadline,
            )
            .await
            .map_err(|err| self.settle(&handle, err))
    }

    async fn metadata_values(&self, query: &EventQuery, key: &str) -> Result<BTreeSet<String>> {
        let parsed = query.parse_for_read()?;
        let deadline = query.deadline();
        let handle = self.chunks.handle(&query.namespace).await?;
        let candidates = self
            .chunks
            .candidate_chunks(&handle, parsed.start, parsed.end)
            .await?;
        self.compiler
            .distinct_metadata(
                &handle.namespace,
                candidates,
                handle.chunk_window_ms,
                &parsed,
                key,
                deadline,
            )
            .await
            .map_err(|err| self.settle(&handle, err))
    }
}

pub struct StoreBuilder {
    url: String,
    max_connections: u32,
    acquire_timeout: Duration,
    chunk_window: Duration,
    max_indexes_per_chunk: usize,
    max_cached_chunks: usize,
    base_schema: String,
    slow_query_threshold: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 32,
            acquire_timeout: Duration::from_secs(5),
            chunk_window: Duration::from_secs(60 * 60),
            max_indexes_per_chunk: 64,
            max_cached_chunks: DEFAULT_MAX_CACHED_CHUNKS,
            base_schema: "public".into(),
            slow_query_threshold: Duration::from_millis(500),
            metrics: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// How long a caller waits for a pooled connection before failing with a timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Bucket size for namespaces created through this store.
    pub fn chunk_window(mut self, window: Duration) -> Self {
        self.chunk_window = window;
        self
    }

    pub fn max_indexes_per_chunk(mut self, max: usize) -> Self {
        self.max_indexes_per_chunk = max.max(1);
        self
    }

    /// Upper bound on chunk tables remembered in memory per store.
    pub fn max_cached_chunks(mut self, max: usize) -> Self {
        self.max_cached_chunks = max.max(1);
        self
    }

    pub fn base_schema(mut self, schema: impl Into<String>) -> Self {
        self.base_schema = schema.into();
        self
    }

    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = threshold;
        self
    }

    /// Share counters with other stores of the same engine.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn settings(&self) -> Result<ChunkSettings> {
        let chunk_window_ms = i64::try_from(self.chunk_window.as_millis())
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or_else(|| {
                Error::Config(format!(
                    "chunk window {:?} must be a positive number of milliseconds",
                    self.chunk_window
                ))
            })?;
        Ok(ChunkSettings {
            base_schema: self.base_schema.clone(),
            chunk_window_ms,
            max_indexes_per_chunk: self.max_indexes_per_chunk,
            max_cached_chunks: self.max_cached_chunks,
        })
    }

    pub async fn build(self) -> Result<ChunkedStore> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.url)
            .await?;
        self.build_with_pool(pool).await
    }

    /// Use an existing pool instead of connecting to `url`.
    pub async fn build_with_pool(self, pool: PgPool) -> Result<ChunkedStore> {
        let settings = self.settings()?;
        let metrics = self.metrics.unwrap_or_default();
        let chunks = ChunkManager::new(pool.clone(), settings, metrics.clone());
        chunks.ensure_registry().await?;
        let compiler = QueryCompiler::new(pool.clone(), self.slow_query_threshold, metrics.clone());
        Ok(ChunkedStore {
            pool,
            chunks,
            compiler,
            metrics,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_split_by_shape_and_bucket() {
        let events = vec![
            Event::new(10).metadata("a", "1"),
            Event::new(20).metadata("a", "2"),
            Event::new(10).metadata("b", "1"),
            Event::new(1_010).metadata("a", "3"),
        ];
        let groups = group_by_chunk(&events, 1_000);
        assert_eq!(groups.len(), 3);
        let sizes: Vec<usize> = groups.values().map(Vec::len).collect();
        assert!(sizes.contains(&2));
    }

    #[test]
    fn builder_rejects_zero_window() {
        let builder = StoreBuilder::new("postgres://localhost").chunk_window(Duration::ZERO);
        assert!(matches!(builder.settings(), Err(Error::Config(_))));
    }

    #[test]
    fn builder_defaults() {
        let settings = StoreBuilder::new("postgres://localhost").settings().unwrap();
        assert_eq!(settings.chunk_window_ms, 3_600_000);
        assert_eq!(settings.max_indexes_per_chunk, 64);
        assert_eq!(settings.max_cached_chunks, DEFAULT_MAX_CACHED_CHUNKS);
        assert_eq!(settings.base_schema, "public");
    }
}

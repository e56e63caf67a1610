//! Chunk schema manager: per-namespace physical layout, lazy chunk table
//! creation and the key to column lookup index.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder, types::Json};
use tracing::{debug, info};

use crate::ddl::{
    self, CHUNKS_TABLE, COLUMNS_TABLE, LOOKUP_TABLE, NAMESPACES_TABLE, PAYLOAD_COLUMN,
    TIMESTAMP_COLUMN,
};
use crate::event::{AttributeKey, AttributeKind, Event, ShapeSignature, validate_namespace};
use crate::metrics::Metrics;
use crate::naming::{
    chunk_table_name, column_candidate, namespace_schema_name, qualified_name, quote_ident,
};
use crate::{Error, Result};

/// Postgres accepts at most this many bind parameters per statement.
const MAX_BIND_PARAMS: usize = 65_535;
const MAX_COLUMN_ATTEMPTS: u32 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceHandle {
    pub namespace: String,
    pub schema: String,
    pub chunk_window_ms: i64,
}

/// A physical chunk table and the columns its lookup rows map keys to.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkTable {
    pub schema: String,
    pub name: String,
    pub chunk_start: i64,
    pub columns: BTreeMap<AttributeKey, String>,
}

impl ChunkTable {
    pub fn column(&self, key: &AttributeKey) -> Option<&str> {
        self.columns.get(key).map(String::as_str)
    }

    pub fn has_key(&self, key: &AttributeKey) -> bool {
        self.columns.contains_key(key)
    }

    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    /// Rejects events carrying keys this chunk has no column for.
    pub fn check_fits(&self, event: &Event) -> Result<()> {
        let shape = event.shape();
        if let Some(missing) = shape.keys().find(|key| !self.has_key(key)) {
            return Err(Error::SchemaMismatch {
                table: self.name.clone(),
                detail: format!("no column for {missing}"),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ChunkSettings {
    pub base_schema: String,
    pub chunk_window_ms: i64,
    pub max_indexes_per_chunk: usize,
    /// Chunk tables remembered in memory; the oldest buckets go first.
    pub max_cached_chunks: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            base_schema: "public".into(),
            chunk_window_ms: 60 * 60 * 1000,
            max_indexes_per_chunk: 64,
            max_cached_chunks: DEFAULT_MAX_CACHED_CHUNKS,
        }
    }
}

pub const DEFAULT_MAX_CACHED_CHUNKS: usize = 4096;

type ColumnMap = HashMap<AttributeKey, String>;

/// Insert into the chunk cache, evicting the entry with the oldest bucket
/// when the cache is full.
fn cache_chunk(cache: &mut HashMap<String, ChunkTable>, key: String, chunk: ChunkTable, cap: usize) {
    if !cache.contains_key(&key) && cache.len() >= cap.max(1) {
        let oldest = cache
            .iter()
            .min_by(|a, b| (a.1.chunk_start, a.0).cmp(&(b.1.chunk_start, b.0)))
            .map(|(key, _)| key.clone());
        if let Some(oldest) = oldest {
            cache.remove(&oldest);
        }
    }
    cache.insert(key, chunk);
}

#[derive(Clone)]
pub struct ChunkManager {
    pool: PgPool,
    settings: ChunkSettings,
    metrics: Arc<Metrics>,
    namespaces: Arc<RwLock<HashMap<String, NamespaceHandle>>>,
    columns: Arc<RwLock<HashMap<String, ColumnMap>>>,
    chunks: Arc<RwLock<HashMap<String, ChunkTable>>>,
}

pub(crate) fn sql_state(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// A concurrent writer created the same object first.
pub(crate) fn is_duplicate_object(err: &sqlx::Error) -> bool {
    matches!(
        sql_state(err).as_deref(),
        Some("23505" | "42P06" | "42P07" | "42710")
    )
}

/// The namespace schema or one of its tables vanished underneath us.
pub(crate) fn is_missing_relation(err: &sqlx::Error) -> bool {
    matches!(sql_state(err).as_deref(), Some("42P01" | "3F000"))
}

impl ChunkManager {
    pub fn new(pool: PgPool, settings: ChunkSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            settings,
            metrics,
            namespaces: Arc::default(),
            columns: Arc::default(),
            chunks: Arc::default(),
        }
    }

    pub fn settings(&self) -> &ChunkSettings {
        &self.settings
    }

    fn registry_table(&self) -> String {
        qualified_name(&self.settings.base_schema, NAMESPACES_TABLE)
    }

    /// Create the namespace registry if this shard has never been used.
    pub async fn ensure_registry(&self) -> Result<()> {
        let stmt = ddl::build_namespaces_table_sql(&self.settings.base_schema);
        match sqlx::query(&stmt).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_object(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn namespaces(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(&format!(
            "select namespace from {} order by namespace",
            self.registry_table()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn handle(&self, namespace: &str) -> Result<NamespaceHandle> {
        if let Some(handle) = self
            .namespaces
            .read()
            .expect("namespace cache poisoned")
            .get(namespace)
        {
            return Ok(handle.clone());
        }

        let row: Option<(String, i64)> = sqlx::query_as(&format!(
            "select schema_name, chunk_window_ms from {} where namespace = $1",
            self.registry_table()
        ))
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await?;

        let (schema, chunk_window_ms) =
            row.ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        let handle = NamespaceHandle {
            namespace: namespace.to_string(),
            schema,
            chunk_window_ms,
        };
        self.namespaces
            .write()
            .expect("namespace cache poisoned")
            .insert(namespace.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn create_namespace(&self, namespace: &str) -> Result<NamespaceHandle> {
        validate_namespace(namespace)?;
        match self.handle(namespace).await {
            Ok(handle) => return Ok(handle),
            Err(Error::NamespaceNotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let schema = namespace_schema_name(namespace);
        let result = async {
            let mut tx = self.pool.begin().await?;
            for stmt in ddl::namespace_catalog_statements(&schema) {
                sqlx::query(&stmt).execute(&mut *tx).await?;
            }
            sqlx::query(&format!(
                "insert into {} (namespace, schema_name, chunk_window_ms) values ($1, $2, $3) on conflict (namespace) do nothing",
                self.registry_table()
            ))
            .bind(namespace)
            .bind(&schema)
            .bind(self.settings.chunk_window_ms)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        }
        .await;

        match result {
            Ok(()) => {
                info!(namespace, schema = %schema, "created namespace");
            }
            // lost the race against another creator; their registry row wins
            Err(err) if is_duplicate_object(&err) => {
                debug!(namespace, "namespace created concurrently");
            }
            Err(err) => return Err(err.into()),
        }
        self.handle(namespace).await
    }

    pub async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        let handle = match self.handle(namespace).await {
            Ok(handle) => handle,
            Err(Error::NamespaceNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(&ddl::build_drop_namespace_schema_sql(&handle.schema))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "delete from {} where namespace = $1",
            self.registry_table()
        ))
        .bind(namespace)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.forget_namespace(&handle);
        info!(namespace, schema = %handle.schema, "dropped namespace");
        Ok(())
    }

    /// Evict every cached entry belonging to a namespace.
    pub fn forget_namespace(&self, handle: &NamespaceHandle) {
        if let Ok(mut cache) = self.namespaces.write() {
            cache.remove(&handle.namespace);
        }
        if let Ok(mut cache) = self.columns.write() {
            cache.remove(&handle.schema);
        }
        if let Ok(mut cache) = self.chunks.write() {
            let prefix = format!("{}.", handle.schema);
            cache.retain(|key, _| !key.starts_with(&prefix));
        }
    }

    /// Map a backend error, turning a vanished namespace into `NamespaceNotFound`.
    pub(crate) fn classify(&self, handle: &NamespaceHandle, err: sqlx::Error) -> Error {
        if is_missing_relation(&err) {
            self.forget_namespace(handle);
            Error::NamespaceNotFound(handle.namespace.clone())
        } else {
            err.into()
        }
    }

    fn cached_column(&self, schema: &str, key: &AttributeKey) -> Option<String> {
        self.columns
            .read()
            .expect("column cache poisoned")
            .get(schema)
            .and_then(|map| map.get(key).cloned())
    }

    fn cache_column(&self, schema: &str, key: &AttributeKey, column: &str) {
        self.columns
            .write()
            .expect("column cache poisoned")
            .entry(schema.to_string())
            .or_default()
            .insert(key.clone(), column.to_string());
    }

    async fn load_columns(&self, handle: &NamespaceHandle) -> Result<()> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
            "select kind, key, column_name from {}",
            qualified_name(&handle.schema, COLUMNS_TABLE)
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| self.classify(handle, err))?;

        let mut map = ColumnMap::new();
        for (kind, key, column) in rows {
            if let Some(kind) = AttributeKind::parse(&kind) {
                map.insert(AttributeKey { kind, name: key }, column);
            }
        }
        self.columns
            .write()
            .expect("column cache poisoned")
            .insert(handle.schema.clone(), map);
        Ok(())
    }

    /// Physical column for `key`, allocating one on first use. The `columns`
    /// table's unique constraint guarantees no two keys share a column.
    pub async fn allocate_column(
        &self,
        handle: &NamespaceHandle,
        key: &AttributeKey,
    ) -> Result<String> {
        if let Some(column) = self.cached_column(&handle.schema, key) {
            return Ok(column);
        }
        self.load_columns(handle).await?;
        if let Some(column) = self.cached_column(&handle.schema, key) {
            return Ok(column);
        }

        let taken: HashSet<String> = self
            .columns
            .read()
            .expect("column cache poisoned")
            .get(&handle.schema)
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default();
        let table = qualified_name(&handle.schema, COLUMNS_TABLE);

        for attempt in 0..MAX_COLUMN_ATTEMPTS {
            let candidate = column_candidate(key, attempt);
            if taken.contains(&candidate) {
                continue;
            }
            let inserted = sqlx::query(&format!(
                "insert into {table} (kind, key, column_name) values ($1, $2, $3) on conflict do nothing"
            ))
            .bind(key.kind.as_str())
            .bind(&key.name)
            .bind(&candidate)
            .execute(&self.pool)
            .await
            .map_err(|err| self.classify(handle, err))?
            .rows_affected();

            if inserted == 1 {
                self.cache_column(&handle.schema, key, &candidate);
                return Ok(candidate);
            }

            // either another writer allocated this key, or the candidate belongs to a different key
            let existing: Option<String> = sqlx::query_scalar(&format!(
                "select column_name from {table} where kind = $1 and key = $2"
            ))
            .bind(key.kind.as_str())
            .bind(&key.name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| self.classify(handle, err))?;
            if let Some(column) = existing {
                self.cache_column(&handle.schema, key, &column);
                return Ok(column);
            }
        }

        Err(Error::ColumnCollision {
            namespace: handle.namespace.clone(),
            key: key.to_string(),
        })
    }

    /// Guarantee a chunk table exists for `(namespace, signature, chunk_start)`.
    pub async fn ensure_chunk(
        &self,
        handle: &NamespaceHandle,
        signature: &ShapeSignature,
        chunk_start: i64,
    ) -> Result<ChunkTable> {
        let name = chunk_table_name(&handle.namespace, &signature.canonical(), chunk_start);
        let cache_key = format!("{}.{}", handle.schema, name);
        if let Some(chunk) = self
            .chunks
            .read()
            .expect("chunk cache poisoned")
            .get(&cache_key)
        {
            return Ok(chunk.clone());
        }

        let mut columns = BTreeMap::new();
        for key in signature.keys() {
            let column = self.allocate_column(handle, key).await?;
            columns.insert(key.clone(), column);
        }
        let chunk = ChunkTable {
            schema: handle.schema.clone(),
            name,
            chunk_start,
            columns,
        };

        self.create_chunk_table(handle, &chunk).await?;
        self.register_chunk(handle, &chunk).await?;

        cache_chunk(
            &mut self.chunks.write().expect("chunk cache poisoned"),
            cache_key,
            chunk.clone(),
            self.settings.max_cached_chunks,
        );
        Ok(chunk)
    }

    async fn create_chunk_table(&self, handle: &NamespaceHandle, chunk: &ChunkTable) -> Result<()> {
        let typed: Vec<(AttributeKind, &str)> = chunk
            .columns
            .iter()
            .map(|(key, column)| (key.kind, column.as_str()))
            .collect();
        let names: Vec<&str> = typed.iter().map(|(_, column)| *column).collect();

        let mut stmts = vec![ddl::build_chunk_table_sql(&chunk.schema, &chunk.name, &typed)];
        stmts.extend(ddl::build_chunk_index_sql(
            &chunk.schema,
            &chunk.name,
            &names,
            self.settings.max_indexes_per_chunk,
        ));

        for stmt in stmts {
            match sqlx::query(&stmt).execute(&self.pool).await {
                Ok(_) => {}
                Err(err) if is_duplicate_object(&err) => {}
                Err(err) => return Err(self.classify(handle, err)),
            }
        }

        let indexed = names
            .len()
            .min(self.settings.max_indexes_per_chunk.saturating_sub(1));
        debug!(
            namespace = %handle.namespace,
            table = %chunk.name,
            chunk_start = chunk.chunk_start,
            columns = names.len(),
            indexed,
            "ensured chunk table"
        );
        Metrics::add(&self.metrics.chunk_tables_created_total, 1);
        Ok(())
    }

    /// Record the chunk and one lookup row per key; concurrent duplicates are ignored.
    async fn register_chunk(&self, handle: &NamespaceHandle, chunk: &ChunkTable) -> Result<()> {
        let signature: Vec<Value> = chunk
            .columns
            .keys()
            .map(|key| Value::String(key.to_string()))
            .collect();

        let result = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&format!(
                "insert into {} (table_name, chunk_start, signature) values ($1, $2, $3) on conflict (table_name) do nothing",
                qualified_name(&chunk.schema, CHUNKS_TABLE)
            ))
            .bind(&chunk.name)
            .bind(chunk.chunk_start)
            .bind(Json(Value::Array(signature)))
            .execute(&mut *tx)
            .await?;

            if !chunk.columns.is_empty() {
                let mut builder = QueryBuilder::<Postgres>::new(format!(
                    "insert into {} (table_name, kind, key, column_name, chunk_start) ",
                    qualified_name(&chunk.schema, LOOKUP_TABLE)
                ));
                builder.push_values(chunk.columns.iter(), |mut row, (key, column)| {
                    row.push_bind(chunk.name.clone())
                        .push_bind(key.kind.as_str())
                        .push_bind(key.name.clone())
                        .push_bind(column.clone())
                        .push_bind(chunk.chunk_start);
                });
                builder.push(" on conflict (table_name, kind, key) do nothing");
                builder.build().execute(&mut *tx).await?;
            }
            tx.commit().await
        }
        .await;

        result.map_err(|err| self.classify(handle, err))
    }

    /// Append events to a chunk table. All rows land or none do.
    pub async fn insert(
        &self,
        handle: &NamespaceHandle,
        chunk: &ChunkTable,
        events: &[Event],
    ) -> Result<u64> {
        for event in events {
            chunk.check_fits(event)?;
        }
        let columns: Vec<(&AttributeKey, &String)> = chunk.columns.iter().collect();
        let per_statement = (MAX_BIND_PARAMS / (columns.len() + 2)).max(1);

        let result = async {
            let mut tx = self.pool.begin().await?;
            let mut written = 0;
            for batch in events.chunks(per_statement) {
                let mut builder = QueryBuilder::<Postgres>::new(format!(
                    "insert into {} ({}",
                    chunk.qualified_name(),
                    quote_ident(TIMESTAMP_COLUMN)
                ));
                for (_, column) in &columns {
                    builder.push(", ");
                    builder.push(quote_ident(column));
                }
                builder.push(format!(", {}) ", quote_ident(PAYLOAD_COLUMN)));
                builder.push_values(batch, |mut row, event| {
                    row.push_bind(event.timestamp);
                    for (key, _) in &columns {
                        match key.kind {
                            AttributeKind::Metadata => {
                                row.push_bind(event.metadata.get(&key.name).cloned());
                            }
                            AttributeKind::Dimension => {
                                row.push_bind(event.dimensions.get(&key.name).copied());
                            }
                        }
                    }
                    row.push_bind(event.payload.clone());
                });
                written += builder.build().execute(&mut *tx).await?.rows_affected();
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(written)
        }
        .await;

        result.map_err(|err| self.classify(handle, err))
    }

    /// Every chunk table whose bucket may intersect `[start, end]`, with its lookup rows.
    pub async fn candidate_chunks(
        &self,
        handle: &NamespaceHandle,
        start: i64,
        end: i64,
    ) -> Result<Vec<ChunkTable>> {
        let rows: Vec<(String, i64, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(&format!(
                "select c.table_name, c.chunk_start, l.kind, l.key, l.column_name \
                 from {chunks} c left join {lookup} l on l.table_name = c.table_name \
                 where c.chunk_start > $1 and c.chunk_start <= $2 \
                 order by c.chunk_start, c.table_name",
                chunks = qualified_name(&handle.schema, CHUNKS_TABLE),
                lookup = qualified_name(&handle.schema, LOOKUP_TABLE),
            ))
            .bind(start.saturating_sub(handle.chunk_window_ms))
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| self.classify(handle, err))?;

        let mut chunks: Vec<ChunkTable> = Vec::new();
        for (table, chunk_start, kind, key, column) in rows {
            if chunks.last().map(|c| c.name != table).unwrap_or(true) {
                chunks.push(ChunkTable {
                    schema: handle.schema.clone(),
                    name: table.clone(),
                    chunk_start,
                    columns: BTreeMap::new(),
                });
            }
            if let (Some(kind), Some(key), Some(column)) = (kind, key, column) {
                let kind = AttributeKind::parse(&kind).ok_or_else(|| Error::SchemaMismatch {
                    table: table.clone(),
                    detail: format!("unknown attribute kind `{kind}` in lookup index"),
                })?;
                if let Some(chunk) = chunks.last_mut() {
                    chunk.columns.insert(AttributeKey { kind, name: key }, column);
                }
            }
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(keys: &[AttributeKey]) -> ChunkTable {
        ChunkTable {
            schema: "ns_a_1".into(),
            name: "c_0_ab".into(),
            chunk_start: 0,
            columns: keys
                .iter()
                .map(|k| (k.clone(), column_candidate(k, 0)))
                .collect(),
        }
    }

    #[test]
    fn event_must_fit_chunk_columns() {
        let table = chunk(&[AttributeKey::metadata("host"), AttributeKey::dimension("cpu")]);
        let fits = Event::new(1).metadata("host", "a").dimension("cpu", 0.5);
        assert!(table.check_fits(&fits).is_ok());

        let extra = Event::new(1).metadata("zone", "eu");
        let err = table.check_fits(&extra).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn dimension_key_is_not_a_metadata_column() {
        let table = chunk(&[AttributeKey::dimension("host")]);
        let event = Event::new(1).metadata("host", "a");
        assert!(table.check_fits(&event).is_err());
    }

    #[test]
    fn default_settings() {
        let settings = ChunkSettings::default();
        assert_eq!(settings.chunk_window_ms, 3_600_000);
        assert_eq!(settings.max_indexes_per_chunk, 64);
        assert_eq!(settings.max_cached_chunks, DEFAULT_MAX_CACHED_CHUNKS);
    }

    #[test]
    fn chunk_cache_evicts_oldest_bucket_when_full() {
        let table = |start: i64| ChunkTable {
            schema: "ns_x".into(),
            name: format!("c_{start}_0"),
            chunk_start: start,
            columns: BTreeMap::new(),
        };
        let mut cache = HashMap::new();
        for start in [7_200_000, 0, 3_600_000] {
            cache_chunk(&mut cache, format!("ns_x.c_{start}_0"), table(start), 3);
        }
        assert_eq!(cache.len(), 3);

        cache_chunk(&mut cache, "ns_x.c_10800000_0".into(), table(10_800_000), 3);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains_key("ns_x.c_0_0"));
        assert!(cache.contains_key("ns_x.c_10800000_0"));

        // refreshing a cached entry never evicts
        cache_chunk(&mut cache, "ns_x.c_3600000_0".into(), table(3_600_000), 3);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains_key("ns_x.c_7200000_0"));
    }
}

//! Query compiler: turns a time range plus metadata/dimension predicates into
//! one statement per chunk table that can possibly match, then merges.

pub mod predicate;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::time::Instant;

use crate::ddl::{PAYLOAD_COLUMN, TIMESTAMP_COLUMN};
use crate::event::{AttributeKey, AttributeKind, Event, ensure_unique_ignoring_case, validate_namespace};
use crate::metrics::Metrics;
use crate::naming::quote_ident;
use crate::schema::ChunkTable;
use crate::{Error, Result};

pub use predicate::{NumberPredicate, TextPredicate};

/// Longest time range a single read may span.
pub const MAX_QUERY_SPAN_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// A read (or delete) request against one namespace. The time range is
/// inclusive on both ends. A `limit` of zero or less is unbounded.
#[derive(Clone, Debug, PartialEq)]
pub struct EventQuery {
    pub namespace: String,
    pub start: i64,
    pub end: i64,
    pub metadata_query: BTreeMap<String, String>,
    pub dimensions_query: BTreeMap<String, String>,
    pub include_payloads: bool,
    pub ascending: bool,
    pub limit: i64,
    pub timeout: Option<Duration>,
}

impl EventQuery {
    pub fn new(namespace: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            namespace: namespace.into(),
            start,
            end,
            metadata_query: BTreeMap::new(),
            dimensions_query: BTreeMap::new(),
            include_payloads: true,
            ascending: true,
            limit: 0,
            timeout: None,
        }
    }

    pub fn metadata(mut self, key: impl Into<String>, query: impl Into<String>) -> Self {
        self.metadata_query.insert(key.into(), query.into());
        self
    }

    pub fn dimension(mut self, key: impl Into<String>, query: impl Into<String>) -> Self {
        self.dimensions_query.insert(key.into(), query.into());
        self
    }

    pub fn include_payloads(mut self, include: bool) -> Self {
        self.include_payloads = include;
        self
    }

    pub fn descending(mut self) -> Self {
        self.ascending = false;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Validate and parse operators. Any range length is accepted.
    pub fn parse(&self) -> Result<ParsedQuery> {
        validate_namespace(&self.namespace)?;
        if self.start < 0 {
            return Err(Error::InvalidQuery(format!(
                "start {} is negative",
                self.start
            )));
        }
        if self.start > self.end {
            return Err(Error::InvalidQuery(format!(
                "start {} is after end {}",
                self.start, self.end
            )));
        }
        ensure_unique_ignoring_case(self.metadata_query.keys(), "metadata query")
            .map_err(Error::InvalidQuery)?;
        ensure_unique_ignoring_case(self.dimensions_query.keys(), "dimensions query")
            .map_err(Error::InvalidQuery)?;

        let metadata = self
            .metadata_query
            .iter()
            .map(|(key, raw)| Ok((key.clone(), TextPredicate::parse(raw)?)))
            .collect::<Result<Vec<_>>>()?;
        let dimensions = self
            .dimensions_query
            .iter()
            .map(|(key, raw)| Ok((key.clone(), NumberPredicate::parse(raw)?)))
            .collect::<Result<Vec<_>>>()?;

        Ok(ParsedQuery {
            start: self.start,
            end: self.end,
            metadata,
            dimensions,
            include_payloads: self.include_payloads,
            ascending: self.ascending,
            limit: self.limit,
        })
    }

    /// [`parse`](Self::parse) plus the maximum read span.
    pub fn parse_for_read(&self) -> Result<ParsedQuery> {
        let parsed = self.parse()?;
        if self.end - self.start > MAX_QUERY_SPAN_MS {
            return Err(Error::InvalidQuery(format!(
                "range of {}ms exceeds the maximum of {MAX_QUERY_SPAN_MS}ms",
                self.end - self.start
            )));
        }
        Ok(parsed)
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedQuery {
    pub start: i64,
    pub end: i64,
    pub metadata: Vec<(String, TextPredicate)>,
    pub dimensions: Vec<(String, NumberPredicate)>,
    pub include_payloads: bool,
    pub ascending: bool,
    pub limit: i64,
}

impl ParsedQuery {
    /// Keys a chunk must carry to possibly match.
    pub fn required_keys(&self) -> Vec<AttributeKey> {
        self.metadata
            .iter()
            .map(|(key, _)| AttributeKey::metadata(key.clone()))
            .chain(
                self.dimensions
                    .iter()
                    .map(|(key, _)| AttributeKey::dimension(key.clone())),
            )
            .collect()
    }

    /// In-process evaluation with the same semantics as the compiled SQL.
    pub fn matches(&self, event: &Event) -> bool {
        if event.timestamp < self.start || event.timestamp > self.end {
            return false;
        }
        let metadata_ok = self.metadata.iter().all(|(key, predicate)| {
            event
                .metadata
                .get(key)
                .is_some_and(|value| predicate.matches(value))
        });
        let dimensions_ok = self.dimensions.iter().all(|(key, predicate)| {
            event
                .dimensions
                .get(key)
                .is_some_and(|value| predicate.matches(*value))
        });
        metadata_ok && dimensions_ok
    }
}

/// Keep only chunks whose bucket `[chunk_start, chunk_start + window)`
/// intersects `[start, end]` and whose lookup rows cover every queried key.
pub fn prune_chunks(chunks: Vec<ChunkTable>, window_ms: i64, query: &ParsedQuery) -> Vec<ChunkTable> {
    let required = query.required_keys();
    chunks
        .into_iter()
        .filter(|chunk| {
            chunk.chunk_start <= query.end
                && chunk.chunk_start.saturating_add(window_ms) > query.start
        })
        .filter(|chunk| required.iter().all(|key| chunk.has_key(key)))
        .collect()
}

fn push_where(builder: &mut QueryBuilder<'static, Postgres>, chunk: &ChunkTable, query: &ParsedQuery) -> Result<()> {
    let ts = quote_ident(TIMESTAMP_COLUMN);
    builder.push(format!(" where {ts} >= "));
    builder.push_bind(query.start);
    builder.push(format!(" and {ts} <= "));
    builder.push_bind(query.end);

    for (key, predicate) in &query.metadata {
        let column = chunk_column(chunk, &AttributeKey::metadata(key.clone()))?;
        builder.push(" and ");
        predicate.push_sql(builder, column);
    }
    for (key, predicate) in &query.dimensions {
        let column = chunk_column(chunk, &AttributeKey::dimension(key.clone()))?;
        builder.push(" and ");
        predicate.push_sql(builder, column);
    }
    Ok(())
}

fn chunk_column<'a>(chunk: &'a ChunkTable, key: &AttributeKey) -> Result<&'a str> {
    chunk.column(key).ok_or_else(|| Error::SchemaMismatch {
        table: chunk.name.clone(),
        detail: format!("pruned chunk has no column for {key}"),
    })
}

pub fn compile_select(chunk: &ChunkTable, query: &ParsedQuery) -> Result<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new(format!("select {}", quote_ident(TIMESTAMP_COLUMN)));
    for column in chunk.columns.values() {
        builder.push(", ");
        builder.push(quote_ident(column));
    }
    if query.include_payloads {
        builder.push(", ");
        builder.push(quote_ident(PAYLOAD_COLUMN));
    }
    builder.push(" from ");
    builder.push(chunk.qualified_name());
    push_where(&mut builder, chunk, query)?;
    builder.push(format!(
        " order by {} {}",
        quote_ident(TIMESTAMP_COLUMN),
        if query.ascending { "asc" } else { "desc" }
    ));
    // each chunk's first `limit` rows contain the global first `limit` after merging
    if query.limit > 0 {
        builder.push(" limit ");
        builder.push_bind(query.limit);
    }
    Ok(builder)
}

pub fn compile_delete(chunk: &ChunkTable, query: &ParsedQuery) -> Result<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new(format!("delete from {}", chunk.qualified_name()));
    push_where(&mut builder, chunk, query)?;
    Ok(builder)
}

pub fn compile_distinct(
    chunk: &ChunkTable,
    query: &ParsedQuery,
    column: &str,
) -> Result<QueryBuilder<'static, Postgres>> {
    let mut builder = QueryBuilder::new(format!(
        "select distinct {} from {}",
        quote_ident(column),
        chunk.qualified_name()
    ));
    push_where(&mut builder, chunk, query)?;
    Ok(builder)
}

fn decode_row(chunk: &ChunkTable, row: &PgRow, include_payloads: bool) -> std::result::Result<Event, sqlx::Error> {
    let mut event = Event::new(row.try_get::<i64, _>(0)?);
    for (i, key) in chunk.columns.keys().enumerate() {
        let index = i + 1;
        match key.kind {
            AttributeKind::Metadata => {
                if let Some(value) = row.try_get::<Option<String>, _>(index)? {
                    event.metadata.insert(key.name.clone(), value);
                }
            }
            AttributeKind::Dimension => {
                if let Some(value) = row.try_get::<Option<f64>, _>(index)? {
                    event.dimensions.insert(key.name.clone(), value);
                }
            }
        }
    }
    if include_payloads {
        event.payload = row.try_get::<Option<Vec<u8>>, _>(chunk.columns.len() + 1)?;
    }
    Ok(event)
}

/// Merge per-chunk results, sort by timestamp and apply the limit.
pub fn merge_results(batches: Vec<Vec<Event>>, ascending: bool, limit: i64) -> Vec<Event> {
    let mut merged: Vec<Event> = batches.into_iter().flatten().collect();
    if ascending {
        merged.sort_by_key(|event| event.timestamp);
    } else {
        merged.sort_by_key(|event| Reverse(event.timestamp));
    }
    if limit > 0 {
        merged.truncate(limit as usize);
    }
    merged
}

fn check_deadline(deadline: Option<Instant>, operation: &str) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(Error::Timeout {
                    operation: operation.to_string(),
                })
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

async fn with_deadline<F, T>(remaining: Option<Duration>, operation: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match remaining {
        None => Ok(fut.await?),
        Some(remaining) => match tokio::time::timeout(remaining, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
            }),
        },
    }
}

/// Executes compiled statements chunk by chunk. Cancellation is cooperative:
/// the deadline is checked between chunks and bounds each statement.
#[derive(Clone)]
pub struct QueryCompiler {
    pool: PgPool,
    slow_query_threshold: Duration,
    metrics: Arc<Metrics>,
}

impl QueryCompiler {
    pub fn new(pool: PgPool, slow_query_threshold: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            slow_query_threshold,
            metrics,
        }
    }

    fn observe(&self, namespace: &str, sql: &str, started: std::time::Instant) {
        let elapsed = started.elapsed();
        Metrics::add(&self.metrics.chunk_statements_total, 1);
        if elapsed > self.slow_query_threshold {
            Metrics::add(&self.metrics.slow_queries_total, 1);
            tracing::warn!(target: "eventide::slow_query", namespace, elapsed_ms = elapsed.as_millis() as u64, sql = %sql, "slow chunk query");
        }
    }

    fn record_pruning(&self, namespace: &str, before: usize, after: usize) {
        Metrics::add(&self.metrics.chunks_pruned_total, (before - after) as u64);
        tracing::debug!(namespace, candidates = before, selected = after, "pruned chunk tables");
    }

    pub async fn fetch(
        &self,
        namespace: &str,
        candidates: Vec<ChunkTable>,
        window_ms: i64,
        query: &ParsedQuery,
        deadline: Option<Instant>,
    ) -> Result<Vec<Event>> {
        let before = candidates.len();
        let chunks = prune_chunks(candidates, window_ms, query);
        self.record_pruning(namespace, before, chunks.len());

        let started = std::time::Instant::now();
        let mut batches = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let remaining = check_deadline(deadline, "event query")?;
            let mut builder = compile_select(chunk, query)?;
            let sql = builder.sql().to_string();
            let statement_started = std::time::Instant::now();
            let rows = with_deadline(
                remaining,
                "event query",
                builder.build().fetch_all(&self.pool),
            )
            .await?;
            self.observe(namespace, &sql, statement_started);
            let events = rows
                .iter()
                .map(|row| decode_row(chunk, row, query.include_payloads))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            batches.push(events);
        }
        self.metrics.record_query_duration(started.elapsed());
        Ok(merge_results(batches, query.ascending, query.limit))
    }

    pub async fn delete(
        &self,
        namespace: &str,
        candidates: Vec<ChunkTable>,
        window_ms: i64,
        query: &ParsedQuery,
        deadline: Option<Instant>,
    ) -> Result<u64> {
        let chunks = prune_chunks(candidates, window_ms, query);
        let mut deleted = 0;
        for chunk in &chunks {
            let remaining = check_deadline(deadline, "expire")?;
            let mut builder = compile_delete(chunk, query)?;
            let sql = builder.sql().to_string();
            let started = std::time::Instant::now();
            let result = with_deadline(remaining, "expire", builder.build().execute(&self.pool)).await?;
            self.observe(namespace, &sql, started);
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    pub async fn distinct_metadata(
        &self,
        namespace: &str,
        candidates: Vec<ChunkTable>,
        window_ms: i64,
        query: &ParsedQuery,
        key: &str,
        deadline: Option<Instant>,
    ) -> Result<BTreeSet<String>> {
        let wanted = AttributeKey::metadata(key);
        let chunks: Vec<ChunkTable> = prune_chunks(candidates, window_ms, query)
            .into_iter()
            .filter(|chunk| chunk.has_key(&wanted))
            .collect();
        let mut values = BTreeSet::new();
        for chunk in &chunks {
            let remaining = check_deadline(deadline, "metadata values")?;
            let column = chunk_column(chunk, &wanted)?;
            let mut builder = compile_distinct(chunk, query, column)?;
            let sql = builder.sql().to_string();
            let started = std::time::Instant::now();
            let rows = with_deadline(
                remaining,
                "metadata values",
                builder.build_query_scalar::<Option<String>>().fetch_all(&self.pool),
            )
            .await?;
            self.observe(namespace, &sql, started);
            values.extend(rows.into_iter().flatten());
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::column_candidate;

    fn chunk(name: &str, chunk_start: i64, keys: &[AttributeKey]) -> ChunkTable {
        ChunkTable {
            schema: "ns_x_1".into(),
            name: name.into(),
            chunk_start,
            columns: keys
                .iter()
                .map(|k| (k.clone(), column_candidate(k, 0)))
                .collect(),
        }
    }

    #[test]
    fn rejects_invalid_ranges() {
        assert!(EventQuery::new("ns", -1, 5).parse().is_err());
        assert!(EventQuery::new("ns", 10, 5).parse().is_err());
        let wide = EventQuery::new("ns", 0, MAX_QUERY_SPAN_MS + 1);
        assert!(wide.parse().is_ok());
        assert!(matches!(
            wide.parse_for_read().unwrap_err(),
            Error::InvalidQuery(_)
        ));
        assert!(EventQuery::new("ns", 0, MAX_QUERY_SPAN_MS).parse_for_read().is_ok());
    }

    #[test]
    fn rejects_case_insensitive_duplicate_query_keys() {
        let query = EventQuery::new("ns", 0, 10)
            .metadata("Host", "a")
            .metadata("host", "b");
        assert!(matches!(query.parse().unwrap_err(), Error::InvalidQuery(_)));
    }

    #[test]
    fn prunes_by_key_and_bucket() {
        let host = AttributeKey::metadata("host");
        let cpu = AttributeKey::dimension("cpu");
        let candidates = vec![
            chunk("with_host", 0, &[host.clone()]),
            chunk("with_both", 0, &[host.clone(), cpu.clone()]),
            chunk("without", 0, &[cpu.clone()]),
            chunk("too_late", 2_000, &[host.clone()]),
            chunk("too_early", -1_000, &[host.clone()]),
        ];
        let query = EventQuery::new("ns", 500, 1_500)
            .metadata("host", "a")
            .parse()
            .unwrap();
        let names: Vec<String> = prune_chunks(candidates, 1_000, &query)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["with_host", "with_both"]);
    }

    #[test]
    fn bucket_touching_range_end_is_kept() {
        let query = EventQuery::new("ns", 0, 1_000).parse().unwrap();
        let kept = prune_chunks(vec![chunk("edge", 1_000, &[])], 1_000, &query);
        assert_eq!(kept.len(), 1);
        let query = EventQuery::new("ns", 1_000, 1_500).parse().unwrap();
        let dropped = prune_chunks(vec![chunk("before", 0, &[])], 1_000, &query);
        assert!(dropped.is_empty());
    }

    #[test]
    fn compiles_select_with_predicates() {
        let table = chunk(
            "c_0_ab",
            0,
            &[AttributeKey::metadata("host"), AttributeKey::dimension("cpu")],
        );
        let query = EventQuery::new("ns", 0, 100)
            .metadata("host", "!~db-*")
            .dimension("cpu", ">=0.5")
            .include_payloads(false)
            .descending()
            .limit(10)
            .parse()
            .unwrap();
        let builder = compile_select(&table, &query).unwrap();
        assert_eq!(
            builder.sql(),
            "select \"ts\", \"m_host\", \"d_cpu\" from \"ns_x_1\".\"c_0_ab\" where \"ts\" >= $1 and \"ts\" <= $2 and \"m_host\" not like $3 escape '\\' and \"d_cpu\" >= $4 order by \"ts\" desc limit $5"
        );
    }

    #[test]
    fn compiles_unbounded_select_with_payload() {
        let table = chunk("c_0_ab", 0, &[]);
        let query = EventQuery::new("ns", 0, 100).limit(-1).parse().unwrap();
        let builder = compile_select(&table, &query).unwrap();
        assert_eq!(
            builder.sql(),
            "select \"ts\", \"payload\" from \"ns_x_1\".\"c_0_ab\" where \"ts\" >= $1 and \"ts\" <= $2 order by \"ts\" asc"
        );
    }

    #[test]
    fn compiles_delete() {
        let table = chunk("c_0_ab", 0, &[AttributeKey::dimension("cpu")]);
        let query = EventQuery::new("ns", 0, 100)
            .dimension("cpu", "1..2")
            .parse()
            .unwrap();
        let builder = compile_delete(&table, &query).unwrap();
        assert_eq!(
            builder.sql(),
            "delete from \"ns_x_1\".\"c_0_ab\" where \"ts\" >= $1 and \"ts\" <= $2 and (\"d_cpu\" > $3 and \"d_cpu\" < $4)"
        );
    }

    #[test]
    fn compile_refuses_unpruned_chunk() {
        let table = chunk("c_0_ab", 0, &[]);
        let query = EventQuery::new("ns", 0, 100)
            .metadata("host", "a")
            .parse()
            .unwrap();
        assert!(matches!(
            compile_select(&table, &query),
            Err(Error::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn merge_sorts_and_limits() {
        let a = vec![Event::new(1), Event::new(5)];
        let b = vec![Event::new(3), Event::new(4)];
        let asc: Vec<i64> = merge_results(vec![a.clone(), b.clone()], true, 3)
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(asc, vec![1, 3, 4]);
        let desc: Vec<i64> = merge_results(vec![a, b], false, 0)
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(desc, vec![5, 4, 3, 1]);
    }

    #[test]
    fn in_process_matching_follows_grammar() {
        let query = EventQuery::new("ns", 0, 100)
            .metadata("host", "~*%%%___*")
            .dimension("cpu", "1..5")
            .parse()
            .unwrap();
        let hit = Event::new(10).metadata("host", "X%%%___Y").dimension("cpu", 2.0);
        let boundary = Event::new(10).metadata("host", "X%%%___Y").dimension("cpu", 5.0);
        let missing_key = Event::new(10).metadata("host", "X%%%___Y");
        assert!(query.matches(&hit));
        assert!(!query.matches(&boundary));
        assert!(!query.matches(&missing_key));
    }

    #[test]
    fn deadline_in_the_past_times_out() {
        let past = Instant::now() - Duration::from_millis(1);
        assert!(matches!(
            check_deadline(Some(past), "event query"),
            Err(Error::Timeout { .. })
        ));
        assert!(check_deadline(None, "event query").unwrap().is_none());
    }
}

//! Helpers shared by integration tests and benchmarks.

use std::collections::BTreeMap;

use sqlx::PgPool;

use crate::Result;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::event::Event;
use crate::naming::namespace_schema_name;
use crate::query::EventQuery;
use crate::store::EventStore;

pub async fn memory_engine(shards: usize) -> Result<Engine> {
    Engine::open(EngineConfig::memory(shards)).await
}

/// `count` events one `step_ms` apart starting at `start`, alternating
/// between two hosts and carrying a cpu dimension and payload.
pub fn host_events(start: i64, step_ms: i64, count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            let host = if i % 2 == 0 { "web-1" } else { "web-2" };
            Event::new(start + i as i64 * step_ms)
                .metadata("host", host)
                .dimension("cpu", i as f64)
                .payload(format!("event-{i}").into_bytes())
        })
        .collect()
}

/// Number of events in the inclusive range, walking it in week-sized reads.
pub async fn count_events(events: &dyn EventStore, namespace: &str, start: i64, end: i64) -> Result<usize> {
    let mut total = 0;
    let mut from = start;
    while from <= end {
        let to = end.min(from + crate::query::MAX_QUERY_SPAN_MS);
        total += events
            .get(&EventQuery::new(namespace, from, to).include_payloads(false))
            .await?
            .len();
        from = to + 1;
    }
    Ok(total)
}

/// Chunk tables of a namespace on a Postgres shard, with their column names.
pub async fn chunk_tables(pool: &PgPool, namespace: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let schema = namespace_schema_name(namespace);
    let rows: Vec<(String, String)> = sqlx::query_as(
        "select table_name::text, column_name::text from information_schema.columns \
         where table_schema = $1 and table_name like 'c\\_%' \
         order by table_name, ordinal_position",
    )
    .bind(&schema)
    .fetch_all(pool)
    .await?;

    let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (table, column) in rows {
        tables.entry(table).or_default().push(column);
    }
    Ok(tables)
}

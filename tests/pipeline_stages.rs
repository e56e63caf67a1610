use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use eventide::archive::ArchiveFile;
use eventide::metrics::Metrics;
use eventide::pipeline::{Pipeline, deadline, traced};
use eventide::testing::{count_events, host_events};
use eventide::{Engine, EngineConfig, Error, Event, EventQuery, EventStore, MemoryEvents};

const T0: i64 = 1_700_000_000_000;

/// Memory store whose reads take longer than any test deadline.
struct SlowEvents {
    inner: MemoryEvents,
    delay: Duration,
}

#[async_trait]
impl EventStore for SlowEvents {
    async fn namespaces(&self) -> eventide::Result<Vec<String>> {
        self.inner.namespaces().await
    }

    async fn create(&self, namespace: &str) -> eventide::Result<()> {
        self.inner.create(namespace).await
    }

    async fn drop_namespace(&self, namespace: &str) -> eventide::Result<()> {
        self.inner.drop_namespace(namespace).await
    }

    async fn store(&self, namespace: &str, events: &[Event]) -> eventide::Result<()> {
        self.inner.store(namespace, events).await
    }

    async fn get(&self, query: &EventQuery) -> eventide::Result<Vec<Event>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(query).await
    }

    async fn expire(&self, query: &EventQuery) -> eventide::Result<u64> {
        self.inner.expire(query).await
    }

    async fn metadata_values(
        &self,
        query: &EventQuery,
        key: &str,
    ) -> eventide::Result<BTreeSet<String>> {
        self.inner.metadata_values(query, key).await
    }
}

#[tokio::test]
async fn expiry_archives_first_when_configured() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = EngineConfig {
        archive_dir: Some(dir.path().to_path_buf()),
        archive_window: Duration::from_secs(30 * 60),
        ..EngineConfig::memory(2)
    };
    let engine = Engine::open(config).await?;
    let events = engine.events();
    events.create("ns").await?;
    events.store("ns", &host_events(T0, 10_000, 300)).await?;

    let deleted = events.expire(&EventQuery::new("ns", T0, T0 + 3_600_000 - 1)).await?;
    assert_eq!(deleted, 300);

    let files: Vec<ArchiveFile> = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| ArchiveFile::from_path(&entry.path()))
        .collect();
    assert_eq!(files.len(), 1);
    assert_eq!((files[0].start, files[0].end), (T0, T0 + 3_600_000));

    let report = engine.archiver(dir.path()).restore("ns", &files[0].path).await?;
    assert_eq!(report.events, 300);
    assert_eq!(count_events(events.as_ref(), "ns", T0, T0 + 3_600_000).await?, 300);
    assert_eq!(engine.metrics().archive_entries_total.load(Ordering::Relaxed), 2);
    Ok(())
}

#[tokio::test]
async fn late_events_expired_twice_keep_both_archives() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = EngineConfig {
        archive_dir: Some(dir.path().to_path_buf()),
        archive_window: Duration::from_secs(60 * 60),
        ..EngineConfig::memory(1)
    };
    let engine = Engine::open(config).await?;
    let events = engine.events();
    let range = EventQuery::new("ns", T0, T0 + 3_600_000 - 1);
    events.create("ns").await?;

    events.store("ns", &host_events(T0, 1_000, 2)).await?;
    assert_eq!(events.expire(&range).await?, 2);
    events.store("ns", &[Event::new(T0 + 5_000).metadata("host", "late")]).await?;
    assert_eq!(events.expire(&range).await?, 1);

    let archiver = engine.archiver(dir.path());
    let files = archiver.candidates("ns", T0, T0 + 3_600_000).await?;
    let seqs: Vec<u32> = files.iter().map(|f| f.seq).collect();
    assert_eq!(seqs, vec![0, 1]);
    for file in &files {
        archiver.restore("ns", &file.path).await?;
    }
    assert_eq!(count_events(events.as_ref(), "ns", T0, T0 + 3_600_000).await?, 3);
    Ok(())
}

#[tokio::test]
async fn deadline_turns_slow_calls_into_timeouts() -> Result<()> {
    let metrics = Arc::new(Metrics::new());
    let slow = SlowEvents {
        inner: MemoryEvents::default(),
        delay: Duration::from_millis(500),
    };
    let events = Pipeline::new()
        .stage("deadline", deadline(Duration::from_millis(20)))
        .stage("traced", traced(metrics.clone()))
        .apply(Arc::new(slow));

    events.create("ns").await?;
    let err = events.get(&EventQuery::new("ns", 0, 10)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(err.is_retryable());
    assert_eq!(metrics.timeouts_total.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.operation_errors_total.load(Ordering::Relaxed), 1);

    // writes are not slowed down and go through
    events.store("ns", &[Event::new(1)]).await?;
    Ok(())
}

#[tokio::test]
async fn engine_with_call_timeout_still_serves_fast_calls() -> Result<()> {
    let config = EngineConfig {
        call_timeout: Some(Duration::from_secs(5)),
        ..EngineConfig::memory(1)
    };
    let engine = Engine::open(config).await?;
    let events = engine.events();
    events.create("ns").await?;
    events.store("ns", &host_events(0, 1, 5)).await?;
    assert_eq!(events.get(&EventQuery::new("ns", 0, 10)).await?.len(), 5);
    assert!(engine.metrics().render_prometheus().contains("eventide_events_stored_total 5"));
    Ok(())
}

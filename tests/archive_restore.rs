use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

use anyhow::Result;
use eventide::archive::codec::ArchiveReader;
use eventide::testing::{count_events, host_events, memory_engine};
use eventide::{Error, Event, EventQuery};

const T0: i64 = 1_700_000_000_000;
const HOUR: i64 = 60 * 60 * 1000;

#[tokio::test]
async fn archive_expire_restore_preserves_totals() -> Result<()> {
    let engine = memory_engine(2).await?;
    let events = engine.events();
    let dir = tempfile::tempdir()?;
    let archiver = engine.archiver(dir.path());

    events.create("metrics").await?;
    events.store("metrics", &host_events(T0, 7_000, 1_000)).await?;
    let t1 = T0 + 2 * HOUR;
    let before = count_events(events.as_ref(), "metrics", T0, t1).await?;
    assert_eq!(before, 1_000);

    let summary = archiver
        .archive(&EventQuery::new("metrics", T0, t1), Duration::from_secs(15 * 60))
        .await?
        .expect("range has events");
    assert_eq!(summary.events, 1_000);
    assert_eq!(summary.entries, 8);

    let deleted = events.expire(&EventQuery::new("metrics", T0, t1 - 1)).await?;
    assert_eq!(deleted, 1_000);
    assert_eq!(count_events(events.as_ref(), "metrics", T0, t1).await?, 0);

    let report = archiver.restore("metrics", &summary.path).await?;
    assert_eq!(report.events, 1_000);
    assert_eq!(count_events(events.as_ref(), "metrics", T0, t1).await?, before);

    let restored = events
        .get(&EventQuery::new("metrics", T0, T0).include_payloads(true))
        .await?;
    assert_eq!(restored, host_events(T0, 7_000, 1));
    Ok(())
}

#[tokio::test]
async fn empty_range_writes_no_file() -> Result<()> {
    let engine = memory_engine(1).await?;
    let events = engine.events();
    let dir = tempfile::tempdir()?;
    events.create("quiet").await?;
    events.store("quiet", &[Event::new(T0 + 5 * HOUR)]).await?;

    let summary = engine
        .archiver(dir.path())
        .archive(&EventQuery::new("quiet", T0, T0 + HOUR), Duration::from_secs(60 * 60))
        .await?;
    assert!(summary.is_none());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn entries_are_named_by_window_in_order() -> Result<()> {
    let engine = memory_engine(1).await?;
    let events = engine.events();
    let dir = tempfile::tempdir()?;
    events.create("team/web").await?;
    events
        .store(
            "team/web",
            &[
                Event::new(T0 + 10).metadata("host", "a"),
                Event::new(T0 + 25 * 60_000).metadata("host", "b"),
            ],
        )
        .await?;

    let summary = engine
        .archiver(dir.path())
        .archive(&EventQuery::new("team/web", T0, T0 + HOUR), Duration::from_secs(10 * 60))
        .await?
        .expect("range has events");

    let mut reader = ArchiveReader::new(BufReader::new(File::open(&summary.path)?))?;
    let names: Vec<String> = reader
        .entry_headers()?
        .into_iter()
        .map(|h| h.name.to_string())
        .collect();
    assert_eq!(
        names,
        vec![
            format!("team/web/{}-{}", T0, T0 + 10 * 60_000),
            format!("team/web/{}-{}", T0 + 20 * 60_000, T0 + 30 * 60_000),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn archive_respects_predicates_and_window_limits() -> Result<()> {
    let engine = memory_engine(1).await?;
    let events = engine.events();
    let dir = tempfile::tempdir()?;
    let archiver = engine.archiver(dir.path());
    events.create("ns").await?;
    events.store("ns", &host_events(T0, 1_000, 100)).await?;

    let err = archiver
        .archive(&EventQuery::new("ns", T0, T0 + HOUR), Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));

    let summary = archiver
        .archive(
            &EventQuery::new("ns", T0, T0 + HOUR).metadata("host", "web-2"),
            Duration::from_secs(60 * 60),
        )
        .await?
        .expect("web-2 has events");
    assert_eq!(summary.events, 50);
    Ok(())
}

#[tokio::test]
async fn restore_creates_namespace_and_duplicates_on_repeat() -> Result<()> {
    let engine = memory_engine(2).await?;
    let events = engine.events();
    let dir = tempfile::tempdir()?;
    let archiver = engine.archiver(dir.path());
    events.create("src").await?;
    events.store("src", &host_events(T0, 1_000, 20)).await?;
    let summary = archiver
        .archive(&EventQuery::new("src", T0, T0 + HOUR), Duration::from_secs(60 * 60))
        .await?
        .expect("range has events");

    archiver.restore("copy", &summary.path).await?;
    assert_eq!(count_events(events.as_ref(), "copy", T0, T0 + HOUR).await?, 20);
    archiver.restore("copy", &summary.path).await?;
    assert_eq!(count_events(events.as_ref(), "copy", T0, T0 + HOUR).await?, 40);
    Ok(())
}

#[tokio::test]
async fn candidates_match_overlapping_files() -> Result<()> {
    let engine = memory_engine(1).await?;
    let events = engine.events();
    let dir = tempfile::tempdir()?;
    let archiver = engine.archiver(dir.path());
    events.create("ns").await?;
    events.store("ns", &host_events(T0, 60_000, 180)).await?;

    for hour in 0..3 {
        let start = T0 + hour * HOUR;
        archiver
            .archive(&EventQuery::new("ns", start, start + HOUR), Duration::from_secs(60 * 60))
            .await?;
    }
    std::fs::write(dir.path().join("README"), "not an archive")?;

    let found = archiver.candidates("ns", T0 + HOUR - 1, T0 + HOUR + 1).await?;
    let starts: Vec<i64> = found.iter().map(|f| f.start).collect();
    assert_eq!(starts, vec![T0, T0 + HOUR]);
    assert!(archiver.candidates("other", T0, T0 + 3 * HOUR).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn corrupt_entry_stops_restore_after_earlier_entries() -> Result<()> {
    let engine = memory_engine(1).await?;
    let events = engine.events();
    let dir = tempfile::tempdir()?;
    let archiver = engine.archiver(dir.path());
    events.create("src").await?;
    events.store("src", &host_events(T0, 60_000, 120)).await?;
    let summary = archiver
        .archive(&EventQuery::new("src", T0, T0 + 2 * HOUR), Duration::from_secs(60 * 60))
        .await?
        .expect("range has events");

    let mut bytes = std::fs::read(&summary.path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&summary.path, bytes)?;

    let err = archiver.restore("dst", &summary.path).await.unwrap_err();
    assert!(matches!(err.root(), Error::CorruptArchive(_)));
    assert_eq!(count_events(events.as_ref(), "dst", T0, T0 + 2 * HOUR).await?, 60);
    Ok(())
}

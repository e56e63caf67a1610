use anyhow::Result;
use eventide::{Error, Event, EventQuery, EventStore, MemoryEvents};

async fn store_with(events: &[Event]) -> Result<MemoryEvents> {
    let store = MemoryEvents::new(60_000);
    store.create("ns").await?;
    store.store("ns", events).await?;
    Ok(store)
}

#[tokio::test]
async fn stored_event_round_trips() -> Result<()> {
    let event = Event::new(1_000)
        .metadata("host", "web-1")
        .metadata("Region", "eu-west")
        .dimension("cpu", 0.25)
        .dimension("mem", 1024.0)
        .payload(vec![0, 1, 2, 255]);
    let bare = Event::new(2_000).metadata("host", "web-1");
    let store = store_with(&[event.clone(), bare.clone()]).await?;

    let got = store.get(&EventQuery::new("ns", 1_000, 1_001)).await?;
    assert_eq!(got, vec![event]);

    let got = store.get(&EventQuery::new("ns", 2_000, 2_001)).await?;
    assert_eq!(got, vec![bare]);
    assert_eq!(got[0].payload, None);
    Ok(())
}

#[tokio::test]
async fn shapes_are_isolated() -> Result<()> {
    let store = store_with(&[
        Event::new(5).metadata("a", "1"),
        Event::new(5).metadata("b", "2"),
    ])
    .await?;
    assert_eq!(store.chunk_count("ns"), 2);

    let got = store.get(&EventQuery::new("ns", 0, 10).metadata("a", "1")).await?;
    assert_eq!(got, vec![Event::new(5).metadata("a", "1")]);

    let got = store.get(&EventQuery::new("ns", 0, 10).metadata("a", "!1")).await?;
    assert!(got.is_empty());
    Ok(())
}

#[tokio::test]
async fn wildcards_match_sql_metacharacters_literally() -> Result<()> {
    let store = store_with(&[Event::new(1).metadata("m", "X%%%___Y")]).await?;
    let hits = store.get(&EventQuery::new("ns", 0, 2).metadata("m", "~*%%%___*")).await?;
    assert_eq!(hits.len(), 1);
    let misses = store.get(&EventQuery::new("ns", 0, 2).metadata("m", "~*%%%__-*")).await?;
    assert!(misses.is_empty());
    let anchored = store.get(&EventQuery::new("ns", 0, 2).metadata("m", "~%%%*")).await?;
    assert!(anchored.is_empty());
    let negated = store.get(&EventQuery::new("ns", 0, 2).metadata("m", "!~X*Y")).await?;
    assert!(negated.is_empty());
    Ok(())
}

#[tokio::test]
async fn range_bounds_are_exclusive() -> Result<()> {
    let store = store_with(&[
        Event::new(1).dimension("d", 1.0),
        Event::new(2).dimension("d", 3.0),
        Event::new(3).dimension("d", 5.0),
    ])
    .await?;
    let got = store.get(&EventQuery::new("ns", 0, 10).dimension("d", "1..5")).await?;
    assert_eq!(got, vec![Event::new(2).dimension("d", 3.0)]);

    let got = store.get(&EventQuery::new("ns", 0, 10).dimension("d", ">=3")).await?;
    assert_eq!(got.len(), 2);
    Ok(())
}

#[tokio::test]
async fn results_are_sorted_across_shapes_and_limited() -> Result<()> {
    let store = store_with(&[
        Event::new(30).metadata("a", "x"),
        Event::new(10).metadata("b", "x"),
        Event::new(20).metadata("a", "x").dimension("n", 1.0),
        Event::new(70_000).metadata("a", "x"),
    ])
    .await?;

    let asc: Vec<i64> = store
        .get(&EventQuery::new("ns", 0, 100_000))
        .await?
        .iter()
        .map(|e| e.timestamp)
        .collect();
    assert_eq!(asc, vec![10, 20, 30, 70_000]);

    let desc: Vec<i64> = store
        .get(&EventQuery::new("ns", 0, 100_000).descending().limit(2))
        .await?
        .iter()
        .map(|e| e.timestamp)
        .collect();
    assert_eq!(desc, vec![70_000, 30]);

    let unbounded = store.get(&EventQuery::new("ns", 0, 100_000).limit(-1)).await?;
    assert_eq!(unbounded.len(), 4);
    Ok(())
}

#[tokio::test]
async fn metadata_values_and_expire() -> Result<()> {
    let store = store_with(&eventide::testing::host_events(0, 1_000, 10)).await?;

    let hosts = store.metadata_values(&EventQuery::new("ns", 0, 100_000), "host").await?;
    assert_eq!(hosts.into_iter().collect::<Vec<_>>(), vec!["web-1", "web-2"]);

    let deleted = store
        .expire(&EventQuery::new("ns", 0, 4_000).metadata("host", "web-1"))
        .await?;
    assert_eq!(deleted, 3);
    let left = store.get(&EventQuery::new("ns", 0, 100_000)).await?;
    assert_eq!(left.len(), 7);
    Ok(())
}

#[tokio::test]
async fn validation_happens_before_storage() -> Result<()> {
    let store = store_with(&[]).await?;

    let err = store.get(&EventQuery::new("ns", 10, 5)).await.unwrap_err();
    assert!(err.is_validation());
    let err = store
        .get(&EventQuery::new("ns", 0, 8 * 24 * 60 * 60 * 1000))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery(_)));
    let err = store
        .get(&EventQuery::new("ns", 0, 5).dimension("d", "5..1"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let dup = Event::new(1).metadata("Host", "a").metadata("host", "b");
    assert!(matches!(
        store.store("ns", &[dup]).await,
        Err(Error::InvalidEvent(_))
    ));
    let nan = Event::new(1).dimension("d", f64::NAN);
    assert!(store.store("ns", &[nan]).await.is_err());
    let negative = Event::new(-1);
    assert!(store.store("ns", &[negative]).await.is_err());

    // expire ignores the read span limit
    assert_eq!(
        store
            .expire(&EventQuery::new("ns", 0, 30 * 24 * 60 * 60 * 1000))
            .await?,
        0
    );
    Ok(())
}

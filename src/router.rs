//! Namespace to shard routing with a rebuild-on-miss lookup table.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, error, info};

use crate::event::Event;
use crate::metrics::Metrics;
use crate::query::EventQuery;
use crate::store::EventStore;
use crate::{Error, Result, WithContext};

/// One backing store instance.
#[derive(Clone)]
pub struct Shard {
    pub name: String,
    pub events: Arc<dyn EventStore>,
}

impl Shard {
    pub fn new(name: impl Into<String>, events: Arc<dyn EventStore>) -> Self {
        Self {
            name: name.into(),
            events,
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard").field("name", &self.name).finish()
    }
}

/// Immutable snapshot of which shards report which namespaces.
#[derive(Debug, Default)]
struct RouteTable {
    owners: HashMap<String, Vec<usize>>,
    loads: Vec<usize>,
}

/// Routes each namespace to exactly one shard. Readers take the current
/// snapshot without locking; a rebuild swaps in a complete new one.
pub struct ShardRouter {
    shards: Vec<Shard>,
    table: ArcSwap<RouteTable>,
    metrics: Arc<Metrics>,
}

impl ShardRouter {
    pub fn new(shards: Vec<Shard>, metrics: Arc<Metrics>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::Config("at least one shard is required".into()));
        }
        let mut seen = BTreeSet::new();
        for shard in &shards {
            if !seen.insert(shard.name.as_str()) {
                return Err(Error::Config(format!(
                    "shard name `{}` is used twice",
                    shard.name
                )));
            }
        }
        Ok(Self {
            shards,
            table: ArcSwap::from_pointee(RouteTable::default()),
            metrics,
        })
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Drop the cached snapshot; the next lookup rebuilds it.
    pub fn invalidate(&self) {
        self.table.store(Arc::new(RouteTable::default()));
    }

    /// Enumerate every shard's namespaces and swap in the union.
    pub async fn rebuild(&self) -> Result<()> {
        let listings = try_join_all(self.shards.iter().map(|shard| async move {
            shard
                .events
                .namespaces()
                .await
                .context(format!("list namespaces on shard `{}`", shard.name))
        }))
        .await?;

        let mut table = RouteTable {
            owners: HashMap::new(),
            loads: Vec::with_capacity(listings.len()),
        };
        for (index, namespaces) in listings.into_iter().enumerate() {
            table.loads.push(namespaces.len());
            for namespace in namespaces {
                table.owners.entry(namespace).or_default().push(index);
            }
        }
        debug!(
            namespaces = table.owners.len(),
            shards = table.loads.len(),
            "rebuilt shard lookup table"
        );
        Metrics::add(&self.metrics.shard_rebuilds_total, 1);
        self.table.store(Arc::new(table));
        Ok(())
    }

    fn resolve(&self, namespace: &str, owners: &[usize]) -> Result<&Shard> {
        match owners {
            [] => Err(Error::ShardNotFound(namespace.to_string())),
            [index] => Ok(&self.shards[*index]),
            many => {
                let shards: Vec<String> = many
                    .iter()
                    .map(|i| self.shards[*i].name.clone())
                    .collect();
                error!(namespace, ?shards, "namespace is owned by more than one shard");
                Err(Error::AmbiguousShard {
                    namespace: namespace.to_string(),
                    shards,
                })
            }
        }
    }

    fn cached(&self, namespace: &str) -> Option<Vec<usize>> {
        self.table.load().owners.get(namespace).cloned()
    }

    pub async fn route_for_read(&self, namespace: &str) -> Result<&Shard> {
        if let Some(owners) = self.cached(namespace) {
            return self.resolve(namespace, &owners);
        }
        self.rebuild().await?;
        let owners = self.cached(namespace).unwrap_or_default();
        self.resolve(namespace, &owners)
    }

    /// The owning shard if the namespace exists, otherwise the least loaded
    /// shard (ties go to the first configured).
    pub async fn route_for_create(&self, namespace: &str) -> Result<&Shard> {
        match self.route_for_read(namespace).await {
            Ok(shard) => return Ok(shard),
            Err(Error::ShardNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let table = self.table.load();
        let index = table
            .loads
            .iter()
            .enumerate()
            .min_by_key(|(index, load)| (**load, *index))
            .map(|(index, _)| index)
            .unwrap_or(0);
        Ok(&self.shards[index])
    }

    pub async fn route_for_drop(&self, namespace: &str) -> Result<&Shard> {
        self.route_for_read(namespace).await
    }

    pub async fn create(&self, namespace: &str) -> Result<&Shard> {
        let shard = self.route_for_create(namespace).await?;
        shard.events.create(namespace).await?;
        self.rebuild().await?;
        info!(namespace, shard = %shard.name, "namespace placed");
        Ok(shard)
    }

    /// Dropping a namespace no shard knows about is a no-op.
    pub async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        let shard = match self.route_for_drop(namespace).await {
            Ok(shard) => shard,
            Err(Error::ShardNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        shard.events.drop_namespace(namespace).await?;
        self.rebuild().await
    }

    /// Run `execute` against the owning shard. A `NamespaceNotFound` from the
    /// shard means the cached route is stale: rebuild once and retry.
    pub async fn route<F, Fut, T>(&self, namespace: &str, execute: F) -> Result<T>
    where
        F: Fn(Arc<dyn EventStore>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let shard = self.route_for_read(namespace).await?;
        match execute(shard.events.clone()).await {
            Err(err) if err.is_namespace_not_found() => {
                debug!(namespace, shard = %shard.name, "stale route, rebuilding");
                self.rebuild().await?;
                let owners = self.cached(namespace).unwrap_or_default();
                let shard = self.resolve(namespace, &owners)?;
                execute(shard.events.clone()).await
            }
            other => other,
        }
    }
}

/// [`EventStore`] spread over a set of shards.
#[derive(Clone)]
pub struct ShardedEvents {
    router: Arc<ShardRouter>,
}

impl ShardedEvents {
    pub fn new(router: Arc<ShardRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }
}

#[async_trait]
impl EventStore for ShardedEvents {
    async fn namespaces(&self) -> Result<Vec<String>> {
        self.router.rebuild().await?;
        let mut names: Vec<String> = self.router.table.load().owners.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create(&self, namespace: &str) -> Result<()> {
        self.router.create(namespace).await.map(|_| ())
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        self.router.drop_namespace(namespace).await
    }

    async fn store(&self, namespace: &str, events: &[Event]) -> Result<()> {
        self.router
            .route(namespace, |shard| async move { shard.store(namespace, events).await })
            .await
    }

    async fn get(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.router
            .route(&query.namespace, |shard| async move { shard.get(query).await })
            .await
    }

    async fn expire(&self, query: &EventQuery) -> Result<u64> {
        self.router
            .route(&query.namespace, |shard| async move { shard.expire(query).await })
            .await
    }

    async fn metadata_values(&self, query: &EventQuery, key: &str) -> Result<BTreeSet<String>> {
        self.router
            .route(&query.namespace, |shard| async move {
                shard.metadata_values(query, key).await
            })
            .await
    }
}

//! Eventide: a schema-flexible time-series event store on Postgres.

pub mod archive;
pub mod config;
mod ddl;
pub mod engine;
mod error;
pub mod event;
pub mod memory;
pub mod metrics;
pub mod naming;
pub mod pipeline;
pub mod query;
pub mod router;
pub mod schema;
pub mod store;
pub mod testing;

pub use archive::{Archiver, RestoreReport};
pub use config::{BackendKind, EngineConfig};
pub use engine::Engine;
pub use error::{Error, Result, WithContext};
pub use event::Event;
pub use memory::MemoryEvents;
pub use query::EventQuery;
pub use router::{Shard, ShardRouter, ShardedEvents};
pub use store::{ChunkedStore, EventStore, StoreBuilder};

pub mod prelude {
    pub use crate::{Engine, Event, EventQuery, EventStore, Result};
}

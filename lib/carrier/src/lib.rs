//! Content engine for workweave.
//!
//! The carrier moves data through a request's works:
//!
//! - **Contents**: Inputs, outputs and dependency rows grouped into maps
//! - **Dependencies**: A per-request graph from producer outputs to consumer inputs
//! - **Propagation**: Releasing inputs and failing unreachable outputs
//! - **Reconciliation**: Folding remote job reports back into outputs
//! - **Lifecycle**: Submitting, polling, syncing, aborting and resuming processings
//! - **Seams**: Storage, remote service, cache and event bus traits with in-memory versions

pub mod backend;
pub mod bus;
pub mod cache;
pub mod config;
pub mod content;
pub mod dependency;
pub mod envelope;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod io_map;
pub mod mapping;
pub mod nats;
pub mod propagation;
pub mod reconcile;
pub mod remote;
pub mod storage;
pub mod sync;

pub use backend::{BackendRegistry, BatchBackend, EventServiceBackend, ExecutionBackend};
pub use bus::{BusEvent, EventBus, EventKind, FileStatus, MemoryBus};
pub use cache::{Cache, MemoryCache};
pub use config::CarrierConfig;
pub use content::{
    Content, ContentExt, ContentMetadata, ContentRelationType, ContentStatus, ContentUpdate,
    ExternalId,
};
pub use dependency::DependencyMaps;
pub use envelope::{Envelope, RawEnvelope};
pub use error::{BusError, CacheError, CarrierError, RemoteError, StorageError};
pub use handler::{Carrier, HandleOutcome};
pub use io_map::{InputOutputMaps, IoMap};
pub use nats::{NatsConfig, NatsEventBus};
pub use remote::{EventRecord, JobInfo, RemoteClient, ScriptedRemote, TaskInfo, TaskParams};
pub use storage::{
    CollectionFilter, ContentFilter, MemoryStorage, ProcessingFilter, RequestRecord, RetryPolicy,
    Storage,
};

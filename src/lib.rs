// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod config;
pub mod dedupe;
pub mod freshness;
pub mod housekeeping;
pub mod merge;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod scheduler;
pub mod store;
pub mod vendor;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_app, router, AppState};
pub use crate::dedupe::compute_dedupe_key;
pub use crate::merge::{merge, CanonicalProduct, Offer, PricePoint};
pub use crate::queue::{EnqueueOutcome, QueueTask, TaskKey, TaskStatus, WorkQueue};
pub use crate::ratelimit::{LeaseError, LeaseParams, LeaseStep, RateLimiter};
pub use crate::store::MemStore;
pub use crate::vendor::{SourceRecord, VendorApi, VendorError};
pub use crate::worker::{IngestWorker, RunSummary};

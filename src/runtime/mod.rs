//! The pieces a controller is assembled from: informers that mirror the api server into local
//! stores, a work queue of object keys, and workers that drain it.

pub mod cache;
pub mod queue;
pub mod worker;

pub use cache::{object_key, split_key, wait_for_cache_sync, Delta, HasSynced, Informer, Reflector};
pub use queue::{RateLimit, WorkQueue};
pub use worker::{run_worker, MAX_RETRIES};

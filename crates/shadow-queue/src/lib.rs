//! Pending sync work: the coalescing request types, the pure merge
//! function over their cross-product, and the deduplicating blocking queue
//! that holds them.

pub mod merger;
pub mod queue;
pub mod request;

pub use merger::merge;
pub use queue::{QueueError, RequestQueue, DEFAULT_CAPACITY};
pub use request::SyncRequest;

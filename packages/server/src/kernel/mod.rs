// Kernel - core infrastructure for the job runtime.
//
// The kernel owns the durable job substrate (jobs/), the saga engine
// (saga/), the per-replica stream hub and the cross-replica bus. It holds
// no business logic: domain pipelines plug in through JobHandler and the
// JobApi.

pub mod bus;
pub mod deps;
pub mod jobs;
pub mod saga;
pub mod sse;
pub mod stream_hub;

pub use deps::ServerDeps;
pub use stream_hub::{SseMessage, StreamHub, Subscription};

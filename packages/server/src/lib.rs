// Learning platform backend - durable job execution core.
//
// This crate provides the persistent job-run substrate and its companion
// real-time fan-out bus: enqueue, claim under lease, drive handlers
// through a progress/pause/retry lifecycle, and surface every transition
// to subscribed users across replicas.
//
// Domain pipelines (course building, doc generation, ...) plug in as
// JobHandler implementations registered at process init.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;

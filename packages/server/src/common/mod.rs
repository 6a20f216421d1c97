// Shared helpers used across the kernel and server layers.

pub mod id;

pub use id::db_id;

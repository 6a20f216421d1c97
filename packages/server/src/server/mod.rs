// HTTP edge for the job runtime. Route registration only; all behavior
// lives in the kernel.

pub mod routes;

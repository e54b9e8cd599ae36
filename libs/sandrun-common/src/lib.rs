//! Types shared between the sandrun worker and the front ends that feed it.

pub mod runtime;
pub mod types;

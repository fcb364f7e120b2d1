//! Task manager daemon: configuration and the health/metrics HTTP endpoint.
//! The scheduler itself lives in `sift_lib::taskmanager`.

pub mod api;
pub mod config;

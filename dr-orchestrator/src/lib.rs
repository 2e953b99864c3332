//! Disaster-recovery orchestration for the platform's data services.
//!
//! Restores PostgreSQL, InfluxDB and Redis in sequence from their newest (or
//! explicitly chosen) artifacts, with workloads stopped around the restores.

pub mod error;
pub mod models;
pub mod services;

pub use error::{DrError, Result};

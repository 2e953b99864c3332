//! Platform backup library
//!
//! Encrypted, verified, retention-managed backups and restores for the
//! platform's PostgreSQL, InfluxDB and Redis instances.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod drivers;
pub mod executor;
pub mod fs;
pub mod health;
pub mod layout;
pub mod notify;
pub mod process;
pub mod remote;
pub mod restore;
pub mod retention;
pub mod secrets;
pub mod service;
pub mod utils;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use service::ServiceKind;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;

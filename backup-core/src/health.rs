//! TCP reachability probe for database endpoints.
//!
//! A successful probe only means something accepted the connection; it says
//! nothing about whether the database is ready to serve queries.

use std::time::Duration;
use tokio::net::TcpStream;

/// Default probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `host:port` and close again. Returns false on refusal, DNS
/// failure or timeout.
pub async fn health_check(host: &str, port: u16, timeout: Duration) -> bool {
    let addr = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            tracing::debug!(%addr, "Endpoint reachable");
            true
        }
        Ok(Err(e)) => {
            tracing::warn!(%addr, "Endpoint unreachable: {}", e);
            false
        }
        Err(_) => {
            tracing::warn!(%addr, "Endpoint probe timed out after {:?}", timeout);
            false
        }
    }
}

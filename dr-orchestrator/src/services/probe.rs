//! Post-recovery reachability probes.

use async_trait::async_trait;
use backup_core::health::{health_check, DEFAULT_PROBE_TIMEOUT};
use backup_core::{Config, ServiceKind};
use std::collections::HashMap;
use std::time::Duration;

/// Post-recovery reachability check of one service.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn reachable(&self, kind: ServiceKind) -> bool;
}

/// TCP connect against each configured endpoint.
pub struct TcpProbe {
    endpoints: HashMap<ServiceKind, (String, u16)>,
    timeout: Duration,
}

impl TcpProbe {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoints: ServiceKind::ALL
                .iter()
                .map(|&kind| (kind, config.endpoint(kind)))
                .collect(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

#[async_trait]
impl ServiceProbe for TcpProbe {
    async fn reachable(&self, kind: ServiceKind) -> bool {
        match self.endpoints.get(&kind) {
            Some((host, port)) => health_check(host, *port, self.timeout).await,
            None => false,
        }
    }
}

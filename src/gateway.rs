//! Shared gateway wiring: service registry, routing table, lifecycle
//! manager, upstream pool and TLS client config

use crate::config::{Config, LoggingConfig};
use crate::health::HealthProber;
use crate::manager::ServiceManager;
use crate::pool::{upstream_tls_config, PoolConfig, UpstreamPool};
use crate::router::{self, RoutingTable};
use crate::service::Service;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything the listeners, reaper and admin plane share
pub struct Gateway {
    pub services: HashMap<String, Arc<Service>>,
    pub router: RoutingTable,
    pub manager: Arc<ServiceManager>,
    pub pool: UpstreamPool,
    /// Client TLS config reused for wss upstream dialing
    pub tls: Arc<rustls::ClientConfig>,
    pub logging: LoggingConfig,
    pub max_body_bytes: usize,
}

impl Gateway {
    /// Wire up the gateway from a validated configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let tls = upstream_tls_config(config.verify_upstream_tls);

        let pool = UpstreamPool::new(
            PoolConfig {
                max_idle_per_host: config.pool.max_idle_per_host,
                idle_timeout: Duration::from_secs(config.pool.idle_timeout_secs),
            },
            tls.clone(),
        );
        let manager = ServiceManager::new(HealthProber::new(tls.clone()));
        let (services, router) = router::build_tables(config)?;

        Ok(Arc::new(Self {
            services,
            router,
            manager,
            pool,
            tls: Arc::new(tls),
            logging: config.logging,
            max_body_bytes: config.max_body_bytes,
        }))
    }

    /// Look up a service by name across the full registry
    pub fn service(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_builds_registry_and_tables() {
        let config: Config = toml::from_str(
            r#"
[services.app]
base = "http://127.0.0.1:9001"
host = "app.test"
port = 19080
proxy_only = true
"#,
        )
        .unwrap();
        config.validate().unwrap();

        let gateway = Gateway::from_config(&config).unwrap();
        assert!(gateway.service("app").is_some());
        assert!(gateway.service("missing").is_none());
        assert!(gateway.router.resolve_host("app.test").is_some());
        assert!(gateway.router.resolve_port(19080).is_some());
    }
}

//! Static routing table: hostname → route and bound port → route
//!
//! Built once at startup from the validated configuration. Each route
//! carries the owning service, the parsed target URL for that ingress, and
//! the scheme flag used for upstream dialing.

use crate::config::{parse_http_url, Config, HealthCheckConfig, RouteConfig};
use crate::service::{Commands, HealthCheck, Service};
use http::Uri;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Resolved route: owning service plus the upstream target for this ingress
#[derive(Clone, Debug)]
pub struct RouteTarget {
    pub service: Arc<Service>,
    pub target: Uri,
    /// True when the target scheme is https (wss for WebSocket upstreams)
    pub https: bool,
}

/// Hostname and port lookup tables shared by all listeners
#[derive(Debug)]
pub struct RoutingTable {
    hostnames: HashMap<String, RouteTarget>,
    ports: HashMap<u16, RouteTarget>,
}

impl RoutingTable {
    /// Resolve the route for a Host header value (port-stripped,
    /// case-insensitive)
    pub fn resolve_host(&self, host_header: &str) -> Option<&RouteTarget> {
        self.hostnames.get(&normalize_host(host_header))
    }

    /// Resolve the route pre-bound to a dedicated listener port
    pub fn resolve_port(&self, port: u16) -> Option<&RouteTarget> {
        self.ports.get(&port)
    }

    /// All port-bound routes, for listener binding at startup
    pub fn port_routes(&self) -> impl Iterator<Item = (u16, &RouteTarget)> {
        self.ports.iter().map(|(port, route)| (*port, route))
    }

    pub fn hostname_count(&self) -> usize {
        self.hostnames.len()
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

/// Strip the port and lowercase a Host header value
fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    // bracketed IPv6 literals keep their brackets, lose the port
    let host = if trimmed.starts_with('[') {
        match trimmed.find(']') {
            Some(end) => &trimmed[..=end],
            None => trimmed,
        }
    } else {
        trimmed.split(':').next().unwrap_or(trimmed)
    };
    host.to_ascii_lowercase()
}

/// Build the service registry and routing table from a validated config.
///
/// Performs the same collision validation as config loading so that
/// programmatically constructed configs cannot produce an ambiguous table.
pub fn build_tables(
    config: &Config,
) -> anyhow::Result<(HashMap<String, Arc<Service>>, RoutingTable)> {
    let mut services: HashMap<String, Arc<Service>> = HashMap::new();
    let mut hostnames: HashMap<String, RouteTarget> = HashMap::new();
    let mut ports: HashMap<u16, RouteTarget> = HashMap::new();

    for (name, service_config) in &config.services {
        let base = parse_http_url(&service_config.base)
            .map_err(|e| anyhow::anyhow!("service '{}': invalid base URL: {}", name, e))?;

        let commands = service_config.commands.as_ref().map(|c| Commands {
            start: c.start.clone(),
            stop: c.stop.clone(),
            check: c.check.clone(),
            cwd: c.cwd.as_ref().map(PathBuf::from),
            env: c.env.clone(),
        });
        if commands.is_none() && !service_config.proxy_only {
            anyhow::bail!("service '{}': 'commands' is required unless 'proxy_only' is set", name);
        }

        let health = build_health_check(&service_config.health_check)
            .map_err(|e| anyhow::anyhow!("service '{}': {}", name, e))?;

        let service = Arc::new(Service::new(
            name.clone(),
            base.clone(),
            commands,
            health,
            service_config.idle_timeout(),
            service_config.start_timeout(),
            service_config.proxy_only,
        ));
        services.insert(name.clone(), Arc::clone(&service));

        for route in service_config.resolved_routes(name) {
            let (target_raw, identity) = match &route {
                RouteConfig::Host { value, target } => (target.clone(), Identity::Host(value.clone())),
                RouteConfig::Port { value, target } => (target.clone(), Identity::Port(*value)),
            };
            let target = match target_raw {
                Some(raw) => parse_http_url(&raw)
                    .map_err(|e| anyhow::anyhow!("service '{}': invalid route target: {}", name, e))?,
                None => base.clone(),
            };
            let https = target.scheme_str() == Some("https");
            let route_target = RouteTarget {
                service: Arc::clone(&service),
                target,
                https,
            };

            match identity {
                Identity::Host(value) => {
                    let normalized = normalize_host(&value);
                    if normalized.is_empty() {
                        anyhow::bail!("service '{}': route hostname is empty", name);
                    }
                    if hostnames.insert(normalized.clone(), route_target).is_some() {
                        anyhow::bail!("hostname '{}' is routed to more than one service", normalized);
                    }
                }
                Identity::Port(port) => {
                    if port == 0 {
                        anyhow::bail!("service '{}': route port must be greater than 0", name);
                    }
                    if port == config.port {
                        anyhow::bail!(
                            "service '{}': route port {} collides with the main listener port",
                            name,
                            port
                        );
                    }
                    if config.admin.enabled && port == config.admin.port {
                        anyhow::bail!(
                            "service '{}': route port {} collides with the admin port",
                            name,
                            port
                        );
                    }
                    if ports.insert(port, route_target).is_some() {
                        anyhow::bail!("port {} is routed to more than one service", port);
                    }
                }
            }
        }
    }

    Ok((services, RoutingTable { hostnames, ports }))
}

enum Identity {
    Host(String),
    Port(u16),
}

fn build_health_check(config: &HealthCheckConfig) -> Result<HealthCheck, String> {
    const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
    Ok(match config {
        HealthCheckConfig::Tcp => HealthCheck::Tcp,
        HealthCheckConfig::Http {
            url,
            expected_status,
            timeout_secs,
        } => HealthCheck::Http {
            url: match url {
                Some(raw) => Some(parse_http_url(raw)?),
                None => None,
            },
            expected_status: expected_status.unwrap_or(200),
            timeout: timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        },
        HealthCheckConfig::Command {
            command,
            timeout_secs,
        } => HealthCheck::Command {
            command: command.clone(),
            timeout: timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        },
        HealthCheckConfig::None => HealthCheck::None,
    })
}

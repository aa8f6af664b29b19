//! Gateway configuration loading and validation

use http::Uri;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Bind address for the main listener (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the main hostname-routed listener (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Configured services, keyed by name
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,

    /// Admin API settings (disabled by default)
    #[serde(default)]
    pub admin: AdminConfig,

    /// Optional request/websocket/performance logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Upstream connection pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Cap on the buffered inbound request body (default: 64 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Verify upstream TLS certificates (default: false, for loopback
    /// deployments with self-signed upstreams)
    #[serde(default)]
    pub verify_upstream_tls: bool,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            services: HashMap::new(),
            admin: AdminConfig::default(),
            logging: LoggingConfig::default(),
            pool: PoolSettings::default(),
            max_body_bytes: default_max_body_bytes(),
            verify_upstream_tls: false,
            pid_file: None,
        }
    }
}

/// Configuration for a single service
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Canonical upstream base URL for the backend
    pub base: String,

    /// Hostname route for this service (in addition to `routes`)
    pub host: Option<String>,

    /// Dedicated listener port route for this service
    pub port: Option<u16>,

    /// Additional ingress routes
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Seconds without traffic and active connections before stopping
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Upper bound in seconds on start + health gating
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Lifecycle shell commands (required unless `proxy_only`)
    pub commands: Option<CommandsConfig>,

    /// Readiness probe (default: tcp connect to the upstream)
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Assume the service is always on; never start, stop or reap it
    #[serde(default)]
    pub proxy_only: bool,
}

/// Lifecycle shell commands for a service
#[derive(Debug, Deserialize, Clone)]
pub struct CommandsConfig {
    pub start: String,
    pub stop: String,
    pub check: String,
    /// Working directory for the commands
    pub cwd: Option<String>,
    /// Environment overlay for the commands
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Readiness probe variants
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckConfig {
    /// TCP connect to the upstream host and port
    #[default]
    Tcp,
    /// HTTP GET; healthy when the status matches
    Http {
        /// Probe URL (default: the service's `base`)
        url: Option<String>,
        /// Expected status code (default: 200)
        expected_status: Option<u16>,
        /// Per-probe timeout in seconds (default: 5)
        timeout_secs: Option<u64>,
    },
    /// Shell command; healthy on exit code 0
    Command {
        command: String,
        /// Per-probe timeout in seconds (default: 5)
        timeout_secs: Option<u64>,
    },
    /// Always healthy
    None,
}

/// An ingress route: a hostname or a dedicated listener port
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RouteConfig {
    Host {
        value: String,
        /// Upstream URL for this ingress (default: the service's `base`)
        target: Option<String>,
    },
    Port {
        value: u16,
        target: Option<String>,
    },
}

/// Admin API settings
#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_admin_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Bearer token required for all admin endpoints when set
    pub auth_token: Option<String>,

    /// Allowed client IPs (exact addresses or CIDR ranges); empty allows all
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_admin_port(),
            host: default_host(),
            auth_token: None,
            allowed_ips: Vec::new(),
        }
    }
}

/// Optional logging toggles
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enable_request_log: bool,
    #[serde(default)]
    pub enable_websocket_log: bool,
    #[serde(default)]
    pub enable_performance_log: bool,
}

/// Upstream connection pool settings
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 30)
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    /// All ingress routes for this service: the explicit `routes` list plus
    /// the `host`/`port` shorthands; a service with none of those routes by
    /// its map key as a hostname.
    pub fn resolved_routes(&self, key: &str) -> Vec<RouteConfig> {
        let mut routes = self.routes.clone();
        if let Some(ref host) = self.host {
            routes.push(RouteConfig::Host {
                value: host.clone(),
                target: None,
            });
        }
        if let Some(port) = self.port {
            routes.push(RouteConfig::Port {
                value: port,
                target: None,
            });
        }
        if routes.is_empty() {
            routes.push(RouteConfig::Host {
                value: key.to_string(),
                target: None,
            });
        }
        routes
    }

    fn validate(&self, name: &str, errors: &mut Vec<String>) {
        match parse_http_url(&self.base) {
            Ok(_) => {}
            Err(e) => errors.push(format!("service '{}': invalid base URL '{}': {}", name, self.base, e)),
        }

        if !self.proxy_only && self.commands.is_none() {
            errors.push(format!(
                "service '{}': 'commands' is required unless 'proxy_only' is set",
                name
            ));
        }

        match &self.health_check {
            HealthCheckConfig::Http { url: Some(url), .. } => {
                if let Err(e) = parse_http_url(url) {
                    errors.push(format!(
                        "service '{}': invalid health check URL '{}': {}",
                        name, url, e
                    ));
                }
            }
            HealthCheckConfig::Command { command, .. } => {
                if command.trim().is_empty() {
                    errors.push(format!("service '{}': health check command is empty", name));
                }
            }
            _ => {}
        }

        for route in self.resolved_routes(name) {
            match &route {
                RouteConfig::Host { value, target } => {
                    if value.trim().is_empty() {
                        errors.push(format!("service '{}': route hostname is empty", name));
                    }
                    if let Some(target) = target {
                        if let Err(e) = parse_http_url(target) {
                            errors.push(format!(
                                "service '{}': invalid route target '{}': {}",
                                name, target, e
                            ));
                        }
                    }
                }
                RouteConfig::Port { value, target } => {
                    if *value == 0 {
                        errors.push(format!("service '{}': route port must be greater than 0", name));
                    }
                    if let Some(target) = target {
                        if let Err(e) = parse_http_url(target) {
                            errors.push(format!(
                                "service '{}': invalid route target '{}': {}",
                                name, target, e
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// Parse and sanity-check an upstream URL
pub fn parse_http_url(raw: &str) -> Result<Uri, String> {
    let uri: Uri = raw.parse().map_err(|e| format!("{}", e))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        Some(other) => return Err(format!("unsupported scheme '{}'", other)),
        None => return Err("missing scheme".to_string()),
    }
    if uri.host().is_none() {
        return Err("missing host".to_string());
    }
    Ok(uri)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, collecting every error before failing
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.services.is_empty() {
            errors.push("at least one service must be configured".to_string());
        }

        for (name, service) in &self.services {
            service.validate(name, &mut errors);
        }

        // route identity collisions across all services
        let mut hostnames: HashSet<String> = HashSet::new();
        let mut ports: HashSet<u16> = HashSet::new();
        for (name, service) in &self.services {
            for route in service.resolved_routes(name) {
                match route {
                    RouteConfig::Host { value, .. } => {
                        let normalized = value.trim().to_ascii_lowercase();
                        if !normalized.is_empty() && !hostnames.insert(normalized.clone()) {
                            errors.push(format!("hostname '{}' is routed to more than one service", normalized));
                        }
                    }
                    RouteConfig::Port { value, .. } => {
                        if value == 0 {
                            continue;
                        }
                        if value == self.port {
                            errors.push(format!(
                                "service '{}': route port {} collides with the main listener port",
                                name, value
                            ));
                        }
                        if self.admin.enabled && value == self.admin.port {
                            errors.push(format!(
                                "service '{}': route port {} collides with the admin port",
                                name, value
                            ));
                        }
                        if !ports.insert(value) {
                            errors.push(format!("port {} is routed to more than one service", value));
                        }
                    }
                }
            }
        }

        for entry in &self.admin.allowed_ips {
            if parse_ip_entry(entry).is_err() {
                errors.push(format!("admin: invalid allowed_ips entry '{}'", entry));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Parse an allowlist entry as either a CIDR range or a single IP
pub fn parse_ip_entry(entry: &str) -> Result<(), String> {
    let trimmed = entry.trim();
    if trimmed.contains('/') {
        trimmed
            .parse::<ipnet::IpNet>()
            .map(|_| ())
            .map_err(|e| format!("{}", e))
    } else {
        trimmed
            .parse::<std::net::IpAddr>()
            .map(|_| ())
            .map_err(|e| format!("{}", e))
    }
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_admin_port() -> u16 {
    3100
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_start_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    30
}

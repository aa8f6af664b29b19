//! Service descriptors and per-service runtime state
//!
//! Each configured service owns an immutable descriptor (upstream URL,
//! lifecycle commands, timeouts) plus a small mutable runtime record shared
//! by every request handler and the idle reaper. Composite transitions go
//! through the mutex; the active-connection counter is a plain atomic.

use http::Uri;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Not running; the next request triggers a start
    Offline,
    /// Start command issued, waiting for the health gate
    Starting,
    /// Reachable and receiving traffic
    Online,
    /// Stop command in progress
    Stopping,
}

/// User-supplied lifecycle shell commands
#[derive(Debug, Clone)]
pub struct Commands {
    pub start: String,
    pub stop: String,
    pub check: String,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// How readiness of a started service is established
#[derive(Debug, Clone)]
pub enum HealthCheck {
    /// TCP connect to the upstream host and port
    Tcp,
    /// HTTP GET matched against an expected status
    Http {
        url: Option<Uri>,
        expected_status: u16,
        timeout: Duration,
    },
    /// Shell command whose exit code 0 means healthy
    Command { command: String, timeout: Duration },
    /// Always healthy
    None,
}

impl HealthCheck {
    pub fn kind(&self) -> &'static str {
        match self {
            HealthCheck::Tcp => "tcp",
            HealthCheck::Http { .. } => "http",
            HealthCheck::Command { .. } => "command",
            HealthCheck::None => "none",
        }
    }
}

#[derive(Debug)]
struct Runtime {
    status: ServiceStatus,
    last_access: Instant,
    last_access_wall: SystemTime,
    started_at: Option<Instant>,
    start_count: u64,
    total_uptime: Duration,
}

/// A configured service: immutable descriptor plus shared runtime state
#[derive(Debug)]
pub struct Service {
    pub name: String,
    pub upstream: Uri,
    pub commands: Option<Commands>,
    pub health: HealthCheck,
    pub idle_timeout: Duration,
    pub start_timeout: Duration,
    pub proxy_only: bool,
    runtime: Mutex<Runtime>,
    active: AtomicUsize,
}

/// Point-in-time copy of a service's runtime state
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub status: ServiceStatus,
    pub active_connections: usize,
    /// Duration of the current online interval (zero when not online)
    pub uptime: Duration,
    pub last_access: SystemTime,
    pub start_count: u64,
    pub total_uptime: Duration,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        upstream: Uri,
        commands: Option<Commands>,
        health: HealthCheck,
        idle_timeout: Duration,
        start_timeout: Duration,
        proxy_only: bool,
    ) -> Self {
        let now = Instant::now();
        let runtime = Runtime {
            // proxy-only services are born online and never transition
            status: if proxy_only {
                ServiceStatus::Online
            } else {
                ServiceStatus::Offline
            },
            last_access: now,
            last_access_wall: SystemTime::now(),
            started_at: proxy_only.then(Instant::now),
            start_count: 0,
            total_uptime: Duration::ZERO,
        };
        Self {
            name,
            upstream,
            commands,
            health,
            idle_timeout,
            start_timeout,
            proxy_only,
            runtime: Mutex::new(runtime),
            active: AtomicUsize::new(0),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.runtime.lock().status
    }

    /// Record traffic for this service
    pub fn touch(&self) {
        let mut rt = self.runtime.lock();
        rt.last_access = Instant::now();
        rt.last_access_wall = SystemTime::now();
    }

    /// Time since the last recorded traffic
    pub fn idle_for(&self) -> Duration {
        self.runtime.lock().last_access.elapsed()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn start_count(&self) -> u64 {
        self.runtime.lock().start_count
    }

    /// offline → starting. False when another path got there first.
    pub fn begin_start(&self) -> bool {
        let mut rt = self.runtime.lock();
        if rt.status == ServiceStatus::Offline {
            rt.status = ServiceStatus::Starting;
            true
        } else {
            false
        }
    }

    /// starting → online (on success) or starting → offline (on failure)
    pub fn finish_start(&self, ok: bool) {
        let mut rt = self.runtime.lock();
        if rt.status != ServiceStatus::Starting {
            return;
        }
        if ok {
            rt.status = ServiceStatus::Online;
            rt.started_at = Some(Instant::now());
            rt.start_count += 1;
        } else {
            rt.status = ServiceStatus::Offline;
        }
    }

    /// online → stopping, folding the completed interval into total uptime
    pub fn begin_stop(&self) -> bool {
        let mut rt = self.runtime.lock();
        if rt.status != ServiceStatus::Online {
            return false;
        }
        rt.status = ServiceStatus::Stopping;
        if let Some(started) = rt.started_at.take() {
            rt.total_uptime += started.elapsed();
        }
        true
    }

    /// Idle-reap variant of [`begin_stop`]: only transitions when there are
    /// no active connections and the idle window has elapsed, so a request
    /// landing between the sweep's scan and the transition wins.
    pub fn begin_stop_if_idle(&self) -> bool {
        let mut rt = self.runtime.lock();
        if rt.status != ServiceStatus::Online {
            return false;
        }
        if self.active.load(Ordering::SeqCst) > 0 {
            return false;
        }
        if rt.last_access.elapsed() <= self.idle_timeout {
            return false;
        }
        rt.status = ServiceStatus::Stopping;
        if let Some(started) = rt.started_at.take() {
            rt.total_uptime += started.elapsed();
        }
        true
    }

    /// stopping → offline
    pub fn finish_stop(&self) {
        let mut rt = self.runtime.lock();
        if rt.status == ServiceStatus::Stopping {
            rt.status = ServiceStatus::Offline;
        }
    }

    /// Shutdown path: force the descriptor offline regardless of state
    pub fn force_offline(&self) {
        let mut rt = self.runtime.lock();
        if let Some(started) = rt.started_at.take() {
            rt.total_uptime += started.elapsed();
        }
        rt.status = ServiceStatus::Offline;
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let rt = self.runtime.lock();
        ServiceSnapshot {
            status: rt.status,
            active_connections: self.active.load(Ordering::SeqCst),
            uptime: rt.started_at.map(|s| s.elapsed()).unwrap_or(Duration::ZERO),
            last_access: rt.last_access_wall,
            start_count: rt.start_count,
            total_uptime: rt.total_uptime,
        }
    }

    /// Count an in-flight stream against this service. The returned guard
    /// decrements exactly once when dropped, on any termination path.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            service: Arc::clone(self),
        }
    }
}

/// One-shot guard for the active-connection counter
pub struct ConnectionGuard {
    service: Arc<Service>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.service.active.fetch_sub(1, Ordering::SeqCst);
        // the idle window starts after the last stream ends
        self.service.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service(proxy_only: bool) -> Arc<Service> {
        Arc::new(Service::new(
            "svc".to_string(),
            "http://127.0.0.1:9001".parse().unwrap(),
            Some(Commands {
                start: "true".to_string(),
                stop: "true".to_string(),
                check: "true".to_string(),
                cwd: None,
                env: HashMap::new(),
            }),
            HealthCheck::None,
            Duration::from_secs(300),
            Duration::from_secs(30),
            proxy_only,
        ))
    }

    #[test]
    fn test_initial_status() {
        assert_eq!(test_service(false).status(), ServiceStatus::Offline);
        assert_eq!(test_service(true).status(), ServiceStatus::Online);
    }

    #[test]
    fn test_start_transitions() {
        let svc = test_service(false);
        assert!(svc.begin_start());
        assert_eq!(svc.status(), ServiceStatus::Starting);
        // only one start may be in flight
        assert!(!svc.begin_start());

        svc.finish_start(true);
        assert_eq!(svc.status(), ServiceStatus::Online);
        assert_eq!(svc.start_count(), 1);
    }

    #[test]
    fn test_failed_start_returns_offline() {
        let svc = test_service(false);
        assert!(svc.begin_start());
        svc.finish_start(false);
        assert_eq!(svc.status(), ServiceStatus::Offline);
        assert_eq!(svc.start_count(), 0);
    }

    #[test]
    fn test_stop_transitions_only_from_online() {
        let svc = test_service(false);
        assert!(!svc.begin_stop());

        assert!(svc.begin_start());
        svc.finish_start(true);
        assert!(svc.begin_stop());
        assert_eq!(svc.status(), ServiceStatus::Stopping);
        svc.finish_stop();
        assert_eq!(svc.status(), ServiceStatus::Offline);
    }

    #[test]
    fn test_uptime_accumulates_on_stop() {
        let svc = test_service(false);
        assert!(svc.begin_start());
        svc.finish_start(true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(svc.begin_stop());
        svc.finish_stop();
        let snap = svc.snapshot();
        assert!(snap.total_uptime >= Duration::from_millis(20));
        assert_eq!(snap.uptime, Duration::ZERO);
    }

    #[test]
    fn test_connection_guard_decrements_once() {
        let svc = test_service(false);
        assert_eq!(svc.active_connections(), 0);
        let g1 = svc.acquire();
        let g2 = svc.acquire();
        assert_eq!(svc.active_connections(), 2);
        drop(g1);
        assert_eq!(svc.active_connections(), 1);
        drop(g2);
        assert_eq!(svc.active_connections(), 0);
    }

    #[test]
    fn test_begin_stop_if_idle_requires_zero_active() {
        let svc = Arc::new(Service::new(
            "svc".to_string(),
            "http://127.0.0.1:9001".parse().unwrap(),
            None,
            HealthCheck::None,
            Duration::ZERO,
            Duration::from_secs(30),
            false,
        ));
        assert!(svc.begin_start());
        svc.finish_start(true);
        std::thread::sleep(Duration::from_millis(10));

        let guard = svc.acquire();
        assert!(!svc.begin_stop_if_idle());
        drop(guard);

        // guard drop touched last_access; wait past the (zero) idle window
        std::thread::sleep(Duration::from_millis(10));
        assert!(svc.begin_stop_if_idle());
    }

    #[test]
    fn test_touch_updates_idle() {
        let svc = test_service(false);
        std::thread::sleep(Duration::from_millis(15));
        assert!(svc.idle_for() >= Duration::from_millis(15));
        svc.touch();
        assert!(svc.idle_for() < Duration::from_millis(15));
    }
}

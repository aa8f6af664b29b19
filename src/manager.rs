//! Service lifecycle management: single-flight start, stop, and the
//! per-service state machine driven by inbound requests
//!
//! Concurrent requests for the same offline service share one start: the
//! first caller installs a broadcast sentinel and runs the start command
//! plus health gate in a detached task; every other caller subscribes and
//! observes the same outcome. The sentinel is removed on every exit path so
//! the next request after a failure retries cleanly.

use crate::command::{CommandExecutor, ExecOptions};
use crate::error::{GatewayError, GatewayErrorCode};
use crate::health::HealthProber;
use crate::service::{Service, ServiceStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Hard cap on waiting for a stopping service to reach offline
const STOPPING_WAIT_CAP: Duration = Duration::from_secs(30);

/// Poll interval while waiting out a stop
const STOPPING_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Backoff when a start sentinel race needs re-evaluation
const START_RACE_DELAY: Duration = Duration::from_millis(50);

/// Shared outcome of a single-flighted start
#[derive(Debug, Clone)]
enum StartOutcome {
    Ready,
    Failed(GatewayErrorCode, Arc<str>),
}

/// Owns start/stop/check of all services
pub struct ServiceManager {
    executor: CommandExecutor,
    prober: HealthProber,
    /// In-flight starts keyed by service name
    starts: DashMap<String, broadcast::Sender<StartOutcome>>,
}

impl ServiceManager {
    pub fn new(prober: HealthProber) -> Arc<Self> {
        Arc::new(Self {
            executor: CommandExecutor::new(),
            prober,
            starts: DashMap::new(),
        })
    }

    /// Run the service's check command; true when it reports running
    pub async fn is_running(&self, service: &Service) -> bool {
        match &service.commands {
            Some(commands) => {
                let opts = ExecOptions {
                    cwd: commands.cwd.clone(),
                    env: commands.env.clone(),
                    timeout: None,
                };
                self.executor.check(&commands.check, &opts).await
            }
            None => true,
        }
    }

    /// Drive the service to online on behalf of an inbound request.
    ///
    /// Touches last-access before any blocking work, then walks the state
    /// machine: offline triggers a start, starting joins the in-flight
    /// start, stopping waits out the stop (bounded) and then starts.
    pub async fn ensure_online(self: &Arc<Self>, service: &Arc<Service>) -> Result<(), GatewayError> {
        service.touch();
        if service.proxy_only {
            return Ok(());
        }
        loop {
            match service.status() {
                ServiceStatus::Online => return Ok(()),
                ServiceStatus::Offline | ServiceStatus::Starting => {
                    self.start(service).await?;
                }
                ServiceStatus::Stopping => {
                    self.wait_while_stopping(service).await?;
                }
            }
        }
    }

    /// Start the service, single-flighted by name. Concurrent callers share
    /// one execution of the start command and all observe its outcome.
    pub async fn start(self: &Arc<Self>, service: &Arc<Service>) -> Result<(), GatewayError> {
        loop {
            if service.status() == ServiceStatus::Online {
                return Ok(());
            }

            // join an in-flight start when present, otherwise lead one
            let lead = match self.starts.entry(service.name.clone()) {
                Entry::Occupied(entry) => Err(entry.get().subscribe()),
                Entry::Vacant(slot) => {
                    let (tx, rx) = broadcast::channel(4);
                    slot.insert(tx.clone());
                    Ok((tx, rx))
                }
            };

            let mut rx = match lead {
                Err(rx) => rx,
                Ok((tx, rx)) => {
                    if !service.begin_start() {
                        // lost the race against another transition
                        self.starts.remove(&service.name);
                        if service.status() == ServiceStatus::Online {
                            let _ = tx.send(StartOutcome::Ready);
                            return Ok(());
                        }
                        drop(tx);
                        tokio::time::sleep(START_RACE_DELAY).await;
                        continue;
                    }

                    // detached so a client abort cannot cancel the start;
                    // its effects belong to future requests
                    let manager = Arc::clone(self);
                    let svc = Arc::clone(service);
                    tokio::spawn(async move {
                        let outcome = match manager.run_start(&svc).await {
                            Ok(()) => {
                                svc.finish_start(true);
                                info!(service = %svc.name, "service is online");
                                StartOutcome::Ready
                            }
                            Err(e) => {
                                svc.finish_start(false);
                                warn!(service = %svc.name, error = %e, "service start failed");
                                StartOutcome::Failed(e.code, Arc::from(e.message.as_str()))
                            }
                        };
                        manager.starts.remove(&svc.name);
                        let _ = tx.send(outcome);
                    });
                    rx
                }
            };

            match rx.recv().await {
                Ok(StartOutcome::Ready) => return Ok(()),
                Ok(StartOutcome::Failed(code, message)) => {
                    return Err(GatewayError::new(code, message.to_string()));
                }
                // sender vanished without an outcome; re-evaluate the state
                Err(_) => continue,
            }
        }
    }

    /// Leader body: run the start command, then health-gate. Bounded overall
    /// by the service's start timeout.
    async fn run_start(&self, service: &Arc<Service>) -> Result<(), GatewayError> {
        let commands = service.commands.as_ref().ok_or_else(|| {
            GatewayError::new(
                GatewayErrorCode::StartFailed,
                format!("service '{}' has no start command", service.name),
            )
        })?;

        let deadline = Instant::now() + service.start_timeout;
        info!(service = %service.name, command = %commands.start, "starting service");

        let opts = ExecOptions {
            cwd: commands.cwd.clone(),
            env: commands.env.clone(),
            timeout: Some(service.start_timeout),
        };
        let output = self.executor.run(&commands.start, &opts).await;
        if !output.success() {
            return Err(GatewayError::new(
                GatewayErrorCode::StartFailed,
                format!(
                    "start command for '{}' exited with {}: {}",
                    service.name,
                    output.exit_code,
                    output.summary()
                ),
            ));
        }

        self.prober.wait_healthy(service, deadline).await
    }

    /// Poll a stopping service until it reaches offline, bounded by the
    /// 30 s hard cap
    async fn wait_while_stopping(&self, service: &Service) -> Result<(), GatewayError> {
        let deadline = Instant::now() + STOPPING_WAIT_CAP;
        while service.status() == ServiceStatus::Stopping {
            if Instant::now() >= deadline {
                return Err(GatewayError::new(
                    GatewayErrorCode::StopTimeout,
                    format!("timed out waiting for service '{}' to stop", service.name),
                ));
            }
            tokio::time::sleep(STOPPING_POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Stop an online service. Best-effort: a failing stop command is
    /// logged and the descriptor still reaches offline so retries work.
    pub async fn stop(&self, service: &Arc<Service>) -> bool {
        if !service.begin_stop() {
            return false;
        }
        self.run_stop(service).await;
        true
    }

    /// Idle-reap entry point: stops the service only when it is online with
    /// zero active connections past its idle window.
    pub async fn reap(&self, service: &Arc<Service>) -> bool {
        if !service.begin_stop_if_idle() {
            return false;
        }
        self.run_stop(service).await;
        true
    }

    async fn run_stop(&self, service: &Arc<Service>) {
        if let Some(commands) = &service.commands {
            info!(service = %service.name, command = %commands.stop, "stopping service");
            let opts = ExecOptions {
                cwd: commands.cwd.clone(),
                env: commands.env.clone(),
                timeout: None,
            };
            let output = self.executor.run(&commands.stop, &opts).await;
            if !output.success() {
                error!(
                    service = %service.name,
                    exit_code = output.exit_code,
                    output = %output.summary(),
                    "stop command failed"
                );
            }
        }
        service.finish_stop();
        debug!(service = %service.name, "service is offline");
    }

    /// Graceful shutdown: stop every non-proxy-only service that is online
    /// or starting, concurrently and best-effort.
    pub async fn stop_all<'a>(self: &Arc<Self>, services: impl Iterator<Item = &'a Arc<Service>>) {
        let mut tasks = Vec::new();
        for service in services {
            if service.proxy_only {
                continue;
            }
            match service.status() {
                ServiceStatus::Online => {
                    let manager = Arc::clone(self);
                    let svc = Arc::clone(service);
                    tasks.push(tokio::spawn(async move {
                        manager.stop(&svc).await;
                    }));
                }
                ServiceStatus::Starting => {
                    let manager = Arc::clone(self);
                    let svc = Arc::clone(service);
                    tasks.push(tokio::spawn(async move {
                        if let Some(commands) = &svc.commands {
                            let opts = ExecOptions {
                                cwd: commands.cwd.clone(),
                                env: commands.env.clone(),
                                timeout: None,
                            };
                            let _ = manager.executor.run(&commands.stop, &opts).await;
                        }
                        svc.force_offline();
                    }));
                }
                _ => {}
            }
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

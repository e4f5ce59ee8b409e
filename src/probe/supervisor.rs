//! Supervision loop for a launched instance.
//!
//! Schedules liveness probes on the declared interval, feeds outcomes to the
//! health monitor, and watches the service process itself. Probe ticks never
//! overlap: a slow probe delays the next tick rather than stacking attempts.
//! The loop ends with a terminal verdict — the instance went unhealthy, the
//! process exited on its own, or a shutdown signal arrived.

use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};

use crate::image::HealthcheckSpec;
use crate::runtime::Instance;

use super::check::Prober;
use super::monitor::{HealthMonitor, HealthState};

/// Why supervision ended.
#[derive(Debug)]
pub enum SupervisorVerdict {
    /// Consecutive post-grace probe failures reached the threshold. The
    /// orchestrator owns what happens next (restart, replacement).
    Unhealthy,
    /// The service process exited on its own
    ProcessExited(Option<ExitStatus>),
    /// SIGTERM or ctrl-c
    ShutdownRequested,
}

/// Probes one instance until a terminal verdict.
pub struct Supervisor<P: Prober> {
    prober: P,
    monitor: HealthMonitor,
    interval: Duration,
}

impl<P: Prober> Supervisor<P> {
    pub fn new(prober: P, spec: &HealthcheckSpec) -> Self {
        Self {
            prober,
            monitor: HealthMonitor::from_spec(spec),
            interval: Duration::from_secs(spec.interval_seconds),
        }
    }

    /// Supervise a launched instance, stopping its process when supervision
    /// ends on an unhealthy verdict or a shutdown signal.
    pub async fn run(mut self, instance: &mut Instance) -> SupervisorVerdict {
        let verdict = self.supervise(instance.wait()).await;

        match &verdict {
            SupervisorVerdict::Unhealthy | SupervisorVerdict::ShutdownRequested => {
                if let Err(e) = instance.stop().await {
                    tracing::warn!(error = %e, "Failed to stop service process");
                }
            }
            SupervisorVerdict::ProcessExited(_) => {}
        }

        verdict
    }

    /// Core loop over any process-exit future, so supervision can also cover
    /// a process managed elsewhere.
    pub async fn supervise<F>(&mut self, process_exit: F) -> SupervisorVerdict
    where
        F: Future<Output = io::Result<ExitStatus>>,
    {
        let started = Instant::now();

        // First probe one interval after start; ticks delay rather than stack
        let mut ticker = time::interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            state = ?self.monitor.state(),
            interval_secs = self.interval.as_secs(),
            "Supervision started"
        );

        let shutdown = shutdown_signal();
        tokio::pin!(process_exit, shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, ending supervision");
                    return SupervisorVerdict::ShutdownRequested;
                }

                result = &mut process_exit => {
                    let status = match result {
                        Ok(status) => {
                            tracing::error!(%status, "Service process exited");
                            Some(status)
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Lost track of service process");
                            None
                        }
                    };
                    return SupervisorVerdict::ProcessExited(status);
                }

                _ = ticker.tick() => {
                    let outcome = self.prober.check().await;
                    let passed = outcome.is_pass();

                    if let Some(next) = self.monitor.observe(passed, started.elapsed()) {
                        tracing::info!(
                            state = ?next,
                            consecutive_failures = self.monitor.consecutive_failures(),
                            "Instance health changed"
                        );
                        if next == HealthState::Unhealthy {
                            return SupervisorVerdict::Unhealthy;
                        }
                    } else if !passed {
                        tracing::warn!(
                            state = ?self.monitor.state(),
                            consecutive_failures = self.monitor.consecutive_failures(),
                            "Probe failed"
                        );
                    }
                }
            }
        }
    }
}

/// Resolves when SIGTERM (unix) or ctrl-c is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

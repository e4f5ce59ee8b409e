//! Liveness probing and instance supervision.
//!
//! A probe is one HTTP GET against the instance's health endpoint; the health
//! monitor folds probe outcomes into an explicit STARTING/HEALTHY/UNHEALTHY
//! state machine; the supervisor schedules probes on a fixed interval and
//! watches the service process until a terminal verdict.

mod check;
mod monitor;
mod supervisor;

pub use check::{HttpProber, ProbeOutcome, Prober};
pub use monitor::{HealthMonitor, HealthState};
pub use supervisor::{Supervisor, SupervisorVerdict};

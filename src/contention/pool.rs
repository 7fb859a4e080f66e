//! Stress pool for the workload modulation variant.
//!
//! Keeps K workload instances running until a deadline:
//! - each member replaces its instance as soon as it exits
//! - at the deadline every live instance is killed and reaped
//! - kills reach the instance's whole process group

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::workload::{Workload, kill_group, reap};
use crate::models::{ContendError, Result};

/// What one `hold` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HoldReport {
    /// Workload instances started
    pub launches: usize,
    /// Members that could not start any instance
    pub spawn_failures: usize,
}

/// Fixed-size pool of concurrently running workload instances.
#[derive(Debug, Clone)]
pub struct StressPool {
    workload: Arc<Workload>,
    size: usize,
}

impl StressPool {
    pub fn new(workload: Arc<Workload>, size: usize) -> Self {
        Self {
            workload,
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Keep the pool saturated for `budget`, then tear it down.
    ///
    /// Fails only if no member could start a single instance.
    pub async fn hold(&self, budget: Duration) -> Result<HoldReport> {
        let deadline = tokio::time::Instant::now() + budget;
        let mut members = JoinSet::new();
        for slot in 0..self.size {
            let workload = Arc::clone(&self.workload);
            members.spawn(run_member(workload, slot, deadline));
        }

        let mut report = HoldReport::default();
        let mut last_error = None;
        while let Some(joined) = members.join_next().await {
            match joined {
                Ok(Ok(launches)) => report.launches += launches,
                Ok(Err(e)) => {
                    report.spawn_failures += 1;
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(ContendError::Internal(format!("pool member panicked: {e}")));
                }
            }
        }

        match last_error {
            Some(e) if report.launches == 0 => Err(e),
            Some(e) => {
                warn!(error = %e, failures = report.spawn_failures, "Pool ran degraded");
                Ok(report)
            }
            None => Ok(report),
        }
    }
}

/// One pool member: respawn on exit until the deadline, then kill and reap.
async fn run_member(
    workload: Arc<Workload>,
    member: usize,
    deadline: tokio::time::Instant,
) -> Result<usize> {
    let mut launches = 0;
    while tokio::time::Instant::now() < deadline {
        let mut child = match workload.spawn_silent() {
            Ok(c) => c,
            Err(e) if launches == 0 => return Err(e),
            Err(e) => {
                warn!(member, error = %e, "Respawn failed; member idles until deadline");
                tokio::time::sleep_until(deadline).await;
                break;
            }
        };
        launches += 1;
        let group = child.id();

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep_until(deadline) => None,
        };
        match exited {
            Some(status) => {
                kill_group(group);
                debug!(member, status = ?status.ok(), "Workload exited; replacing");
            }
            None => {
                reap(&mut child).await;
                break;
            }
        }
    }
    Ok(launches)
}

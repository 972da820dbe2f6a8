//! Farm status aggregation from task listings.

use bf_core::{FarmConfig, FarmStatus, FleetCounts, TaskBackend, TaskStatus};
use tracing::debug;

use crate::error::ReconcileResult;

/// Computes [`FarmStatus`] snapshots. Read-only; nothing is cached.
pub struct FarmStatusService<'a, B: ?Sized> {
    backend: &'a B,
    cluster: &'a str,
    server_family: String,
    worker_family: String,
}

impl<'a, B: TaskBackend + ?Sized> FarmStatusService<'a, B> {
    /// Fails when the farm has no cluster yet.
    pub fn new(backend: &'a B, config: &'a FarmConfig) -> ReconcileResult<Self> {
        Ok(Self {
            backend,
            cluster: config.cluster()?,
            server_family: config.server_family(),
            worker_family: config.worker_family(),
        })
    }

    pub fn status(&self) -> ReconcileResult<FarmStatus> {
        let (servers, server_ip) = self.fleet(&self.server_family, true)?;
        let (workers, _) = self.fleet(&self.worker_family, false)?;
        let status = FarmStatus::new(servers, workers, server_ip);
        debug!(?status, "farm status computed");
        Ok(status)
    }

    /// Count one family. Running-intent and stopped tasks come from two
    /// separate listings; pending is whatever was listed but not running.
    fn fleet(&self, family: &str, resolve_ip: bool) -> ReconcileResult<(FleetCounts, Option<String>)> {
        let listed = self
            .backend
            .list_tasks(self.cluster, family, TaskStatus::Running)?;
        let details = if listed.is_empty() {
            Vec::new()
        } else {
            self.backend.describe_tasks(self.cluster, &listed)?
        };

        let mut running = 0u32;
        let mut ip = None;
        for task in details.iter().filter(|t| t.is_running()) {
            running += 1;
            if resolve_ip && ip.is_none() {
                ip = self
                    .backend
                    .network_of(&task.task_id)?
                    .map(|net| net.public_ip);
            }
        }

        let stopped = self
            .backend
            .list_tasks(self.cluster, family, TaskStatus::Stopped)?
            .len() as u32;
        let pending = (listed.len() as u32).saturating_sub(running);
        Ok((
            FleetCounts {
                stopped,
                pending,
                running,
            },
            ip,
        ))
    }
}

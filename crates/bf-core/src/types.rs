//! Domain types for the build farm.
//!
//! These types travel over the control API as JSON, so their serialized
//! shape is part of the wire contract: absent addresses are encoded as
//! the `"NULL"` sentinel string, outcomes as their bare variant names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::StackDescriptor;

/// Port the build server listens on for remote execution requests.
pub const SERVICE_PORT: u16 = 8098;

/// Wire encoding of "no address".
pub const NULL_SENTINEL: &str = "NULL";

/// Scheme-less DNS name baked into the server certificate.
pub const SERVER_TLS_NAME: &str = "buildfarm-server";

/// Worker floor used by `connect` when the caller names none.
pub const DEFAULT_WORKER_COUNT: u32 = 2;

// ── Replica policy ─────────────────────────────────────────────────

/// Allowed replica-count interval for one stack.
///
/// A missing bound means "unbounded on that side".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicaPolicy {
    pub lower: Option<u32>,
    pub upper: Option<u32>,
    /// Issue an update even when the count already matches.
    pub force: bool,
}

impl ReplicaPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn exactly(count: u32) -> Self {
        Self {
            lower: Some(count),
            upper: Some(count),
            force: false,
        }
    }

    pub fn at_least(count: u32) -> Self {
        Self {
            lower: Some(count),
            ..Self::default()
        }
    }

    pub fn at_most(count: u32) -> Self {
        Self {
            upper: Some(count),
            ..Self::default()
        }
    }

    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Build a policy from raw bounds where `-1` (or any negative value)
    /// means unbounded.
    pub fn from_sentinels(lower: i64, upper: i64, force: bool) -> Self {
        let bound = |v: i64| u32::try_from(v).ok();
        Self {
            lower: bound(lower),
            upper: bound(upper),
            force,
        }
    }

    /// Clamp an observed count into the allowed interval.
    ///
    /// The lower bound is checked first, so an inverted interval resolves
    /// to `lower` for small counts.
    pub fn desired_count(&self, current: u32) -> u32 {
        if let Some(lower) = self.lower
            && current < lower
        {
            return lower;
        }
        if let Some(upper) = self.upper
            && current > upper
        {
            return upper;
        }
        current
    }
}

// ── Stack state ────────────────────────────────────────────────────

/// Transition state of a compute stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    /// No stack exists yet.
    Missing,
    /// A change is in flight.
    Updating,
    /// No change in flight.
    Stable,
}

impl StackState {
    pub fn of(descriptor: Option<&StackDescriptor>) -> Self {
        match descriptor {
            None => StackState::Missing,
            Some(desc) if desc.is_complete() => StackState::Stable,
            Some(_) => StackState::Updating,
        }
    }
}

/// Result of reconciling one stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    UpToDate,
    AlreadyUpdating,
    Creating,
    Updating,
    WaitingForPrecondition,
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileOutcome::UpToDate => "UpToDate",
            ReconcileOutcome::AlreadyUpdating => "AlreadyUpdating",
            ReconcileOutcome::Creating => "Creating",
            ReconcileOutcome::Updating => "Updating",
            ReconcileOutcome::WaitingForPrecondition => "WaitingForPrecondition",
        };
        f.write_str(s)
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Lifecycle status of a container task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Stopped,
}

/// Observed details of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task_id: String,
    pub family: String,
    /// What the task is actually doing.
    pub last_status: TaskStatus,
    /// What the orchestrator wants it to do.
    pub desired_status: TaskStatus,
}

impl TaskDetail {
    pub fn is_running(&self) -> bool {
        self.last_status == TaskStatus::Running
    }
}

/// Public network association of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub public_ip: String,
    pub public_dns_name: String,
}

// ── Farm status ────────────────────────────────────────────────────

/// Task counts for one fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FleetCounts {
    pub stopped: u32,
    pub pending: u32,
    pub running: u32,
}

/// Snapshot of the whole farm, recomputed on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmStatus {
    pub stopped_servers: u32,
    pub pending_servers: u32,
    pub running_servers: u32,
    pub stopped_workers: u32,
    pub pending_workers: u32,
    pub running_workers: u32,
    #[serde(with = "null_sentinel")]
    pub remote_executor: Option<String>,
    #[serde(with = "null_sentinel")]
    pub server_ip: Option<String>,
}

impl FarmStatus {
    /// Assemble a snapshot; the executor address is derived from the
    /// server IP and [`SERVICE_PORT`].
    pub fn new(servers: FleetCounts, workers: FleetCounts, server_ip: Option<String>) -> Self {
        let remote_executor = server_ip
            .as_ref()
            .map(|ip| format!("{ip}:{SERVICE_PORT}"));
        Self {
            stopped_servers: servers.stopped,
            pending_servers: servers.pending,
            running_servers: servers.running,
            stopped_workers: workers.stopped,
            pending_workers: workers.pending,
            running_workers: workers.running,
            remote_executor,
            server_ip,
        }
    }
}

/// Farm snapshot plus the per-stack outcomes of a scaling request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleReport {
    #[serde(flatten)]
    pub status: FarmStatus,
    pub server_status: ReconcileOutcome,
    pub workers_status: ReconcileOutcome,
}

impl ScaleReport {
    /// Whether the farm is usable: a reachable server, at least one
    /// running worker, and both stacks up to date.
    pub fn is_converged(&self) -> bool {
        self.status.remote_executor.is_some()
            && self.status.running_workers > 0
            && self.server_status == ReconcileOutcome::UpToDate
            && self.workers_status == ReconcileOutcome::UpToDate
    }
}

/// Body of the `connect` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: ScaleReport,
    #[serde(default)]
    pub auth_info: Option<AuthInfo>,
}

// ── Credentials ────────────────────────────────────────────────────

/// Client-side TLS material handed to the build wrapper (PEM contents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    /// CA certificate used to verify the server.
    pub tls_certificate: String,
    pub tls_client_certificate: String,
    pub tls_client_key: String,
}

/// Full credential set used to template servers and workers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub ca_crt: String,
    pub client_crt: String,
    pub client_pkcs8_key: String,
    pub server_crt: String,
    pub server_pkcs8_key: String,
}

impl CredentialBundle {
    pub fn client_auth_info(&self) -> AuthInfo {
        AuthInfo {
            tls_certificate: self.ca_crt.clone(),
            tls_client_certificate: self.client_crt.clone(),
            tls_client_key: self.client_pkcs8_key.clone(),
        }
    }
}

/// Serde adapter mapping `None` to the `"NULL"` sentinel string.
mod null_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::NULL_SENTINEL;

    pub fn serialize<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(value.as_deref().unwrap_or(NULL_SENTINEL))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw = String::deserialize(d)?;
        Ok((raw != NULL_SENTINEL).then_some(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_count_clamps_into_interval() {
        for lower in 0..6 {
            for upper in lower..8 {
                let policy = ReplicaPolicy::from_sentinels(lower, upper, false);
                for current in 0..12 {
                    let desired = policy.desired_count(current);
                    assert!(
                        (lower as u32..=upper as u32).contains(&desired),
                        "{current} in [{lower}, {upper}] gave {desired}"
                    );
                }
            }
        }
    }

    #[test]
    fn negative_sentinel_means_unbounded() {
        let policy = ReplicaPolicy::from_sentinels(-1, -1, false);
        assert_eq!(policy, ReplicaPolicy::unbounded());
        assert_eq!(policy.desired_count(42), 42);

        let policy = ReplicaPolicy::from_sentinels(3, -1, false);
        assert_eq!(policy.desired_count(1), 3);
        assert_eq!(policy.desired_count(100), 100);

        let policy = ReplicaPolicy::from_sentinels(-1, 2, false);
        assert_eq!(policy.desired_count(0), 0);
        assert_eq!(policy.desired_count(9), 2);
    }

    #[test]
    fn stack_state_from_status_suffix() {
        let desc = |status: &str| StackDescriptor {
            name: "s".to_string(),
            status: status.to_string(),
            ..StackDescriptor::default()
        };
        assert_eq!(StackState::of(None), StackState::Missing);
        assert_eq!(StackState::of(Some(&desc("CREATE_COMPLETE"))), StackState::Stable);
        assert_eq!(StackState::of(Some(&desc("UPDATE_COMPLETE"))), StackState::Stable);
        assert_eq!(
            StackState::of(Some(&desc("CREATE_IN_PROGRESS"))),
            StackState::Updating
        );
    }

    #[test]
    fn farm_status_uses_null_sentinel_on_the_wire() {
        let status = FarmStatus::new(FleetCounts::default(), FleetCounts::default(), None);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["server_ip"], "NULL");
        assert_eq!(json["remote_executor"], "NULL");

        let back: FarmStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back.server_ip, None);
    }

    #[test]
    fn farm_status_derives_executor_address() {
        let status = FarmStatus::new(
            FleetCounts { stopped: 0, pending: 0, running: 1 },
            FleetCounts::default(),
            Some("1.2.3.4".to_string()),
        );
        assert_eq!(status.remote_executor.as_deref(), Some("1.2.3.4:8098"));
    }

    #[test]
    fn scale_report_is_flat_on_the_wire() {
        let report = ScaleReport {
            status: FarmStatus::new(FleetCounts::default(), FleetCounts::default(), None),
            server_status: ReconcileOutcome::Creating,
            workers_status: ReconcileOutcome::WaitingForPrecondition,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["server_status"], "Creating");
        assert_eq!(json["workers_status"], "WaitingForPrecondition");
        assert_eq!(json["running_workers"], 0);
    }

    #[test]
    fn converged_requires_every_condition() {
        let ready = FarmStatus::new(
            FleetCounts { stopped: 0, pending: 0, running: 1 },
            FleetCounts { stopped: 0, pending: 0, running: 2 },
            Some("10.0.0.1".to_string()),
        );
        let mut report = ScaleReport {
            status: ready,
            server_status: ReconcileOutcome::UpToDate,
            workers_status: ReconcileOutcome::UpToDate,
        };
        assert!(report.is_converged());

        report.workers_status = ReconcileOutcome::Updating;
        assert!(!report.is_converged());

        report.workers_status = ReconcileOutcome::UpToDate;
        report.status.running_workers = 0;
        assert!(!report.is_converged());

        report.status.running_workers = 2;
        report.status.remote_executor = None;
        assert!(!report.is_converged());
    }
}

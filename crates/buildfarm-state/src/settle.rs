//! Orchestrator simulation that drives stored state forward.
//!
//! Each [`StateStore::settle`] call is one tick, applied atomically:
//!
//! 1. Stacks with an operation in flight finish it. Creates and updates
//!    become `*_COMPLETE` with their outputs resolved; deletes stop the
//!    stack's tasks and remove the record.
//! 2. Stable fleet stacks converge on their `InstanceDesiredCount`:
//!    surplus tasks (newest first) are stopped, `PENDING` tasks start
//!    `RUNNING`, and missing tasks are launched as `PENDING`.
//!
//! Tasks stopped longer ago than the store's retention are removed first.
//!
//! A fresh fleet therefore needs three ticks to report running tasks.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bf_core::{Network, TaskStatus};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::{StateResult, map_err};
use crate::store::{JsonTable, StateStore, all_json, next_sequence, put_json};
use crate::tables::{STACKS, TASKS};
use crate::template::{CLUSTER_OUTPUT, CLUSTER_STACK_PARAMETER, Template};
use crate::types::*;

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub completed: Vec<String>,
    pub deleted: Vec<String>,
    pub launched: u32,
    pub started: u32,
    pub stopped: u32,
    pub pruned: u32,
}

impl SettleReport {
    pub fn is_idle(&self) -> bool {
        self.completed.is_empty()
            && self.deleted.is_empty()
            && self.launched == 0
            && self.started == 0
            && self.stopped == 0
            && self.pruned == 0
    }
}

impl StateStore {
    /// Advance every stack and fleet by one tick.
    pub fn settle(&self) -> StateResult<SettleReport> {
        let now_ms = unix_millis();
        let retention_ms = self.stopped_retention.as_millis() as u64;
        let report = self.transact(|txn| -> StateResult<SettleReport> {
            let mut stacks = txn.open_table(STACKS).map_err(map_err!(Table))?;
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let all_stacks: Vec<StackRecord> = all_json(&stacks)?;
            let mut report = SettleReport::default();
            let (expired, all_tasks): (Vec<TaskRecord>, Vec<TaskRecord>) =
                all_json::<TaskRecord, _>(&tasks)?
                    .into_iter()
                    .partition(|task| task.expired(now_ms, retention_ms));
            for task in expired {
                tasks.remove(task.task_id.as_str()).map_err(map_err!(Write))?;
                debug!(task = %task.task_id, family = %task.family, "stopped task pruned");
                report.pruned += 1;
            }

            let clusters: BTreeMap<String, String> = all_stacks
                .iter()
                .filter_map(|s| {
                    s.outputs
                        .get(CLUSTER_OUTPUT)
                        .map(|c| (s.name.clone(), c.clone()))
                })
                .collect();

            for mut stack in all_stacks {
                let owned: Vec<TaskRecord> = all_tasks
                    .iter()
                    .filter(|t| t.stack == stack.name)
                    .cloned()
                    .collect();

                let status = stack.status.clone();
                match status.as_str() {
                    DELETE_IN_PROGRESS => {
                        for mut task in owned {
                            if task.desired_status != TaskStatus::Stopped {
                                task.stop(now_ms);
                                put_json(&mut tasks, &task.task_id, &task)?;
                                report.stopped += 1;
                            }
                        }
                        stacks.remove(stack.name.as_str()).map_err(map_err!(Write))?;
                        info!(stack = %stack.name, "stack deleted");
                        report.deleted.push(stack.name);
                    }
                    CREATE_IN_PROGRESS | UPDATE_IN_PROGRESS => {
                        let template = parse(&stack)?;
                        stack.outputs = template.resolve_outputs(&stack.name, &stack.parameters);
                        stack.status = if status == CREATE_IN_PROGRESS {
                            CREATE_COMPLETE.to_string()
                        } else {
                            UPDATE_COMPLETE.to_string()
                        };
                        put_json(&mut stacks, &stack.name, &stack)?;
                        info!(stack = %stack.name, status = %stack.status, "stack settled");
                        report.completed.push(stack.name);
                    }
                    _ => {
                        let template = parse(&stack)?;
                        if let Some(family) = template.task_family(&stack.name) {
                            let fleet = Fleet {
                                stack: &stack,
                                family,
                                cluster: cluster_of(&stack, &clusters),
                                public: template.metadata.build_farm.public_network,
                            };
                            fleet.converge(txn, &mut tasks, owned, now_ms, &mut report)?;
                        }
                    }
                }
            }
            Ok(report)
        })?;
        if !report.is_idle() {
            debug!(?report, "settle tick applied");
        }
        Ok(report)
    }
}

fn parse(stack: &StackRecord) -> StateResult<Template> {
    Template::parse(&stack.template_body).map_err(map_err!(Deserialize))
}

/// Cluster named by the fleet's `StackName` parameter, resolved through
/// that stack's `ClusterName` output when it has one.
fn cluster_of(stack: &StackRecord, clusters: &BTreeMap<String, String>) -> String {
    match stack.parameters.get(CLUSTER_STACK_PARAMETER) {
        Some(owner) => clusters.get(owner).cloned().unwrap_or_else(|| owner.clone()),
        None => stack.name.clone(),
    }
}

struct Fleet<'a> {
    stack: &'a StackRecord,
    family: String,
    cluster: String,
    public: bool,
}

impl Fleet<'_> {
    fn converge(
        &self,
        txn: &redb::WriteTransaction,
        tasks: &mut JsonTable<'_>,
        owned: Vec<TaskRecord>,
        now_ms: u64,
        report: &mut SettleReport,
    ) -> StateResult<()> {
        let desired = Template::desired_count(&self.stack.parameters) as usize;
        let mut active: Vec<TaskRecord> = owned
            .into_iter()
            .filter(|t| t.desired_status == TaskStatus::Running)
            .collect();
        active.sort_by_key(|t| t.sequence);

        while active.len() > desired {
            let Some(mut task) = active.pop() else { break };
            task.stop(now_ms);
            put_json(tasks, &task.task_id, &task)?;
            info!(task = %task.task_id, family = %self.family, "task stopped");
            report.stopped += 1;
        }

        for mut task in active.iter().cloned() {
            if task.last_status == TaskStatus::Pending {
                task.last_status = TaskStatus::Running;
                if self.public {
                    task.network = Some(network_for(task.sequence));
                }
                put_json(tasks, &task.task_id, &task)?;
                debug!(task = %task.task_id, family = %self.family, "task running");
                report.started += 1;
            }
        }

        for _ in active.len()..desired {
            let sequence = next_sequence(txn, "tasks")?;
            let task = TaskRecord {
                task_id: format!("task-{sequence:08}"),
                cluster: self.cluster.clone(),
                family: self.family.clone(),
                stack: self.stack.name.clone(),
                last_status: TaskStatus::Pending,
                desired_status: TaskStatus::Running,
                network: None,
                sequence,
                stopped_at_ms: None,
            };
            put_json(tasks, &task.task_id, &task)?;
            info!(task = %task.task_id, family = %self.family, cluster = %self.cluster, "task launched");
            report.launched += 1;
        }
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn network_for(sequence: u64) -> Network {
    let (hi, lo) = ((sequence >> 8) & 0xff, sequence & 0xff);
    Network {
        public_ip: format!("10.0.{hi}.{lo}"),
        public_dns_name: format!("ip-10-0-{hi}-{lo}.compute.internal"),
    }
}

impl StateStore {
    /// Settle every `interval` until `shutdown` changes.
    pub async fn run_settle_loop(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "settle loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.settle() {
                        Ok(report) if !report.is_idle() => info!(?report, "state settled"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "settle tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("settle loop shutting down");
                    break;
                }
            }
        }
    }
}

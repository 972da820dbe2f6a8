//! Records persisted by the state store.

use std::collections::BTreeMap;

use bf_core::{Network, StackDescriptor, TaskDetail, TaskStatus};
use serde::{Deserialize, Serialize};

pub const CREATE_IN_PROGRESS: &str = "CREATE_IN_PROGRESS";
pub const CREATE_COMPLETE: &str = "CREATE_COMPLETE";
pub const UPDATE_IN_PROGRESS: &str = "UPDATE_IN_PROGRESS";
pub const UPDATE_COMPLETE: &str = "UPDATE_COMPLETE";
pub const DELETE_IN_PROGRESS: &str = "DELETE_IN_PROGRESS";

/// A stack as stored, including the template it was last applied with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRecord {
    pub name: String,
    pub status: String,
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl StackRecord {
    pub fn descriptor(&self) -> StackDescriptor {
        StackDescriptor {
            name: self.name.clone(),
            status: self.status.clone(),
            parameters: self.parameters.clone(),
            outputs: self.outputs.clone(),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.ends_with("_IN_PROGRESS")
    }
}

/// A container task launched on behalf of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub cluster: String,
    pub family: String,
    /// Stack that owns the task.
    pub stack: String,
    pub last_status: TaskStatus,
    pub desired_status: TaskStatus,
    #[serde(default)]
    pub network: Option<Network>,
    /// Launch sequence number; higher is newer.
    pub sequence: u64,
    /// Unix time in milliseconds at which the task was stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at_ms: Option<u64>,
}

impl TaskRecord {
    pub fn detail(&self) -> TaskDetail {
        TaskDetail {
            task_id: self.task_id.clone(),
            family: self.family.clone(),
            last_status: self.last_status,
            desired_status: self.desired_status,
        }
    }

    pub fn stop(&mut self, now_ms: u64) {
        self.desired_status = TaskStatus::Stopped;
        self.last_status = TaskStatus::Stopped;
        self.network = None;
        self.stopped_at_ms = Some(now_ms);
    }

    /// Whether the task was stopped at least `retention_ms` before `now_ms`.
    pub fn expired(&self, now_ms: u64, retention_ms: u64) -> bool {
        self.stopped_at_ms
            .is_some_and(|stopped| now_ms.saturating_sub(stopped) >= retention_ms)
    }
}

/// Current version of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub body: Vec<u8>,
    pub sha256_digest: String,
    pub version_id: String,
}

pub fn object_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

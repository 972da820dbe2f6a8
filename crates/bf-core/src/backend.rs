//! Infrastructure backend capabilities.
//!
//! The control plane only ever talks to infrastructure through these
//! three traits. Implementations are injected at construction time:
//! the daemon runs against `buildfarm-state`, tests against fakes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{Network, TaskDetail, TaskStatus};

/// Parameter carrying the replica count of a compute stack.
pub const DESIRED_COUNT_PARAMETER: &str = "InstanceDesiredCount";

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Failures reported by an infrastructure backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("stack {0} does not exist")]
    StackNotFound(String),

    #[error("stack {0} already exists")]
    AlreadyExists(String),

    #[error("stack {stack} is in {status} state and cannot be modified")]
    InProgress { stack: String, status: String },

    #[error("template validation error: {0}")]
    Validation(String),

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("backend fault: {0}")]
    Fault(String),
}

/// Backend-provided record describing a stack.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StackDescriptor {
    pub name: String,
    /// Status string such as `CREATE_IN_PROGRESS` or `UPDATE_COMPLETE`.
    pub status: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl StackDescriptor {
    /// Whether no operation is pending on the stack.
    pub fn is_complete(&self) -> bool {
        self.status.ends_with("_COMPLETE")
    }
}

/// Arguments of a create or update call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRequest {
    pub stack_name: String,
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
}

impl StackRequest {
    /// Request for a compute stack: the desired count is always passed as
    /// [`DESIRED_COUNT_PARAMETER`] alongside the caller's parameters.
    pub fn with_desired_count(
        stack_name: &str,
        template_body: &str,
        desired_count: u32,
        parameters: &BTreeMap<String, String>,
    ) -> Self {
        let mut all = parameters.clone();
        all.insert(DESIRED_COUNT_PARAMETER.to_string(), desired_count.to_string());
        Self {
            stack_name: stack_name.to_string(),
            template_body: template_body.to_string(),
            parameters: all,
        }
    }

    /// Request for a stack without a replica count (e.g. shared infra).
    pub fn plain(
        stack_name: &str,
        template_body: &str,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            stack_name: stack_name.to_string(),
            template_body: template_body.to_string(),
            parameters,
        }
    }
}

/// Outcome of a successful update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A change is now in flight.
    Updated,
    /// Template and parameters already matched; nothing was started.
    NoChange,
}

/// Declarative stack control plane.
pub trait StackBackend {
    /// Describe a stack, or `None` when it does not exist.
    fn describe_stack(&self, name: &str) -> BackendResult<Option<StackDescriptor>>;

    fn create_stack(&self, request: &StackRequest) -> BackendResult<()>;

    fn update_stack(&self, request: &StackRequest) -> BackendResult<UpdateOutcome>;

    /// Start deleting a stack. Deleting a missing stack succeeds.
    fn delete_stack(&self, name: &str) -> BackendResult<()>;
}

/// Container task listing.
pub trait TaskBackend {
    /// IDs of the tasks of `family` whose desired status is `desired`.
    fn list_tasks(
        &self,
        cluster: &str,
        family: &str,
        desired: TaskStatus,
    ) -> BackendResult<Vec<String>>;

    fn describe_tasks(&self, cluster: &str, task_ids: &[String]) -> BackendResult<Vec<TaskDetail>>;

    /// Public network association of a task, if it has one.
    fn network_of(&self, task_id: &str) -> BackendResult<Option<Network>>;
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHead {
    pub version_id: String,
    pub sha256_digest: Option<String>,
}

/// Versioned object storage.
pub trait ObjectStore {
    fn get_object(&self, bucket: &str, key: &str) -> BackendResult<Vec<u8>>;

    fn head_object(&self, bucket: &str, key: &str) -> BackendResult<Option<ObjectHead>>;

    /// Store a new version and return its version id.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        sha256_digest: &str,
    ) -> BackendResult<String>;
}

/// Everything the control plane needs from one backend.
pub trait CloudBackend: StackBackend + TaskBackend + ObjectStore + Send + Sync {}

impl<T> CloudBackend for T where T: StackBackend + TaskBackend + ObjectStore + Send + Sync {}

/// Hex-encoded SHA-256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Put an object only if its digest differs from the stored one.
///
/// Returns the version id of the current (possibly pre-existing) object.
pub fn maybe_put_object<S: ObjectStore + ?Sized>(
    store: &S,
    bucket: &str,
    key: &str,
    content: &[u8],
) -> BackendResult<String> {
    let next_digest = sha256_hex(content);
    match store.head_object(bucket, key)? {
        Some(head) if head.sha256_digest.as_deref() == Some(next_digest.as_str()) => {
            debug!(%bucket, %key, digest = %next_digest, "object up-to-date");
            return Ok(head.version_id);
        }
        Some(head) => {
            info!(
                %bucket,
                %key,
                current = head.sha256_digest.as_deref().unwrap_or("<none>"),
                next = %next_digest,
                "object digest changed"
            );
        }
        None => info!(%bucket, %key, "no previous object version"),
    }
    store.put_object(bucket, key, content, &next_digest)
}

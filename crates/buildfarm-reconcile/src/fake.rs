//! Scripted in-process backend that records every stack call.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bf_core::{
    BackendError, BackendResult, Network, ObjectHead, ObjectStore, StackBackend,
    StackDescriptor, StackRequest, TaskBackend, TaskDetail, TaskStatus, UpdateOutcome,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Describe(String),
    Create(StackRequest),
    Update(StackRequest),
    Delete(String),
}

#[derive(Default)]
pub struct FakeState {
    pub stacks: BTreeMap<String, StackDescriptor>,
    pub calls: Vec<Call>,
    /// `Some(NoChange)` makes every update a no-op.
    pub update_outcome: Option<UpdateOutcome>,
    /// Error returned by the next create or update.
    pub fail_next: Option<BackendError>,
    /// In-flight stacks complete (and deleting stacks vanish) once described.
    pub auto_settle: bool,
    /// Deletes rejected as in progress before they are accepted.
    pub delete_conflicts: u32,
    pub listed: Vec<(String, TaskStatus, Vec<String>)>,
    pub details: BTreeMap<String, TaskDetail>,
    pub networks: BTreeMap<String, Network>,
    pub objects: BTreeMap<(String, String), Vec<u8>>,
}

#[derive(Default)]
pub struct FakeBackend {
    pub state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.lock());
        self
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn add_stack(&self, name: &str, status: &str) {
        self.lock().stacks.insert(
            name.to_string(),
            StackDescriptor {
                name: name.to_string(),
                status: status.to_string(),
                ..StackDescriptor::default()
            },
        );
    }

    /// Script one task: listed under `desired`, observed as `last`.
    pub fn add_task(
        &self,
        family: &str,
        id: &str,
        desired: TaskStatus,
        last: TaskStatus,
        ip: Option<&str>,
    ) {
        let mut state = self.lock();
        match state
            .listed
            .iter_mut()
            .find(|(f, d, _)| f == family && *d == desired)
        {
            Some((_, _, ids)) => ids.push(id.to_string()),
            None => state
                .listed
                .push((family.to_string(), desired, vec![id.to_string()])),
        }
        state.details.insert(
            id.to_string(),
            TaskDetail {
                task_id: id.to_string(),
                family: family.to_string(),
                last_status: last,
                desired_status: desired,
            },
        );
        if let Some(ip) = ip {
            state.networks.insert(
                id.to_string(),
                Network {
                    public_ip: ip.to_string(),
                    public_dns_name: format!("{id}.example"),
                },
            );
        }
    }
}

impl StackBackend for FakeBackend {
    fn describe_stack(&self, name: &str) -> BackendResult<Option<StackDescriptor>> {
        let mut state = self.lock();
        state.calls.push(Call::Describe(name.to_string()));
        let current = state.stacks.get(name).cloned();
        if state.auto_settle
            && let Some(desc) = &current
        {
            if desc.status == "DELETE_IN_PROGRESS" {
                state.stacks.remove(name);
            } else if let Some(stack) = state.stacks.get_mut(name) {
                stack.status = stack.status.replace("_IN_PROGRESS", "_COMPLETE");
                stack
                    .outputs
                    .insert("ClusterName".to_string(), format!("{name}-cluster"));
            }
        }
        Ok(current)
    }

    fn create_stack(&self, request: &StackRequest) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Create(request.clone()));
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state.stacks.insert(
            request.stack_name.clone(),
            StackDescriptor {
                name: request.stack_name.clone(),
                status: "CREATE_IN_PROGRESS".to_string(),
                parameters: request.parameters.clone(),
                outputs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn update_stack(&self, request: &StackRequest) -> BackendResult<UpdateOutcome> {
        let mut state = self.lock();
        state.calls.push(Call::Update(request.clone()));
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if state.update_outcome == Some(UpdateOutcome::NoChange) {
            return Ok(UpdateOutcome::NoChange);
        }
        let Some(stack) = state.stacks.get_mut(&request.stack_name) else {
            return Err(BackendError::StackNotFound(request.stack_name.clone()));
        };
        stack.status = "UPDATE_IN_PROGRESS".to_string();
        stack.parameters = request.parameters.clone();
        Ok(UpdateOutcome::Updated)
    }

    fn delete_stack(&self, name: &str) -> BackendResult<()> {
        let mut state = self.lock();
        state.calls.push(Call::Delete(name.to_string()));
        if state.delete_conflicts > 0 {
            state.delete_conflicts -= 1;
            return Err(BackendError::InProgress {
                stack: name.to_string(),
                status: "UPDATE_IN_PROGRESS".to_string(),
            });
        }
        if let Some(stack) = state.stacks.get_mut(name) {
            stack.status = "DELETE_IN_PROGRESS".to_string();
        }
        Ok(())
    }
}

impl TaskBackend for FakeBackend {
    fn list_tasks(
        &self,
        _cluster: &str,
        family: &str,
        desired: TaskStatus,
    ) -> BackendResult<Vec<String>> {
        Ok(self
            .lock()
            .listed
            .iter()
            .find(|(f, d, _)| f == family && *d == desired)
            .map(|(_, _, ids)| ids.clone())
            .unwrap_or_default())
    }

    fn describe_tasks(&self, _cluster: &str, task_ids: &[String]) -> BackendResult<Vec<TaskDetail>> {
        let state = self.lock();
        Ok(task_ids
            .iter()
            .filter_map(|id| state.details.get(id).cloned())
            .collect())
    }

    fn network_of(&self, task_id: &str) -> BackendResult<Option<Network>> {
        Ok(self.lock().networks.get(task_id).cloned())
    }
}

impl ObjectStore for FakeBackend {
    fn get_object(&self, bucket: &str, key: &str) -> BackendResult<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn head_object(&self, _bucket: &str, _key: &str) -> BackendResult<Option<ObjectHead>> {
        Ok(None)
    }

    fn put_object(&self, bucket: &str, key: &str, body: &[u8], _: &str) -> BackendResult<String> {
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), body.to_vec());
        Ok("v1".to_string())
    }
}

//! `bf-core` backend capabilities implemented over the state store.
//!
//! Mutations check the current record and write the new one inside a
//! single transaction, so concurrent callers observe the same conflict
//! errors an external control plane would report.

use bf_core::{
    BackendError, BackendResult, Network, ObjectHead, ObjectStore, StackBackend,
    StackDescriptor, StackRequest, TaskBackend, TaskDetail, TaskStatus, UpdateOutcome,
};
use tracing::{debug, info};

use crate::error::map_err;
use crate::store::{StateStore, get_json, next_sequence, put_json};
use crate::tables::{OBJECTS, STACKS};
use crate::template::Template;
use crate::types::*;

impl StackBackend for StateStore {
    fn describe_stack(&self, name: &str) -> BackendResult<Option<StackDescriptor>> {
        Ok(self.get_stack(name)?.map(|record| record.descriptor()))
    }

    fn create_stack(&self, request: &StackRequest) -> BackendResult<()> {
        let template = Template::parse(&request.template_body)?;
        template.check_parameters(&request.parameters)?;
        self.transact(|txn| -> BackendResult<()> {
            let mut table = txn.open_table(STACKS).map_err(map_err!(Table))?;
            if get_json::<StackRecord, _>(&table, &request.stack_name)?.is_some() {
                return Err(BackendError::AlreadyExists(request.stack_name.clone()));
            }
            let record = StackRecord {
                name: request.stack_name.clone(),
                status: CREATE_IN_PROGRESS.to_string(),
                template_body: request.template_body.clone(),
                parameters: request.parameters.clone(),
                outputs: Default::default(),
            };
            put_json(&mut table, &record.name, &record)?;
            Ok(())
        })?;
        info!(stack = %request.stack_name, "stack create started");
        Ok(())
    }

    fn update_stack(&self, request: &StackRequest) -> BackendResult<UpdateOutcome> {
        let template = Template::parse(&request.template_body)?;
        template.check_parameters(&request.parameters)?;
        let outcome = self.transact(|txn| -> BackendResult<UpdateOutcome> {
            let mut table = txn.open_table(STACKS).map_err(map_err!(Table))?;
            let Some(mut record) = get_json::<StackRecord, _>(&table, &request.stack_name)? else {
                return Err(BackendError::StackNotFound(request.stack_name.clone()));
            };
            if record.is_in_progress() {
                return Err(BackendError::InProgress {
                    stack: record.name,
                    status: record.status,
                });
            }
            if record.template_body == request.template_body
                && record.parameters == request.parameters
            {
                return Ok(UpdateOutcome::NoChange);
            }
            record.status = UPDATE_IN_PROGRESS.to_string();
            record.template_body = request.template_body.clone();
            record.parameters = request.parameters.clone();
            put_json(&mut table, &record.name, &record)?;
            Ok(UpdateOutcome::Updated)
        })?;
        match outcome {
            UpdateOutcome::Updated => info!(stack = %request.stack_name, "stack update started"),
            UpdateOutcome::NoChange => debug!(stack = %request.stack_name, "no updates to perform"),
        }
        Ok(outcome)
    }

    fn delete_stack(&self, name: &str) -> BackendResult<()> {
        self.transact(|txn| -> BackendResult<()> {
            let mut table = txn.open_table(STACKS).map_err(map_err!(Table))?;
            let Some(mut record) = get_json::<StackRecord, _>(&table, name)? else {
                return Ok(());
            };
            if record.status == DELETE_IN_PROGRESS {
                return Ok(());
            }
            if record.is_in_progress() {
                return Err(BackendError::InProgress {
                    stack: record.name,
                    status: record.status,
                });
            }
            record.status = DELETE_IN_PROGRESS.to_string();
            put_json(&mut table, &record.name, &record)?;
            info!(stack = %name, "stack delete started");
            Ok(())
        })
    }
}

impl TaskBackend for StateStore {
    fn list_tasks(
        &self,
        cluster: &str,
        family: &str,
        desired: TaskStatus,
    ) -> BackendResult<Vec<String>> {
        Ok(self
            .list_family_tasks(family)?
            .into_iter()
            .filter(|t| t.cluster == cluster && t.desired_status == desired)
            .map(|t| t.task_id)
            .collect())
    }

    fn describe_tasks(&self, cluster: &str, task_ids: &[String]) -> BackendResult<Vec<TaskDetail>> {
        let mut details = Vec::with_capacity(task_ids.len());
        for id in task_ids {
            match self.get_task(id)? {
                Some(task) if task.cluster == cluster => details.push(task.detail()),
                _ => debug!(task = %id, %cluster, "task not found"),
            }
        }
        Ok(details)
    }

    fn network_of(&self, task_id: &str) -> BackendResult<Option<Network>> {
        Ok(self.get_task(task_id)?.and_then(|t| t.network))
    }
}

impl ObjectStore for StateStore {
    fn get_object(&self, bucket: &str, key: &str) -> BackendResult<Vec<u8>> {
        self.get_object_record(bucket, key)?
            .map(|record| record.body)
            .ok_or_else(|| BackendError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn head_object(&self, bucket: &str, key: &str) -> BackendResult<Option<ObjectHead>> {
        Ok(self
            .get_object_record(bucket, key)?
            .map(|record| ObjectHead {
                version_id: record.version_id,
                sha256_digest: Some(record.sha256_digest),
            }))
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &[u8],
        sha256_digest: &str,
    ) -> BackendResult<String> {
        let version_id = self.transact(|txn| {
            let version = next_sequence(txn, "objects")?;
            let record = ObjectRecord {
                body: body.to_vec(),
                sha256_digest: sha256_digest.to_string(),
                version_id: format!("v{version:08}"),
            };
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            put_json(&mut table, &object_key(bucket, key), &record)?;
            Ok::<_, BackendError>(record.version_id)
        })?;
        info!(%bucket, %key, version = %version_id, "object stored");
        Ok(version_id)
    }
}

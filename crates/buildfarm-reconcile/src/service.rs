//! Replica reconciliation for one compute stack.
//!
//! ```text
//! desired = clamp(current, policy)
//! desired == current && !force ──▶ UpToDate        (no backend call)
//! describe stack
//!   Missing  ──create──▶ Creating   (only from a zero baseline)
//!   Updating ─────────▶ AlreadyUpdating
//!   Stable   ──update──▶ Updating | UpToDate (no change)
//! ```

use std::collections::BTreeMap;

use bf_core::{
    ReconcileOutcome, ReplicaPolicy, StackBackend, StackRequest, StackState, UpdateOutcome,
};
use tracing::{debug, info};

use crate::error::{ReconcileError, ReconcileResult};

/// Drive `stack_name` toward the replica count allowed by `policy`.
///
/// Issues at most one create or update. Backend errors other than the
/// no-op update propagate unchanged.
pub fn ensure<B: StackBackend + ?Sized>(
    backend: &B,
    stack_name: &str,
    template_body: &str,
    parameters: &BTreeMap<String, String>,
    current_count: u32,
    policy: ReplicaPolicy,
) -> ReconcileResult<ReconcileOutcome> {
    let desired = policy.desired_count(current_count);
    if !policy.force && desired == current_count {
        debug!(stack = %stack_name, current_count, "service level met");
        return Ok(ReconcileOutcome::UpToDate);
    }

    let request = StackRequest::with_desired_count(stack_name, template_body, desired, parameters);
    let descriptor = backend.describe_stack(stack_name)?;
    match StackState::of(descriptor.as_ref()) {
        StackState::Missing => {
            if current_count != 0 {
                return Err(ReconcileError::InvariantViolation(format!(
                    "stack {stack_name} does not exist but {current_count} instances are running"
                )));
            }
            backend.create_stack(&request)?;
            info!(stack = %stack_name, desired, "creating stack");
            Ok(ReconcileOutcome::Creating)
        }
        StackState::Updating => {
            let status = descriptor.map(|d| d.status).unwrap_or_default();
            info!(stack = %stack_name, %status, "stack is already updating");
            Ok(ReconcileOutcome::AlreadyUpdating)
        }
        StackState::Stable => match backend.update_stack(&request)? {
            UpdateOutcome::NoChange => {
                debug!(stack = %stack_name, desired, "no updates to perform");
                Ok(ReconcileOutcome::UpToDate)
            }
            UpdateOutcome::Updated => {
                info!(stack = %stack_name, current_count, desired, "updating stack");
                Ok(ReconcileOutcome::Updating)
            }
        },
    }
}

//! Infrastructure setup and teardown.
//!
//! Setup brings the shared infra stack up to date and records the
//! resulting cluster in the config. Teardown deletes workers, server and
//! infra in that order and clears the provisioned fields again.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bf_core::{
    AuthConfig, BackendError, FarmConfig, ReconcileOutcome, StackBackend, StackDescriptor,
    StackRequest, UpdateOutcome, VpcConfig,
};
use tracing::{error, info, warn};

use crate::error::{ReconcileError, ReconcileResult};
use crate::template::StackTemplate;

const CLUSTER_OUTPUT: &str = "ClusterName";

/// How long and how often to poll a stack that is mid-operation.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Parameters of the infra stack.
pub fn infra_parameters(config: &FarmConfig) -> ReconcileResult<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    params.insert("ServerStack".to_string(), config.stacks.server.clone());
    params.insert("WorkersStack".to_string(), config.stacks.workers.clone());
    match &config.vpc {
        Some(VpcConfig::New {
            vpc_cidr,
            public_subnet1_cidr,
        }) => {
            params.insert("VpcCIDR".to_string(), vpc_cidr.clone());
            params.insert("PublicSubnet1CIDR".to_string(), public_subnet1_cidr.clone());
        }
        Some(VpcConfig::Existing {
            vpc_id,
            public_subnet1_id,
        }) => {
            params.insert("VpcID".to_string(), vpc_id.clone());
            params.insert("PublicSubnet1ID".to_string(), public_subnet1_id.clone());
        }
        None => {
            return Err(ReconcileError::InvariantViolation(
                "setup requires a 'vpc' section in the config".to_string(),
            ));
        }
    }
    if let Some(AuthConfig::Simple { bucket, key }) = &config.auth {
        params.insert(
            "SimpleAuthS3ObjectArn".to_string(),
            format!("arn:aws:s3:::{bucket}/{key}"),
        );
    }
    Ok(params)
}

/// Update the stack, creating it when it does not exist yet.
pub fn update_or_create<B: StackBackend + ?Sized>(
    backend: &B,
    request: &StackRequest,
) -> ReconcileResult<ReconcileOutcome> {
    match backend.update_stack(request) {
        Ok(UpdateOutcome::NoChange) => {
            info!(stack = %request.stack_name, "up-to-date");
            Ok(ReconcileOutcome::UpToDate)
        }
        Ok(UpdateOutcome::Updated) => Ok(ReconcileOutcome::Updating),
        Err(BackendError::StackNotFound(_)) => {
            backend.create_stack(request)?;
            Ok(ReconcileOutcome::Creating)
        }
        Err(e) => Err(e.into()),
    }
}

/// Poll until the stack has no operation in flight.
pub async fn wait_for_stack<B: StackBackend + ?Sized>(
    backend: &B,
    name: &str,
    wait: WaitPolicy,
) -> ReconcileResult<StackDescriptor> {
    let started = Instant::now();
    loop {
        let Some(desc) = backend.describe_stack(name)? else {
            return Err(BackendError::StackNotFound(name.to_string()).into());
        };
        if desc.is_complete() {
            return Ok(desc);
        }
        info!(stack = %name, status = %desc.status, "waiting for stack");
        check_deadline(name, started, wait)?;
        tokio::time::sleep(wait.interval).await;
    }
}

async fn wait_for_deletion<B: StackBackend + ?Sized>(
    backend: &B,
    name: &str,
    wait: WaitPolicy,
) -> ReconcileResult<()> {
    let started = Instant::now();
    while let Some(desc) = backend.describe_stack(name)? {
        info!(stack = %name, status = %desc.status, "waiting for deletion");
        check_deadline(name, started, wait)?;
        tokio::time::sleep(wait.interval).await;
    }
    Ok(())
}

fn check_deadline(name: &str, started: Instant, wait: WaitPolicy) -> ReconcileResult<()> {
    if started.elapsed() >= wait.timeout {
        return Err(ReconcileError::Timeout {
            stack: name.to_string(),
            waited: started.elapsed(),
        });
    }
    Ok(())
}

/// Bring the infra stack up to date, then record the cluster it exposes
/// and the control endpoint in `config`.
pub async fn setup<B: StackBackend + ?Sized>(
    backend: &B,
    config: &mut FarmConfig,
    endpoint: &str,
    wait: WaitPolicy,
) -> ReconcileResult<ReconcileOutcome> {
    let name = config.stacks.infra.clone();
    if let Some(desc) = backend.describe_stack(&name)?
        && !desc.is_complete()
    {
        wait_for_stack(backend, &name, wait).await?;
    }

    let request = StackRequest::plain(&name, StackTemplate::Infra.body(), infra_parameters(config)?);
    let outcome = update_or_create(backend, &request)?;
    let desc = wait_for_stack(backend, &name, wait).await?;

    let Some(cluster) = desc.outputs.get(CLUSTER_OUTPUT) else {
        return Err(ReconcileError::InvariantViolation(format!(
            "stack {name} has no {CLUSTER_OUTPUT} output"
        )));
    };
    config.cluster = Some(cluster.clone());
    config.infra_endpoint = Some(endpoint.to_string());
    info!(stack = %name, %cluster, %endpoint, %outcome, "infrastructure ready");
    Ok(outcome)
}

/// Stacks deleted and failures met during teardown.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
    pub failures: Vec<(String, ReconcileError)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delete workers, server and infra. A stack that is mid-operation is
/// retried until `wait.timeout`; any other failure is recorded and the
/// next stack is attempted.
pub async fn teardown<B: StackBackend + ?Sized>(
    backend: &B,
    config: &mut FarmConfig,
    wait: WaitPolicy,
) -> TeardownReport {
    let mut report = TeardownReport::default();
    let names = [
        config.stacks.workers.clone(),
        config.stacks.server.clone(),
        config.stacks.infra.clone(),
    ];
    for name in names {
        match delete_stack(backend, &name, wait).await {
            Ok(()) => {
                info!(stack = %name, "stack deleted");
                report.deleted.push(name);
            }
            Err(e) => {
                error!(stack = %name, error = %e, "cannot delete stack");
                report.failures.push((name, e));
            }
        }
    }
    config.cluster = None;
    config.infra_endpoint = None;
    report
}

async fn delete_stack<B: StackBackend + ?Sized>(
    backend: &B,
    name: &str,
    wait: WaitPolicy,
) -> ReconcileResult<()> {
    let started = Instant::now();
    loop {
        match backend.delete_stack(name) {
            Ok(()) => return wait_for_deletion(backend, name, wait).await,
            Err(BackendError::InProgress { status, .. }) => {
                warn!(stack = %name, %status, "stack busy; retrying delete");
                check_deadline(name, started, wait)?;
                tokio::time::sleep(wait.interval).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

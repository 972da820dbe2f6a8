//! Operations of the control endpoint: `status`, `connect` and `down`.
//!
//! Stacks are reconciled strictly in order, servers first, because the
//! worker stack is templated with the running server's address.

use std::collections::BTreeMap;

use bf_core::{
    CloudBackend, ConnectResponse, CredentialBundle, DESIRED_COUNT_PARAMETER, FarmConfig,
    FarmStatus, ReconcileOutcome, ReplicaPolicy, ScaleReport,
};
use buildfarm_auth::Authenticator;
use tracing::{debug, info};

use crate::error::ReconcileResult;
use crate::service::ensure;
use crate::status::FarmStatusService;
use crate::template::StackTemplate;

pub use bf_core::DEFAULT_WORKER_COUNT;

fn params<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parameters of the server stack.
pub fn server_parameters(config: &FarmConfig, auth: &CredentialBundle) -> BTreeMap<String, String> {
    params([
        ("StackName", config.stacks.infra.as_str()),
        ("ServerImage", config.server_image.as_str()),
        ("LogsRegion", config.awslogs_region.as_str()),
        ("LogsGroup", config.awslogs_group.as_str()),
        ("CertChain", auth.server_crt.as_str()),
        ("PrivateKey", auth.server_pkcs8_key.as_str()),
        ("ClientCertChain", auth.ca_crt.as_str()),
    ])
}

/// Parameters of the worker stack, pointed at `server_ip`.
pub fn worker_parameters(
    config: &FarmConfig,
    server_ip: &str,
    auth: &CredentialBundle,
) -> BTreeMap<String, String> {
    params([
        ("StackName", config.stacks.infra.as_str()),
        ("ServerIP", server_ip),
        ("WorkerImage", config.worker_image.as_str()),
        ("LogsRegion", config.awslogs_region.as_str()),
        ("LogsGroup", config.awslogs_group.as_str()),
        ("TrustCertCollection", auth.ca_crt.as_str()),
        ("ClientPrivateKey", auth.client_pkcs8_key.as_str()),
        ("WorkerCertChain", auth.client_crt.as_str()),
    ])
}

pub struct FarmActions<'a, B: ?Sized> {
    backend: &'a B,
    config: &'a FarmConfig,
    auth: &'a Authenticator,
}

impl<'a, B: CloudBackend + ?Sized> FarmActions<'a, B> {
    pub fn new(backend: &'a B, config: &'a FarmConfig, auth: &'a Authenticator) -> Self {
        Self {
            backend,
            config,
            auth,
        }
    }

    pub fn status(&self) -> ReconcileResult<FarmStatus> {
        FarmStatusService::new(self.backend, self.config)?.status()
    }

    pub fn ensure_servers(
        &self,
        current_count: u32,
        policy: ReplicaPolicy,
    ) -> ReconcileResult<ReconcileOutcome> {
        let bundle = self.auth.server_auth_info(self.backend)?;
        ensure(
            self.backend,
            &self.config.stacks.server,
            StackTemplate::Server.body(),
            &server_parameters(self.config, &bundle),
            current_count,
            policy,
        )
    }

    /// Workers cannot be templated without a server address, so with no
    /// running server this waits without contacting the backend.
    pub fn ensure_workers(
        &self,
        server_ip: Option<&str>,
        current_count: u32,
        policy: ReplicaPolicy,
    ) -> ReconcileResult<ReconcileOutcome> {
        let Some(server_ip) = server_ip else {
            debug!(upper = ?policy.upper, "no running server; workers wait");
            return Ok(ReconcileOutcome::WaitingForPrecondition);
        };
        let bundle = self.auth.server_auth_info(self.backend)?;
        ensure(
            self.backend,
            &self.config.stacks.workers,
            StackTemplate::Worker.body(),
            &worker_parameters(self.config, server_ip, &bundle),
            current_count,
            policy,
        )
    }

    /// Ensure one server and at least `worker_count` workers.
    ///
    /// The reported status is the snapshot taken before reconciling.
    pub fn connect(&self, worker_count: u32, force_update: bool) -> ReconcileResult<ConnectResponse> {
        let status = self.status()?;
        let server_status = self.ensure_servers(
            status.running_servers,
            ReplicaPolicy::exactly(1).forced(force_update),
        )?;
        let workers_status = self.ensure_workers(
            status.server_ip.as_deref(),
            status.running_workers,
            ReplicaPolicy::at_least(worker_count).forced(force_update),
        )?;
        let auth_info = self.auth.client_auth_info(self.backend)?;
        info!(
            worker_count,
            force_update,
            %server_status,
            %workers_status,
            "connect reconciled"
        );
        Ok(ConnectResponse {
            status: ScaleReport {
                status,
                server_status,
                workers_status,
            },
            auth_info,
        })
    }

    /// Replica count a stack was last applied with; 0 when it is missing.
    fn recorded_count(&self, stack_name: &str) -> ReconcileResult<u32> {
        Ok(self
            .backend
            .describe_stack(stack_name)?
            .and_then(|desc| desc.parameters.get(DESIRED_COUNT_PARAMETER)?.parse().ok())
            .unwrap_or(0))
    }

    /// Shrink to at most `worker_count` workers.
    ///
    /// Counts are the larger of what runs and what each stack records, so a
    /// stack still launching is scaled down too. The server stays up until
    /// the worker fleet is fully drained, since workers cannot be
    /// reconciled without it.
    pub fn down(&self, worker_count: u32) -> ReconcileResult<ScaleReport> {
        let status = self.status()?;
        let recorded_workers = self.recorded_count(&self.config.stacks.workers)?;
        let recorded_servers = self.recorded_count(&self.config.stacks.server)?;
        let drained =
            recorded_workers == 0 && status.running_workers == 0 && status.pending_workers == 0;
        let servers = if worker_count == 0 && drained { 0 } else { 1 };

        let server_status = self.ensure_servers(
            status.running_servers.max(recorded_servers),
            ReplicaPolicy::exactly(servers),
        )?;
        let workers_status = self.ensure_workers(
            status.server_ip.as_deref(),
            status.running_workers.max(recorded_workers),
            ReplicaPolicy::at_most(worker_count),
        )?;
        info!(
            worker_count,
            drained,
            %server_status,
            %workers_status,
            "down reconciled"
        );
        Ok(ScaleReport {
            status,
            server_status,
            workers_status,
        })
    }
}

//! Bazel wrapper.
//!
//! [`build_command`] is the pure part: it maps a resolved [`Target`] and
//! the farm config to the Bazel argument list, plus the credential files
//! the auth proxy needs. [`call`] resolves the target (polling the farm
//! when needed), builds the toolchain, and runs Bazel.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use bf_core::{AuthInfo, DEFAULT_WORKER_COUNT, FarmConfig};
use buildfarm_client::{
    AuthProxy, ConnectRequest, ControlClient, ConvergencePoller, ProxyCredentials, RetryPolicy,
};
use clap::Args;
use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{info, warn};

const BAZEL_TOOLCHAINS_SNIPPET: &str = r#"
http_archive(
  name = "bazel_toolchains",
  urls = [
    "https://mirror.bazel.build/github.com/bazelbuild/bazel-toolchains/archive/e45c1eff559abfc22f6a748d2d5835fe0f544536.tar.gz",
    "https://github.com/bazelbuild/bazel-toolchains/archive/e45c1eff559abfc22f6a748d2d5835fe0f544536.tar.gz",
  ],
  strip_prefix = "bazel-toolchains-e45c1eff559abfc22f6a748d2d5835fe0f544536",
  sha256 = "21c94c714c719613f31bfba5f066ee3eb38bc148ba1fc809571c8faa5016152e",
)
"#;

/// Remote execution options, given before the Bazel command.
#[derive(Args, Debug, Clone, Default)]
pub struct BuildOptions {
    /// Minimum number of workers
    #[arg(long, env = "BUILD_WORKERS")]
    pub workers: Option<u32>,

    /// Update the farm even if the worker count is unchanged
    #[arg(long)]
    pub force_update: bool,

    /// Use a local Docker execution strategy instead of going remote
    #[arg(long, env = "BUILD_LOCAL")]
    pub local: bool,

    /// Run the Docker containers in privileged mode
    #[arg(long)]
    pub privileged: bool,

    /// Explicit remote executor address (requires --crosstool-top)
    #[arg(long)]
    pub remote_executor: Option<String>,

    /// Explicit crosstool top (requires --remote-executor)
    #[arg(long)]
    pub crosstool_top: Option<String>,

    /// Path to the Bazel binary
    #[arg(long, default_value = "bazel")]
    pub bazel_bin: String,

    /// Seconds to wait for the farm to converge; 0 waits forever
    #[arg(long, default_value_t = 30 * 60)]
    pub convergence_timeout: u64,
}

/// Where Bazel actions run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Docker sandbox on this machine, using the worker image.
    Local { privileged: bool },
    /// A caller-supplied executor.
    Explicit {
        remote_executor: String,
        crosstool_top: String,
    },
    /// The farm named by the config, scaled up on demand.
    FarmManaged { workers: u32, force_update: bool },
}

impl BuildOptions {
    pub fn mode(&self) -> anyhow::Result<ExecutionMode> {
        let explicit = match (&self.remote_executor, &self.crosstool_top) {
            (Some(remote_executor), Some(crosstool_top)) => Some(ExecutionMode::Explicit {
                remote_executor: remote_executor.clone(),
                crosstool_top: crosstool_top.clone(),
            }),
            (None, None) => None,
            _ => bail!("--remote-executor and --crosstool-top must be specified together"),
        };
        if self.local {
            return Ok(ExecutionMode::Local {
                privileged: self.privileged,
            });
        }
        Ok(explicit.unwrap_or(ExecutionMode::FarmManaged {
            workers: self.workers.unwrap_or(DEFAULT_WORKER_COUNT),
            force_update: self.force_update,
        }))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let timeout = (self.convergence_timeout > 0)
            .then(|| Duration::from_secs(self.convergence_timeout));
        RetryPolicy::default().with_timeout(timeout)
    }
}

/// A mode with its endpoint resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local {
        privileged: bool,
    },
    Remote {
        remote_executor: String,
        crosstool_top: String,
        auth_info: Option<AuthInfo>,
    },
}

/// Everything needed to run Bazel.
#[derive(Debug)]
pub struct CommandInfo {
    /// Toolchain target built before the command itself.
    pub crosstool_top: String,
    /// Client credentials on disk; removed when dropped.
    pub fs_auth_info: Option<TempDir>,
    pub remote_executor: Option<String>,
    /// Bazel arguments, without the binary and `--remote_executor`.
    pub cmd: Vec<String>,
}

/// Flags for the `docker` execution strategy.
pub fn local_bazel_options(worker_image: &str, crosstool_top: &str, privileged: bool) -> Vec<String> {
    let mut options = vec![
        "--spawn_strategy=docker".to_string(),
        "--genrule_strategy=docker".to_string(),
        "--cpu=k8".to_string(),
        "--host_cpu=k8".to_string(),
        format!("--crosstool_top={crosstool_top}"),
        "--define=EXECUTOR=remote".to_string(),
        "--experimental_docker_use_customized_images=false".to_string(),
        format!("--experimental_docker_image={worker_image}"),
    ];
    if privileged {
        options.push("--experimental_docker_privileged".to_string());
    }
    options
}

/// Flags for the `remote` execution strategy.
pub fn remote_bazel_options(crosstool_top: &str) -> Vec<String> {
    vec![
        "--cpu=k8".to_string(),
        "--host_cpu=k8".to_string(),
        format!("--crosstool_top={crosstool_top}"),
        "--define=EXECUTOR=remote".to_string(),
        "--spawn_strategy=remote".to_string(),
        "--genrule_strategy=remote".to_string(),
    ]
}

/// Write PEM credentials into a fresh temporary directory, using the
/// file names [`ProxyCredentials::from_files`] reads.
pub fn filesystem_auth_info(auth: &AuthInfo) -> std::io::Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("bazel-bf-auth").tempdir()?;
    std::fs::write(dir.path().join("ca.crt"), &auth.tls_certificate)?;
    std::fs::write(dir.path().join("client.crt"), &auth.tls_client_certificate)?;
    std::fs::write(dir.path().join("client.pkcs8.key"), &auth.tls_client_key)?;
    Ok(dir)
}

pub fn build_command(
    target: &Target,
    config: &FarmConfig,
    command: &str,
    command_args: &[String],
) -> anyhow::Result<CommandInfo> {
    let (crosstool_top, options, remote_executor, fs_auth_info) = match target {
        Target::Local { privileged } => (
            config.crosstool_top.clone(),
            local_bazel_options(&config.worker_image, &config.crosstool_top, *privileged),
            None,
            None,
        ),
        Target::Remote {
            remote_executor,
            crosstool_top,
            auth_info,
        } => {
            let fs_auth_info = auth_info
                .as_ref()
                .map(filesystem_auth_info)
                .transpose()
                .context("writing credentials")?;
            (
                crosstool_top.clone(),
                remote_bazel_options(crosstool_top),
                Some(remote_executor.clone()),
                fs_auth_info,
            )
        }
    };

    let mut cmd = Vec::with_capacity(1 + command_args.len() + options.len());
    cmd.push(command.to_string());
    cmd.extend(command_args.iter().cloned());
    cmd.extend(options);

    Ok(CommandInfo {
        crosstool_top,
        fs_auth_info,
        remote_executor,
        cmd,
    })
}

/// Fail unless `path` is a WORKSPACE file that declares `@bazel_toolchains`.
pub fn check_workspace(path: &Path) -> anyhow::Result<()> {
    let Ok(content) = std::fs::read_to_string(path) else {
        bail!("cannot find WORKSPACE file: are you sure CWD is the root of a Bazel workspace?");
    };
    if !content.contains("bazel_toolchains") {
        bail!(
            "@bazel_toolchains was probably not given in the WORKSPACE. \
             Please add the following to the WORKSPACE:\n{BAZEL_TOOLCHAINS_SNIPPET}"
        );
    }
    Ok(())
}

/// Resolve `mode` to a target, waiting for the farm when it manages one.
pub async fn resolve(
    mode: ExecutionMode,
    config: &FarmConfig,
    policy: RetryPolicy,
    cancel: watch::Receiver<bool>,
) -> anyhow::Result<Target> {
    match mode {
        ExecutionMode::Local { privileged } => Ok(Target::Local { privileged }),
        ExecutionMode::Explicit {
            remote_executor,
            crosstool_top,
        } => Ok(Target::Remote {
            remote_executor,
            crosstool_top,
            auth_info: None,
        }),
        ExecutionMode::FarmManaged {
            workers,
            force_update,
        } => {
            let client = ControlClient::new(config.infra_endpoint()?)?;
            let request = ConnectRequest {
                worker_count: workers,
                force_update,
            };
            let ready = ConvergencePoller::new(client, policy)
                .wait_for_ready(request, cancel)
                .await
                .context("waiting for the build farm")?;
            Ok(Target::Remote {
                remote_executor: ready.remote_executor().to_string(),
                crosstool_top: config.crosstool_top.clone(),
                auth_info: ready.auth_info,
            })
        }
    }
}

async fn run_bazel(bazel_bin: &str, args: &[String]) -> anyhow::Result<i32> {
    let status = tokio::process::Command::new(bazel_bin)
        .args(args)
        .status()
        .await
        .with_context(|| format!("running {bazel_bin}"))?;
    Ok(status.code().unwrap_or(1))
}

/// Run a Bazel command with the wrapper options; returns Bazel's exit code.
pub async fn call(
    options: &BuildOptions,
    config: &FarmConfig,
    command: &str,
    command_args: &[String],
) -> anyhow::Result<i32> {
    check_workspace(Path::new("WORKSPACE"))?;
    let mode = options.mode()?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted");
            let _ = cancel_tx.send(true);
        }
    });

    let target = resolve(mode, config, options.retry_policy(), cancel_rx).await?;
    let info = build_command(&target, config, command, command_args)?;

    let code = run_bazel(&options.bazel_bin, &["build".to_string(), info.crosstool_top.clone()]).await?;
    if code != 0 {
        bail!("building {} failed with exit code {code}", info.crosstool_top);
    }

    println!("Bazel command: {}", info.cmd.join(" "));
    let mut args = info.cmd.clone();
    match (&info.fs_auth_info, &info.remote_executor) {
        (Some(dir), Some(remote_executor)) => {
            let credentials = ProxyCredentials::from_files(dir.path())?;
            let proxy = AuthProxy::start(credentials, remote_executor.clone()).await?;
            info!(proxy = %proxy.listen_address(), backend = %remote_executor, "using auth proxy");
            args.push(format!("--remote_executor={}", proxy.listen_address()));
            run_bazel(&options.bazel_bin, &args).await
        }
        (_, Some(remote_executor)) => {
            args.push(format!("--remote_executor={remote_executor}"));
            run_bazel(&options.bazel_bin, &args).await
        }
        (_, None) => run_bazel(&options.bazel_bin, &args).await,
    }
}

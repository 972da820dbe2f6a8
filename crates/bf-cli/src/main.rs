use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;

use commands::build::BuildOptions;

#[derive(Parser)]
#[command(
    name = "bazel-bf",
    about = "Wrapper around Bazel for remote build farm execution",
    long_about = "Wrapper around Bazel for remote build farm execution.\n\n\
                  Any command other than the ones below is handed to Bazel, e.g.\n\
                  \"bazel-bf --workers=10 build //...\"",
    version,
)]
struct Cli {
    #[command(flatten)]
    options: BuildOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Describe and control the remote farm
    Remote {
        #[command(subcommand)]
        action: RemoteAction,
    },
    /// Manage farm credentials
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Execute Bazel against the farm
    #[command(external_subcommand)]
    Bazel(Vec<String>),
}

#[derive(Subcommand)]
enum RemoteAction {
    /// Get the status of the remote farm
    Status,
    /// Upscale the remote farm
    Up {
        /// Minimum worker count
        #[arg(long, default_value_t = bf_core::DEFAULT_WORKER_COUNT)]
        to: u32,
        /// Update the farm even if the worker count is unchanged
        #[arg(long)]
        force_update: bool,
    },
    /// Downscale the remote farm
    Down {
        /// Maximum worker count
        #[arg(long, default_value_t = 0)]
        to: u32,
    },
}

#[derive(Subcommand)]
enum AuthAction {
    /// Generate a credential bundle into a folder
    Folder {
        /// Output directory
        dir: std::path::PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Remote { action } => {
            let config = bf_core::FarmConfig::load()?;
            match action {
                RemoteAction::Status => commands::remote::status(&config).await?,
                RemoteAction::Up { to, force_update } => {
                    commands::remote::up(&config, to, force_update).await?
                }
                RemoteAction::Down { to } => commands::remote::down(&config, to).await?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Auth { action } => match action {
            AuthAction::Folder { dir } => {
                commands::auth::folder(&dir)?;
                Ok(ExitCode::SUCCESS)
            }
        },
        Command::Bazel(argv) => {
            let Some((command, args)) = argv.split_first() else {
                anyhow::bail!("no command was found in the arguments");
            };
            let config = bf_core::FarmConfig::load()?;
            let code = commands::build::call(&cli.options, &config, command, args).await?;
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_options_precede_the_bazel_command() {
        let cli = Cli::try_parse_from([
            "bazel-bf",
            "--workers=10",
            "--force-update",
            "build",
            "//...",
            "--config=ci",
        ])
        .unwrap();
        assert_eq!(cli.options.workers, Some(10));
        assert!(cli.options.force_update);
        match cli.command {
            Command::Bazel(argv) => assert_eq!(argv, ["build", "//...", "--config=ci"]),
            _ => panic!("expected a bazel command"),
        }
    }

    #[test]
    fn remote_defaults() {
        let cli = Cli::try_parse_from(["bazel-bf", "remote", "up"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Remote {
                action: RemoteAction::Up {
                    to: 2,
                    force_update: false
                }
            }
        ));

        let cli = Cli::try_parse_from(["bazel-bf", "remote", "down"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Remote {
                action: RemoteAction::Down { to: 0 }
            }
        ));
    }

    #[test]
    fn auth_folder_takes_a_directory() {
        let cli = Cli::try_parse_from(["bazel-bf", "auth", "folder", "/tmp/creds"]).unwrap();
        match cli.command {
            Command::Auth {
                action: AuthAction::Folder { dir },
            } => assert_eq!(dir, std::path::PathBuf::from("/tmp/creds")),
            _ => panic!("expected auth folder"),
        }
    }
}

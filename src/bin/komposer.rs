//! komposer - compose-to-cluster CLI
//!
//! Brings a docker-compose service stack up on a Kubernetes-style
//! cluster, creating pods and services in an order that respects
//! `depends_on` conditions.
//!
//! ## Usage
//!
//! ```sh
//! komposer up [--detach|-d] [--run-as-user] [-f FILE]... [SERVICE...]
//! komposer config [-f FILE]...
//! komposer version
//! ```

use komposer::build::DockerCliBuilder;
use komposer::cluster::KubectlClusterClient;
use komposer::orchestrate::UpOptions;
use komposer::vfs::HostFileSystem;
use komposer::{compose, up};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Up {
        files: Vec<String>,
        services: Vec<String>,
        detach: bool,
        run_as_user: bool,
    },
    Config {
        files: Vec<String>,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        return Ok(Command::Help);
    }
    match args[1].as_str() {
        "up" => {
            let mut files = Vec::new();
            let mut services = Vec::new();
            let mut detach = false;
            let mut run_as_user = false;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--detach" | "-d" => {
                        detach = true;
                        i += 1;
                    }
                    "--run-as-user" => {
                        run_as_user = true;
                        i += 1;
                    }
                    "--file" | "-f" => {
                        if i + 1 < args.len() {
                            files.push(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--file requires a path".to_string());
                        }
                    }
                    flag if flag.starts_with('-') => {
                        return Err(format!("unknown flag {flag:?}"));
                    }
                    service => {
                        services.push(service.to_string());
                        i += 1;
                    }
                }
            }
            Ok(Command::Up {
                files,
                services,
                detach,
                run_as_user,
            })
        }
        "config" => {
            let mut files = Vec::new();
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--file" | "-f" => {
                        if i + 1 < args.len() {
                            files.push(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--file requires a path".to_string());
                        }
                    }
                    other => return Err(format!("unknown argument {other:?}")),
                }
            }
            Ok(Command::Config { files })
        }
        "version" | "--version" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command {other:?}")),
    }
}

fn print_help() {
    println!(
        "komposer - bring a docker-compose stack up on a cluster

USAGE:
    komposer up [--detach|-d] [--run-as-user] [-f FILE]... [SERVICE...]
    komposer config [-f FILE]...
    komposer version

COMMANDS:
    up        Create pods and services in dependency order
    config    Validate the composition and print the bring-up order
    version   Print version information

UP FLAGS:
    -d, --detach      Return once all create calls have been issued
        --run-as-user Set each pod's user from the service's user key
    -f, --file FILE   Composition document (repeatable, merged in order)

Naming services after 'up' deploys only those services and their
transitive dependencies."
    );
}

// =============================================================================
// Commands
// =============================================================================

async fn run_up(
    files: Vec<String>,
    services: Vec<String>,
    detach: bool,
    run_as_user: bool,
) -> komposer::Result<()> {
    let fs = HostFileSystem::new();
    let mut composition = compose::load(&fs, &files)?;
    for name in &services {
        let idx = composition.find_index(name).ok_or_else(|| {
            komposer::Error::Graph(format!("no such service {name:?} in the composition"))
        })?;
        composition.add_to_filter(idx);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    up::up(
        &fs,
        &composition,
        &DockerCliBuilder::default(),
        Arc::new(KubectlClusterClient::default()),
        UpOptions {
            detach,
            run_as_user,
        },
        cancel,
    )
    .await
}

fn run_config(files: Vec<String>) -> komposer::Result<()> {
    let fs = HostFileSystem::new();
    let composition = compose::load(&fs, &files)?;
    println!("services ({}), in bring-up order:", composition.len());
    for idx in composition.topological_order() {
        let service = composition.service(idx);
        let deps: Vec<String> = service
            .depends_on
            .iter()
            .map(|d| {
                format!(
                    "{} ({})",
                    composition.service(d.target).name,
                    d.readiness
                )
            })
            .collect();
        if deps.is_empty() {
            println!("  {}", service.name);
        } else {
            println!("  {} <- {}", service.name, deps.join(", "));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    };
    let result = match command {
        Command::Up {
            files,
            services,
            detach,
            run_as_user,
        } => run_up(files, services, detach, run_as_user).await,
        Command::Config { files } => run_config(files),
        Command::Version => {
            println!("komposer {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Help => {
            print_help();
            Ok(())
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

//! Process wiring: scanner and hooks from the command line, signal handling
//! and the manager run.

use core::error::Error;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DaemonArgs;
use crate::config::ScannerKind;
use crate::config::POD_RESOURCES_TIMEOUT;
use crate::framework::watch::FsSocketWatch;
use crate::framework::Manager;
use crate::kube_client::init_kube_client;
use crate::rm::cluster::KubeletClusterView;
use crate::rm::ResourceManager;
use crate::scanner::GpuScanner;
use crate::scanner::Scanner;
use crate::scanner::StaticScanner;

#[derive(Debug, derive_more::Display)]
pub enum AppError {
    #[display("Invalid configuration: {message}")]
    Config { message: String },
    #[display("Failed to set up the resource manager")]
    ResourceManager,
    #[display("Failed to install signal handlers")]
    Signal,
    #[display("Device plugin runtime failed")]
    Runtime,
}

impl Error for AppError {}

/// Serve devices until SIGTERM or SIGINT, or until the runtime fails.
pub async fn run(args: DaemonArgs) -> Result<(), Report<AppError>> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let scanner = build_scanner(&args).await?;
    let manager = Manager::new(
        args.namespace.clone(),
        scanner,
        args.server_config(),
        Arc::new(FsSocketWatch),
    );

    manager.run(shutdown).await.change_context(AppError::Runtime)?;
    info!("Device plugin stopped");
    Ok(())
}

async fn build_scanner(args: &DaemonArgs) -> Result<Scanner, Report<AppError>> {
    match args.scanner {
        ScannerKind::Gpu => {
            let resource_manager = if args.resource_manager {
                Some(Arc::new(build_resource_manager(args).await?))
            } else {
                None
            };
            Ok(Scanner::Gpu(GpuScanner::new(
                args.gpu_scanner_config(),
                resource_manager,
            )))
        }
        ScannerKind::Static => {
            let devices_file = args.devices_file.clone().ok_or_else(|| {
                Report::new(AppError::Config {
                    message: "the static scanner needs --devices-file".to_string(),
                })
            })?;
            Ok(Scanner::Static(StaticScanner::new(
                devices_file,
                args.env_prefix.clone(),
            )))
        }
    }
}

async fn build_resource_manager(args: &DaemonArgs) -> Result<ResourceManager, Report<AppError>> {
    let node_name = args.node_name.clone().ok_or_else(|| {
        Report::new(AppError::Config {
            message: "the resource manager needs NODE_NAME".to_string(),
        })
    })?;
    let client = init_kube_client(args.kubeconfig.as_deref())
        .await
        .change_context(AppError::ResourceManager)?;

    let cluster = KubeletClusterView::new(
        client,
        node_name,
        &args.pod_resources_socket,
        POD_RESOURCES_TIMEOUT,
    );
    Ok(ResourceManager::new(
        args.resource_manager_config(),
        Arc::new(cluster),
    ))
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<(), Report<AppError>> {
    let mut sigterm = signal(SignalKind::terminate()).change_context(AppError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).change_context(AppError::Signal)?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use test_log::test;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;

    fn args(extra: &[&str]) -> DaemonArgs {
        let cli = Cli::try_parse_from(["device-plugin", "run"].into_iter().chain(extra.iter().copied()))
            .expect("valid arguments");
        match cli.command {
            Commands::Run(args) => *args,
        }
    }

    #[test(tokio::test)]
    async fn resource_manager_requires_node_name() {
        let mut args = args(&["--resource-manager", "true"]);
        args.node_name = None;

        let error = build_scanner(&args).await.err().expect("node name missing");
        assert!(matches!(error.current_context(), AppError::Config { .. }));
    }

    #[test(tokio::test)]
    async fn builds_static_scanner() {
        let args = args(&["--scanner", "static", "--devices-file", "/etc/devices.yaml"]);
        assert!(matches!(
            build_scanner(&args).await,
            Ok(Scanner::Static(_))
        ));
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::framework::watch::SocketWatch;
use crate::framework::AllocationHooks;
use crate::framework::DeviceScanner;
use crate::framework::FrameworkError;
use crate::framework::Notifier;
use crate::framework::PluginServer;
use crate::framework::ServerConfig;
use crate::framework::UpdateInfo;

/// How long stopped servers get to clean up their sockets on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct RunningServer {
    server: PluginServer,
    task: JoinHandle<()>,
}

/// Runs the scanner and keeps one server per discovered resource type.
pub struct Manager<S> {
    namespace: String,
    scanner: Option<S>,
    config: ServerConfig,
    watch: Arc<dyn SocketWatch>,
    servers: HashMap<String, RunningServer>,
}

impl<S: DeviceScanner> Manager<S> {
    pub fn new(
        namespace: impl Into<String>,
        scanner: S,
        config: ServerConfig,
        watch: Arc<dyn SocketWatch>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            scanner: Some(scanner),
            config,
            watch,
            servers: HashMap::new(),
        }
    }

    /// Drive scan results into servers until the scanner returns.
    ///
    /// Scanner failures and serve loop failures end the run with an error.
    /// Cancelling `shutdown` stops the scanner and abandons any update still
    /// waiting on a server queue, after which every server is stopped and
    /// `Ok` is returned.
    #[tracing::instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), Report<FrameworkError>> {
        let mut scanner = self.scanner.take().ok_or_else(|| {
            Report::new(FrameworkError::InvalidState {
                message: "manager can only run once".to_string(),
            })
        })?;
        let hooks = scanner.hooks();
        debug!(?hooks, "Allocation hooks");

        let (updates_tx, mut updates_rx) = mpsc::channel(1);
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let scan_shutdown = shutdown.child_token();
        let mut scan_task = tokio::spawn({
            let scan_shutdown = scan_shutdown.clone();
            async move { scanner.scan(Notifier::new(updates_tx), scan_shutdown).await }
        });

        let result = loop {
            tokio::select! {
                update = updates_rx.recv() => {
                    let Some(update) = update else {
                        // notifier dropped, the scanner is done
                        break match (&mut scan_task).await {
                            Ok(result) => result.change_context(FrameworkError::Scanner),
                            Err(e) => Err(Report::new(e).change_context(FrameworkError::Scanner)),
                        };
                    };

                    let handled = tokio::select! {
                        result = self.handle_update(update, &hooks, &fatal_tx) => result,
                        Some(error) = fatal_rx.recv() => Err(error),
                        () = shutdown.cancelled() => break Ok(()),
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
                Some(error) = fatal_rx.recv() => break Err(error),
                () = shutdown.cancelled() => break Ok(()),
            }
        };

        if let Err(e) = &result {
            error!("Device plugin manager failed: {e:?}");
        }
        scan_shutdown.cancel();
        scan_task.abort();
        self.stop_all().await;

        result
    }

    async fn handle_update(
        &mut self,
        update: UpdateInfo,
        hooks: &AllocationHooks,
        fatal_tx: &mpsc::UnboundedSender<Report<FrameworkError>>,
    ) -> Result<(), Report<FrameworkError>> {
        debug!(?update, "Received device updates");

        for (device_type, devices) in update.added {
            info!(resource = %device_type, devices = devices.len(), "Adding device plugin server");
            let mut server = PluginServer::new(
                device_type.clone(),
                hooks.clone(),
                self.config.clone(),
                self.watch.clone(),
            );

            let serve = server.serve(&self.namespace);
            let fatal_tx = fatal_tx.clone();
            let resource = format!("{}/{device_type}", self.namespace);
            let task = tokio::spawn(async move {
                if let Err(e) = serve.await {
                    error!("Failed to serve {resource}: {e:?}");
                    let _ = fatal_tx.send(e);
                }
            });

            // tracked before the first update so shutdown can stop it
            self.servers
                .insert(device_type.clone(), RunningServer { server, task });
            if let Some(running) = self.servers.get(&device_type) {
                running.server.update(devices).await?;
            }
        }

        for (device_type, devices) in update.updated {
            let running = self.servers.get(&device_type).ok_or_else(|| {
                Report::new(FrameworkError::UnknownResource {
                    resource: device_type.clone(),
                })
            })?;
            debug!(resource = %device_type, devices = devices.len(), "Updating device plugin server");
            running.server.update(devices).await?;
        }

        for (device_type, _) in update.removed {
            if let Some(running) = self.servers.remove(&device_type) {
                info!(resource = %device_type, "Removing device plugin server");
                stop_server(&device_type, running).await?;
            }
        }

        Ok(())
    }

    async fn stop_all(&mut self) {
        let mut tasks = Vec::with_capacity(self.servers.len());
        for (device_type, mut running) in self.servers.drain() {
            if let Err(e) = running.server.stop() {
                warn!(resource = %device_type, "Failed to stop server: {e:?}");
            }
            tasks.push(running.task);
        }

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks)).await;
        if drained.is_err() {
            warn!("Servers did not shut down in time");
        }
    }
}

/// Stop a removed server and wait for its serve loop to release the socket,
/// so a server for the same type can bind it again right away.
async fn stop_server(device_type: &str, mut running: RunningServer) -> Result<(), Report<FrameworkError>> {
    running.server.stop()?;
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut running.task).await.is_err() {
        warn!(resource = %device_type, "Server did not shut down in time, aborting it");
        running.task.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use test_log::test;

    use super::*;
    use crate::api;
    use crate::framework::scan::ScanError;
    use crate::framework::watch::ManualSocketWatch;
    use crate::framework::DeviceInfo;
    use crate::framework::DeviceTree;

    /// Reports the given trees, then waits for shutdown or fails.
    struct ScriptedScanner {
        trees: Vec<DeviceTree>,
        fail: bool,
    }

    #[async_trait]
    impl DeviceScanner for ScriptedScanner {
        async fn scan(
            &mut self,
            mut notifier: Notifier,
            shutdown: CancellationToken,
        ) -> Result<(), Report<ScanError>> {
            for tree in self.trees.drain(..) {
                notifier.notify(tree).await.change_context(ScanError::Notify)?;
            }
            if self.fail {
                return Err(Report::new(ScanError::InvalidDescription {
                    message: "scripted failure".to_string(),
                }));
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn manager(scanner: ScriptedScanner, dir: &std::path::Path) -> Manager<ScriptedScanner> {
        let config = ServerConfig {
            device_plugin_dir: dir.to_path_buf(),
            kubelet_socket: dir.join(api::KUBELET_SOCKET),
            cdi_dir: dir.join("cdi"),
            register_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        Manager::new("intel.com", scanner, config, Arc::new(ManualSocketWatch::default()))
    }

    #[test(tokio::test)]
    async fn scanner_failure_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scanner = ScriptedScanner {
            trees: Vec::new(),
            fail: true,
        };

        let error = manager(scanner, dir.path())
            .run(CancellationToken::new())
            .await
            .expect_err("scanner failed");
        assert!(matches!(error.current_context(), FrameworkError::Scanner));
    }

    #[test(tokio::test)]
    async fn shutdown_ends_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scanner = ScriptedScanner {
            trees: vec![DeviceTree::new()],
            fail: false,
        };
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(manager(scanner, dir.path()).run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run returned")
            .expect("joined")
            .expect("clean shutdown");
    }

    #[test(tokio::test)]
    async fn serve_failure_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tree = DeviceTree::new();
        tree.add_device("gpu", "card0-0", DeviceInfo::default());
        let scanner = ScriptedScanner {
            trees: vec![tree],
            fail: false,
        };

        // nothing listens on the kubelet socket
        let error = tokio::time::timeout(
            Duration::from_secs(10),
            manager(scanner, dir.path()).run(CancellationToken::new()),
        )
        .await
        .expect("run returned")
        .expect_err("registration failed");
        assert!(matches!(
            error.current_context(),
            FrameworkError::Registration { .. }
        ));
    }
}

//! Per resource type device plugin server.
//!
//! A [`PluginServer`] owns one kubelet facing gRPC endpoint. Its serve loop
//! binds the plugin socket, registers with the kubelet and then waits for the
//! kubelet to remove the socket (which it does on every kubelet restart) to
//! start over. [`PluginServer::stop`] ends the loop for good.

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api;
use crate::api::v1beta1::device_plugin_server::DevicePlugin;
use crate::api::v1beta1::device_plugin_server::DevicePluginServer;
use crate::api::v1beta1::registration_client::RegistrationClient;
use crate::api::v1beta1::AllocateRequest;
use crate::api::v1beta1::AllocateResponse;
use crate::api::v1beta1::CdiDevice;
use crate::api::v1beta1::ContainerAllocateResponse;
use crate::api::v1beta1::Device;
use crate::api::v1beta1::DevicePluginOptions;
use crate::api::v1beta1::DeviceSpec;
use crate::api::v1beta1::Empty;
use crate::api::v1beta1::ListAndWatchResponse;
use crate::api::v1beta1::PreStartContainerRequest;
use crate::api::v1beta1::PreStartContainerResponse;
use crate::api::v1beta1::PreferredAllocationRequest;
use crate::api::v1beta1::PreferredAllocationResponse;
use crate::api::v1beta1::RegisterRequest;
use crate::framework::cdi;
use crate::framework::watch::SocketWatch;
use crate::framework::AllocationHooks;
use crate::framework::DeviceMap;
use crate::framework::FrameworkError;
use crate::framework::Health;
use crate::framework::HookError;

/// Paths and timeouts shared by all servers of a process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub device_plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    pub cdi_dir: PathBuf,
    /// How long an existing socket gets to answer before it counts as stale.
    pub probe_timeout: Duration,
    /// How long a freshly bound listener gets to accept connections.
    pub ready_timeout: Duration,
    pub register_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let device_plugin_dir = PathBuf::from(api::DEVICE_PLUGIN_PATH);
        Self {
            kubelet_socket: device_plugin_dir.join(api::KUBELET_SOCKET),
            device_plugin_dir,
            cdi_dir: PathBuf::from(cdi::CDI_DIR),
            probe_timeout: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Uninitialized = 0,
    Serving = 1,
    Terminating = 2,
}

impl ServerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Serving,
            _ => Self::Terminating,
        }
    }
}

/// Handle the manager keeps for each resource type.
pub struct PluginServer {
    shared: Arc<ServerShared>,
    updates_tx: Option<mpsc::Sender<DeviceMap>>,
    serve_called: bool,
}

struct ServerShared {
    device_type: String,
    hooks: AllocationHooks,
    config: ServerConfig,
    watch: Arc<dyn SocketWatch>,
    /// Replaced as a whole by the ListAndWatch handler, read by Allocate.
    devices: RwLock<DeviceMap>,
    updates_rx: Mutex<mpsc::Receiver<DeviceMap>>,
    state: AtomicU8,
    stop: CancellationToken,
    /// Cancelled to tear down the current listener.
    generation: std::sync::Mutex<CancellationToken>,
}

impl PluginServer {
    pub fn new(
        device_type: impl Into<String>,
        hooks: AllocationHooks,
        config: ServerConfig,
        watch: Arc<dyn SocketWatch>,
    ) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let shared = Arc::new(ServerShared {
            device_type: device_type.into(),
            hooks,
            config,
            watch,
            devices: RwLock::new(DeviceMap::new()),
            updates_rx: Mutex::new(updates_rx),
            state: AtomicU8::new(ServerState::Uninitialized as u8),
            generation: std::sync::Mutex::new(stop.child_token()),
            stop,
        });

        Self {
            shared,
            updates_tx: Some(updates_tx),
            serve_called: false,
        }
    }

    pub fn device_type(&self) -> &str {
        &self.shared.device_type
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Socket the server listens on for the given namespace.
    pub fn socket_path(&self, namespace: &str) -> PathBuf {
        self.shared.config.device_plugin_dir.join(endpoint(namespace, &self.shared.device_type))
    }

    /// Returns the serve loop, to be spawned by the caller.
    ///
    /// The loop only returns once the server is stopped or on a fatal error.
    pub fn serve(
        &mut self,
        namespace: &str,
    ) -> impl Future<Output = Result<(), Report<FrameworkError>>> + Send + 'static {
        self.serve_called = true;
        let shared = self.shared.clone();
        let namespace = namespace.to_string();
        async move { shared.serve(namespace).await }
    }

    /// Queue a new device set for the ListAndWatch stream.
    ///
    /// Waits while a previous set has not been picked up yet.
    pub async fn update(&self, devices: DeviceMap) -> Result<(), Report<FrameworkError>> {
        let closed = || FrameworkError::QueueClosed {
            resource: self.shared.device_type.clone(),
        };
        let updates_tx = self.updates_tx.as_ref().ok_or_else(|| Report::new(closed()))?;
        updates_tx
            .send(devices)
            .await
            .map_err(|_| Report::new(closed()))
    }

    /// Stop serving and close the update queue.
    ///
    /// In flight RPCs are not waited for.
    pub fn stop(&mut self) -> Result<(), Report<FrameworkError>> {
        if !self.serve_called {
            return Err(Report::new(FrameworkError::InvalidState {
                message: format!("stop called before serve for {}", self.shared.device_type),
            }));
        }
        let Some(updates_tx) = self.updates_tx.take() else {
            return Err(Report::new(FrameworkError::InvalidState {
                message: format!("{} is already stopped", self.shared.device_type),
            }));
        };

        self.shared
            .state
            .store(ServerState::Terminating as u8, Ordering::SeqCst);
        self.shared.stop.cancel();
        drop(updates_tx);

        Ok(())
    }
}

fn endpoint(namespace: &str, device_type: &str) -> String {
    format!("{namespace}-{device_type}.sock")
}

impl ServerShared {
    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn current_generation(&self) -> CancellationToken {
        self.generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_generation(&self) -> CancellationToken {
        let token = self.stop.child_token();
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    #[tracing::instrument(skip(self), fields(resource = %self.device_type))]
    async fn serve(self: Arc<Self>, namespace: String) -> Result<(), Report<FrameworkError>> {
        match self.state.compare_exchange(
            ServerState::Uninitialized as u8,
            ServerState::Serving as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            // stopped before the loop got scheduled
            Err(state) if ServerState::from_u8(state) == ServerState::Terminating => return Ok(()),
            Err(_) => {
                return Err(Report::new(FrameworkError::InvalidState {
                    message: format!("{} is already serving", self.device_type),
                }));
            }
        }

        let resource_name = format!("{namespace}/{}", self.device_type);
        let endpoint = endpoint(&namespace, &self.device_type);
        let socket = self.config.device_plugin_dir.join(&endpoint);

        while self.state() == ServerState::Serving {
            if probe_socket(&socket, self.config.probe_timeout).await {
                return Err(Report::new(FrameworkError::AddressInUse {
                    path: socket.display().to_string(),
                }));
            }
            // a stale socket from a previous run is expected
            let _ = tokio::fs::remove_file(&socket).await;

            let listener = UnixListener::bind(&socket).change_context_lazy(|| FrameworkError::Listen {
                path: socket.display().to_string(),
            })?;
            let generation = self.next_generation();

            info!(socket = %socket.display(), "Start device plugin server");
            let service = DevicePluginServer::new(PluginService(self.clone()));
            let shutdown = generation.clone();
            let server_task = tokio::spawn(async move {
                Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(
                        UnixListenerStream::new(listener),
                        shutdown.cancelled_owned(),
                    )
                    .await
            });

            let outcome = tokio::select! {
                result = self.register_and_watch(&socket, &endpoint, &resource_name) => result,
                () = generation.cancelled() => Ok(()),
            };

            generation.cancel();
            server_task.abort();
            if let Ok(Err(e)) = server_task.await {
                warn!(error = %e, "gRPC server exited with error");
            }
            outcome?;

            if self.state() == ServerState::Serving {
                info!(socket = %socket.display(), "Socket removed, restarting");
            }
        }

        info!(socket = %socket.display(), "Socket shut down");
        let _ = tokio::fs::remove_file(&socket).await;
        Ok(())
    }

    async fn register_and_watch(
        &self,
        socket: &Path,
        endpoint: &str,
        resource_name: &str,
    ) -> Result<(), Report<FrameworkError>> {
        wait_for_server(socket, self.config.ready_timeout).await?;
        self.register(endpoint, resource_name).await?;
        info!(resource_name, "Device plugin registered");

        // the kubelet removes plugin sockets when it restarts
        self.watch.wait_removed(socket).await
    }

    async fn register(&self, endpoint: &str, resource_name: &str) -> Result<(), Report<FrameworkError>> {
        let registration_error = || FrameworkError::Registration {
            resource: resource_name.to_string(),
        };
        let request = RegisterRequest {
            version: api::VERSION.to_string(),
            endpoint: endpoint.to_string(),
            resource_name: resource_name.to_string(),
            options: Some(self.hooks.options()),
        };

        let register = async {
            let channel = api::uds_channel(&self.config.kubelet_socket)
                .await
                .change_context_lazy(registration_error)
                .attach_printable_lazy(|| {
                    format!("kubelet socket {}", self.config.kubelet_socket.display())
                })?;
            RegistrationClient::new(channel)
                .register(request)
                .await
                .change_context_lazy(registration_error)?;
            Ok::<(), Report<FrameworkError>>(())
        };

        match tokio::time::timeout(self.config.register_timeout, register).await {
            Ok(result) => result,
            Err(elapsed) => Err(Report::new(elapsed).change_context(registration_error())),
        }
    }

    fn list_response(devices: &DeviceMap) -> ListAndWatchResponse {
        ListAndWatchResponse {
            devices: devices
                .iter()
                .map(|(id, info)| Device {
                    id: id.clone(),
                    health: info.health().as_str().to_string(),
                    topology: info.topology_info(),
                })
                .collect(),
        }
    }

    async fn default_allocate(&self, request: AllocateRequest) -> Result<AllocateResponse, Status> {
        let devices = self.devices.read().await;
        let mut response = AllocateResponse::default();

        for container_request in request.container_requests {
            let mut container_response = ContainerAllocateResponse::default();

            for id in &container_request.devices_ids {
                let device = devices.get(id).ok_or_else(|| {
                    Status::not_found(format!(
                        "Invalid allocation request with non-existing device {id}"
                    ))
                })?;
                if device.health() != Health::Healthy {
                    return Err(Status::failed_precondition(format!(
                        "Invalid allocation request with unhealthy device {id}"
                    )));
                }

                for node in device.nodes() {
                    let spec = DeviceSpec::from(node);
                    if !container_response.devices.contains(&spec) {
                        container_response.devices.push(spec);
                    }
                }
                for mount in device.mounts() {
                    let mount = api::v1beta1::Mount::from(mount);
                    if !container_response.mounts.contains(&mount) {
                        container_response.mounts.push(mount);
                    }
                }
                container_response
                    .envs
                    .extend(device.envs().iter().map(|(k, v)| (k.clone(), v.clone())));
                container_response.annotations.extend(
                    device
                        .annotations()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );

                if let Some(spec) = device.cdi_spec() {
                    match cdi::write_spec(spec, &self.config.cdi_dir) {
                        Ok(name) => container_response.cdi_devices.push(CdiDevice { name }),
                        Err(e) => error!(device = %id, "CDI spec write failed: {e:?}"),
                    }
                }
            }

            response.container_responses.push(container_response);
        }

        Ok(response)
    }
}

/// Probe an existing socket. `true` when something accepts connections.
async fn probe_socket(socket: &Path, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, UnixStream::connect(socket)).await,
        Ok(Ok(_))
    )
}

async fn wait_for_server(socket: &Path, timeout: Duration) -> Result<(), Report<FrameworkError>> {
    let ready = async {
        while UnixStream::connect(socket).await.is_err() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    tokio::time::timeout(timeout, ready)
        .await
        .change_context_lazy(|| FrameworkError::ServerNotReady {
            path: socket.display().to_string(),
        })
}

/// Ends the current listener generation when a ListAndWatch stream is
/// dropped before it finished, i.e. the kubelet connection broke.
struct StreamGuard {
    shared: Arc<ServerShared>,
    generation: CancellationToken,
    finished: bool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.finished && self.shared.state() == ServerState::Serving {
            warn!(
                resource = %self.shared.device_type,
                "ListAndWatch stream broke, restarting server"
            );
            self.generation.cancel();
        }
    }
}

/// gRPC facade over the shared server state.
#[derive(Clone)]
struct PluginService(Arc<ServerShared>);

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(self.0.hooks.options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let shared = self.0.clone();
        debug!(resource = %shared.device_type, "Started ListAndWatch");

        let generation = shared.current_generation();
        let mut guard = StreamGuard {
            shared: shared.clone(),
            generation: generation.clone(),
            finished: false,
        };

        let stream = async_stream::stream! {
            // the snapshot goes out even while an older stream holds the queue
            let initial = ServerShared::list_response(&*shared.devices.read().await);
            yield Ok(initial);

            let updates = tokio::select! {
                updates = shared.updates_rx.lock() => Some(updates),
                () = generation.cancelled() => None,
            };
            let Some(mut updates) = updates else {
                guard.finished = true;
                return;
            };

            loop {
                let devices = tokio::select! {
                    devices = updates.recv() => devices,
                    () = generation.cancelled() => None,
                };
                let Some(devices) = devices else {
                    break;
                };

                let response = ServerShared::list_response(&devices);
                *shared.devices.write().await = devices;
                debug!(resource = %shared.device_type, devices = response.devices.len(), "Sending to kubelet");
                yield Ok(response);
            }

            guard.finished = true;
        };

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let Some(hook) = &self.0.hooks.preferred_allocation else {
            return Err(Status::unimplemented(
                "GetPreferredAllocation should not be called as this device plugin doesn't implement it",
            ));
        };

        hook(request.into_inner()).await.map(Response::new)
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();

        let hooked = match &self.0.hooks.allocate {
            Some(hook) => match hook(request.clone()).await {
                Ok(response) => Some(response),
                Err(HookError::UseDefault) => None,
                Err(HookError::Failed(status)) => return Err(status),
            },
            None => None,
        };
        let mut response = match hooked {
            Some(response) => response,
            None => self.0.default_allocate(request).await?,
        };

        if let Some(post_allocate) = &self.0.hooks.post_allocate {
            post_allocate(&mut response)?;
        }

        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        let Some(hook) = &self.0.hooks.pre_start_container else {
            return Err(Status::unimplemented(
                "PreStartContainer() should not be called as this device plugin doesn't implement it",
            ));
        };

        hook(request.into_inner()).await?;
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use futures::FutureExt;
    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use test_log::test;
    use tonic::Code;

    use super::*;
    use crate::api::v1beta1::ContainerAllocateRequest;
    use crate::framework::watch::ManualSocketWatch;
    use crate::framework::DeviceInfo;
    use crate::framework::DeviceNode;
    use crate::framework::Mount;

    fn test_server(hooks: AllocationHooks, config: ServerConfig) -> PluginServer {
        PluginServer::new("gpu", hooks, config, Arc::new(ManualSocketWatch::default()))
    }

    fn devices() -> DeviceMap {
        let shared_mount = Mount {
            host_path: "/opt/fw".to_string(),
            container_path: "/opt/fw".to_string(),
            read_only: true,
        };
        BTreeMap::from([
            (
                "dev0".to_string(),
                DeviceInfo::new(
                    Health::Healthy,
                    vec![
                        DeviceNode::new("/dev/dri/card0", "rw"),
                        DeviceNode::new("/dev/dri/renderD128", "rw"),
                    ],
                    vec![shared_mount.clone()],
                )
                .with_envs(BTreeMap::from([("DEV0".to_string(), "1".to_string())]))
                .with_annotations(BTreeMap::from([("a".to_string(), "0".to_string())])),
            ),
            (
                "dev1".to_string(),
                DeviceInfo::new(
                    Health::Healthy,
                    vec![DeviceNode::new("/dev/dri/card0", "rw")],
                    vec![shared_mount],
                )
                .with_envs(BTreeMap::from([("DEV1".to_string(), "1".to_string())])),
            ),
            (
                "sick".to_string(),
                DeviceInfo::new(Health::Unhealthy, Vec::new(), Vec::new()),
            ),
        ])
    }

    fn allocate_request(ids: &[&str]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: ids.iter().map(|id| (*id).to_string()).collect(),
            }],
        })
    }

    async fn service_with_devices(hooks: AllocationHooks) -> PluginService {
        let server = test_server(hooks, ServerConfig::default());
        *server.shared.devices.write().await = devices();
        PluginService(server.shared.clone())
    }

    #[test(tokio::test)]
    async fn allocate_rejects_unknown_device() {
        let service = service_with_devices(AllocationHooks::new()).await;
        let status = service
            .allocate(allocate_request(&["missing"]))
            .await
            .expect_err("unknown device");

        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("non-existing device missing"));
    }

    #[test(tokio::test)]
    async fn allocate_rejects_unhealthy_device() {
        let service = service_with_devices(AllocationHooks::new()).await;
        let status = service
            .allocate(allocate_request(&["dev0", "sick"]))
            .await
            .expect_err("unhealthy device");

        assert!(status.message().contains("unhealthy device sick"));
    }

    #[test(tokio::test)]
    async fn allocate_merges_devices_without_duplicates() {
        let service = service_with_devices(AllocationHooks::new()).await;
        let response = service
            .allocate(allocate_request(&["dev0", "dev1"]))
            .await
            .expect("allocated")
            .into_inner();

        let container = &response.container_responses[0];
        assert_eq!(
            container
                .devices
                .iter()
                .map(|d| d.host_path.as_str())
                .collect::<Vec<_>>(),
            vec!["/dev/dri/card0", "/dev/dri/renderD128"]
        );
        assert_eq!(container.mounts.len(), 1);
        assert_eq!(container.envs.len(), 2);
        assert_eq!(container.annotations.get("a").map(String::as_str), Some("0"));
        assert!(container.cdi_devices.is_empty());
    }

    #[test(tokio::test)]
    async fn allocate_hook_result_is_used() {
        let hooks = AllocationHooks::new().with_allocate(|_| {
            async {
                Ok(AllocateResponse {
                    container_responses: vec![ContainerAllocateResponse {
                        envs: [("HOOKED".to_string(), "yes".to_string())].into(),
                        ..Default::default()
                    }],
                })
            }
            .boxed()
        });
        let service = service_with_devices(hooks).await;

        // the hook wins even for ids the default path would reject
        let response = service
            .allocate(allocate_request(&["missing"]))
            .await
            .expect("hooked")
            .into_inner();
        assert_eq!(
            response.container_responses[0].envs.get("HOOKED").map(String::as_str),
            Some("yes")
        );
    }

    #[test(tokio::test)]
    async fn allocate_hook_defers_to_default() {
        let hooks = AllocationHooks::new()
            .with_allocate(|_| async { Err(HookError::UseDefault) }.boxed());
        let service = service_with_devices(hooks).await;

        let response = service
            .allocate(allocate_request(&["dev1"]))
            .await
            .expect("default allocation")
            .into_inner();
        assert_eq!(response.container_responses[0].devices.len(), 1);
    }

    #[test(tokio::test)]
    async fn allocate_hook_failure_is_returned() {
        let hooks = AllocationHooks::new().with_allocate(|_| {
            async { Err(HookError::Failed(Status::internal("boom"))) }.boxed()
        });
        let service = service_with_devices(hooks).await;

        let status = service
            .allocate(allocate_request(&["dev0"]))
            .await
            .expect_err("hook failed");
        assert_eq!(status.code(), Code::Internal);
    }

    #[test(tokio::test)]
    async fn post_allocate_mutates_and_aborts() {
        let hooks = AllocationHooks::new().with_post_allocate(|response| {
            for container in &mut response.container_responses {
                container.envs.insert("POST".to_string(), "1".to_string());
            }
            Ok(())
        });
        let service = service_with_devices(hooks).await;
        let response = service
            .allocate(allocate_request(&["dev0"]))
            .await
            .expect("allocated")
            .into_inner();
        assert_eq!(
            response.container_responses[0].envs.get("POST").map(String::as_str),
            Some("1")
        );

        let hooks = AllocationHooks::new()
            .with_post_allocate(|_| Err(Status::internal("post allocate failed")));
        let service = service_with_devices(hooks).await;
        assert!(service.allocate(allocate_request(&["dev0"])).await.is_err());
    }

    #[test(tokio::test)]
    async fn allocate_writes_cdi_spec() {
        let cdi_dir = tempfile::tempdir().expect("tempdir");
        let config = ServerConfig {
            cdi_dir: cdi_dir.path().to_path_buf(),
            ..Default::default()
        };
        let spec = cdi::Spec {
            cdi_version: cdi::CDI_VERSION.to_string(),
            kind: format!("{}/gpu", cdi::CDI_VENDOR),
            devices: vec![cdi::Device {
                name: "card0".to_string(),
                container_edits: cdi::ContainerEdits::default(),
            }],
            container_edits: None,
        };
        let server = test_server(AllocationHooks::new(), config);
        *server.shared.devices.write().await = BTreeMap::from([(
            "dev0".to_string(),
            DeviceInfo::default().with_cdi_spec(spec),
        )]);

        let response = PluginService(server.shared.clone())
            .allocate(allocate_request(&["dev0"]))
            .await
            .expect("allocated")
            .into_inner();

        assert_eq!(
            response.container_responses[0].cdi_devices,
            vec![CdiDevice {
                name: "intel.cdi.k8s.io/gpu=card0".to_string()
            }]
        );
        assert!(cdi_dir.path().join("intel.cdi.k8s.io-gpu-card0.yaml").exists());
    }

    #[test(tokio::test)]
    async fn optional_rpcs_without_hooks_are_unimplemented() {
        let service = service_with_devices(AllocationHooks::new()).await;

        let status = service
            .pre_start_container(Request::new(PreStartContainerRequest::default()))
            .await
            .expect_err("no hook");
        assert_eq!(status.code(), Code::Unimplemented);

        let status = service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
            .await
            .expect_err("no hook");
        assert_eq!(status.code(), Code::Unimplemented);

        let options = service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("options")
            .into_inner();
        assert_eq!(options, DevicePluginOptions::default());
    }

    #[test(tokio::test)]
    async fn optional_rpcs_delegate_to_hooks() {
        let hooks = AllocationHooks::new()
            .with_pre_start_container(|request| {
                async move {
                    if request.devices_ids.is_empty() {
                        Err(Status::invalid_argument("no devices"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })
            .with_preferred_allocation(|request| {
                async move {
                    Ok(PreferredAllocationResponse {
                        container_responses: request
                            .container_requests
                            .into_iter()
                            .map(|c| crate::api::v1beta1::ContainerPreferredAllocationResponse {
                                device_ids: c.available_device_ids.into_iter().take(1).collect(),
                            })
                            .collect(),
                    })
                }
                .boxed()
            });
        let service = service_with_devices(hooks).await;

        service
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["dev0".to_string()],
            }))
            .await
            .expect("pre start ok");
        assert!(service
            .pre_start_container(Request::new(PreStartContainerRequest::default()))
            .await
            .is_err());

        let preferred = service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest {
                container_requests: vec![
                    crate::api::v1beta1::ContainerPreferredAllocationRequest {
                        available_device_ids: vec!["dev0".to_string(), "dev1".to_string()],
                        must_include_device_ids: Vec::new(),
                        allocation_size: 1,
                    },
                ],
            }))
            .await
            .expect("preferred")
            .into_inner();
        assert_eq!(
            preferred.container_responses[0].device_ids,
            vec!["dev0".to_string()]
        );
    }

    #[test(tokio::test)]
    async fn list_and_watch_streams_updates_until_stop() {
        let mut server = test_server(AllocationHooks::new(), ServerConfig::default());
        let _serve = server.serve("intel.com");
        let service = PluginService(server.shared.clone());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream")
            .into_inner();
        let first = stream.next().await.expect("initial list").expect("ok");
        assert!(first.devices.is_empty());

        server.update(devices()).await.expect("update");
        let second = stream.next().await.expect("update").expect("ok");
        assert_eq!(
            second
                .devices
                .iter()
                .map(|d| (d.id.as_str(), d.health.as_str()))
                .collect::<Vec<_>>(),
            vec![
                ("dev0", api::HEALTHY),
                ("dev1", api::HEALTHY),
                ("sick", api::UNHEALTHY)
            ]
        );
        assert_eq!(server.shared.devices.read().await.len(), 3);

        server.stop().expect("stop");
        assert!(stream.next().await.is_none());
        assert_eq!(server.state(), ServerState::Terminating);
    }

    #[test(tokio::test)]
    async fn second_stream_gets_initial_list_while_first_is_open() {
        let mut server = test_server(AllocationHooks::new(), ServerConfig::default());
        let _serve = server.serve("intel.com");
        server.update(devices()).await.expect("update");
        let service = PluginService(server.shared.clone());

        let mut first = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream")
            .into_inner();
        first.next().await.expect("initial list").expect("ok");
        let update = first.next().await.expect("update").expect("ok");
        assert_eq!(update.devices.len(), 3);

        let mut second = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream")
            .into_inner();
        let initial = tokio::time::timeout(Duration::from_secs(5), second.next())
            .await
            .expect("initial list without waiting for the first stream")
            .expect("item")
            .expect("ok");
        assert_eq!(initial.devices.len(), 3);

        server.stop().expect("stop");
        assert!(first.next().await.is_none());
        assert!(second.next().await.is_none());
    }

    #[test(tokio::test)]
    async fn broken_stream_ends_generation() {
        let server = test_server(AllocationHooks::new(), ServerConfig::default());
        server
            .shared
            .state
            .store(ServerState::Serving as u8, Ordering::SeqCst);
        let generation = server.shared.next_generation();
        let service = PluginService(server.shared.clone());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream")
            .into_inner();
        stream.next().await.expect("initial list").expect("ok");
        assert!(!generation.is_cancelled());

        drop(stream);
        assert!(generation.is_cancelled());
    }

    #[test(tokio::test)]
    async fn stop_requires_serve_and_runs_once() {
        let mut server = test_server(AllocationHooks::new(), ServerConfig::default());
        assert!(server.stop().is_err());

        let _serve = server.serve("intel.com");
        server.stop().expect("first stop");
        assert!(server.stop().is_err());
        assert!(server.update(DeviceMap::new()).await.is_err());
    }

    #[test(tokio::test)]
    async fn serve_after_stop_returns_immediately() {
        let mut server = test_server(AllocationHooks::new(), ServerConfig::default());
        let serve = server.serve("intel.com");
        server.stop().expect("stop");

        serve.await.expect("clean exit");
    }

    #[test(tokio::test)]
    async fn serve_fails_when_socket_in_use() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServerConfig {
            device_plugin_dir: dir.path().to_path_buf(),
            kubelet_socket: dir.path().join(api::KUBELET_SOCKET),
            ..Default::default()
        };
        let mut server = test_server(AllocationHooks::new(), config);
        let _occupied = UnixListener::bind(server.socket_path("intel.com")).expect("bind");

        let error = server.serve("intel.com").await.expect_err("address in use");
        assert!(matches!(
            error.current_context(),
            FrameworkError::AddressInUse { .. }
        ));
    }

    #[test(tokio::test)]
    async fn serve_fails_without_kubelet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = ServerConfig {
            device_plugin_dir: dir.path().to_path_buf(),
            kubelet_socket: dir.path().join(api::KUBELET_SOCKET),
            register_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let mut server = test_server(AllocationHooks::new(), config);

        let error = server.serve("intel.com").await.expect_err("no kubelet");
        assert!(matches!(
            error.current_context(),
            FrameworkError::Registration { .. }
        ));
    }
}

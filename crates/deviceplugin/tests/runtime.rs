//! End to end run of the device plugin runtime against a fake kubelet.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deviceplugin::api;
use deviceplugin::api::v1beta1::device_plugin_client::DevicePluginClient;
use deviceplugin::api::v1beta1::registration_server::Registration;
use deviceplugin::api::v1beta1::registration_server::RegistrationServer;
use deviceplugin::api::v1beta1::AllocateRequest;
use deviceplugin::api::v1beta1::ContainerAllocateRequest;
use deviceplugin::api::v1beta1::Empty;
use deviceplugin::api::v1beta1::ListAndWatchResponse;
use deviceplugin::api::v1beta1::RegisterRequest;
use deviceplugin::framework::scan::ScanError;
use deviceplugin::framework::watch::FsSocketWatch;
use deviceplugin::framework::DeviceInfo;
use deviceplugin::framework::DeviceNode;
use deviceplugin::framework::DeviceScanner;
use deviceplugin::framework::DeviceTree;
use deviceplugin::framework::FrameworkError;
use deviceplugin::framework::Health;
use deviceplugin::framework::Manager;
use deviceplugin::framework::Notifier;
use deviceplugin::framework::ServerConfig;
use error_stack::Report;
use error_stack::ResultExt;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Server;
use tonic::Code;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;

const WAIT: Duration = Duration::from_secs(10);

struct FakeKubelet {
    registrations_tx: mpsc::UnboundedSender<RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        let _ = self.registrations_tx.send(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

fn start_kubelet(socket: &Path) -> mpsc::UnboundedReceiver<RegisterRequest> {
    let (registrations_tx, registrations_rx) = mpsc::unbounded_channel();
    let listener = UnixListener::bind(socket).expect("bind kubelet socket");
    tokio::spawn(
        Server::builder()
            .add_service(RegistrationServer::new(FakeKubelet { registrations_tx }))
            .serve_with_incoming(UnixListenerStream::new(listener)),
    );
    registrations_rx
}

/// Reports whatever tree the test sends.
struct ChannelScanner {
    trees: mpsc::UnboundedReceiver<DeviceTree>,
}

#[async_trait]
impl DeviceScanner for ChannelScanner {
    async fn scan(
        &mut self,
        mut notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Result<(), Report<ScanError>> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                tree = self.trees.recv() => match tree {
                    Some(tree) => notifier.notify(tree).await.change_context(ScanError::Notify)?,
                    None => {
                        shutdown.cancelled().await;
                        return Ok(());
                    }
                },
            }
        }
    }
}

fn gpu_tree(health: Health) -> DeviceTree {
    let mut tree = DeviceTree::new();
    tree.add_device(
        "gpu",
        "card0",
        DeviceInfo::new(health, vec![DeviceNode::new("/dev/dri/card0", "rw")], Vec::new()),
    );
    tree
}

async fn next_registration(registrations: &mut mpsc::UnboundedReceiver<RegisterRequest>) -> RegisterRequest {
    tokio::time::timeout(WAIT, registrations.recv())
        .await
        .expect("registration in time")
        .expect("kubelet running")
}

/// Read the stream until the device list matches.
async fn wait_for_health(stream: &mut Streaming<ListAndWatchResponse>, health: &str) {
    let matched = async {
        while let Some(response) = stream.message().await.expect("stream item") {
            if response.devices.len() == 1 && response.devices[0].health == health {
                return;
            }
        }
        panic!("stream ended before devices were {health}");
    };
    tokio::time::timeout(WAIT, matched).await.expect("device list in time");
}

async fn connect(socket: &Path) -> DevicePluginClient<Channel> {
    let channel = api::uds_channel(socket).await.expect("plugin socket");
    DevicePluginClient::new(channel)
}

fn allocate_card0() -> AllocateRequest {
    AllocateRequest {
        container_requests: vec![ContainerAllocateRequest {
            devices_ids: vec!["card0".to_string()],
        }],
    }
}

async fn wait_until_gone(path: &Path) {
    let gone = async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(WAIT, gone).await.expect("socket removed");
}

type RunHandle = JoinHandle<Result<(), Report<FrameworkError>>>;

/// Run a manager for the `intel.com` namespace with a kubelet under `dir`.
fn spawn_manager(dir: &Path) -> (mpsc::UnboundedSender<DeviceTree>, CancellationToken, RunHandle) {
    let (trees_tx, trees) = mpsc::unbounded_channel();
    let config = ServerConfig {
        device_plugin_dir: dir.to_path_buf(),
        kubelet_socket: dir.join(api::KUBELET_SOCKET),
        cdi_dir: dir.join("cdi"),
        ..Default::default()
    };
    let shutdown = CancellationToken::new();
    let manager = Manager::new(
        "intel.com",
        ChannelScanner { trees },
        config,
        Arc::new(FsSocketWatch),
    );
    let run = tokio::spawn(manager.run(shutdown.clone()));
    (trees_tx, shutdown, run)
}

async fn stop_manager(shutdown: CancellationToken, run: RunHandle) {
    shutdown.cancel();
    tokio::time::timeout(WAIT, run)
        .await
        .expect("manager stopped")
        .expect("joined")
        .expect("clean shutdown");
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn serves_updates_restarts_and_stops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registrations = start_kubelet(&dir.path().join(api::KUBELET_SOCKET));

    let (trees_tx, shutdown, run) = spawn_manager(dir.path());

    trees_tx.send(gpu_tree(Health::Healthy)).expect("scanner alive");
    let registration = next_registration(&mut registrations).await;
    assert_eq!(registration.resource_name.as_str(), "intel.com/gpu");
    assert_eq!(registration.endpoint.as_str(), "intel.com-gpu.sock");
    assert_eq!(registration.version.as_str(), api::VERSION);

    let plugin_socket = dir.path().join(&registration.endpoint);
    let mut client = connect(&plugin_socket).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list and watch")
        .into_inner();
    wait_for_health(&mut stream, api::HEALTHY).await;

    let response = client
        .allocate(allocate_card0())
        .await
        .expect("healthy device allocates")
        .into_inner();
    assert_eq!(
        response.container_responses[0].devices[0].host_path.as_str(),
        "/dev/dri/card0"
    );

    trees_tx.send(gpu_tree(Health::Unhealthy)).expect("scanner alive");
    wait_for_health(&mut stream, api::UNHEALTHY).await;
    let status = client
        .allocate(allocate_card0())
        .await
        .expect_err("unhealthy device rejected");
    assert_eq!(status.code(), Code::FailedPrecondition);

    // kubelet restart: the plugin socket disappears
    std::fs::remove_file(&plugin_socket).expect("remove plugin socket");
    let again = next_registration(&mut registrations).await;
    assert_eq!(again.endpoint, registration.endpoint);

    let mut client = connect(&plugin_socket).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list and watch after restart")
        .into_inner();
    wait_for_health(&mut stream, api::UNHEALTHY).await;

    // resource type gone
    trees_tx.send(DeviceTree::new()).expect("scanner alive");
    wait_until_gone(&plugin_socket).await;

    stop_manager(shutdown, run).await;
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn shutdown_with_update_nobody_reads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registrations = start_kubelet(&dir.path().join(api::KUBELET_SOCKET));
    let (trees_tx, shutdown, run) = spawn_manager(dir.path());

    // no ListAndWatch client: the first list fills the queue, the second waits
    trees_tx.send(gpu_tree(Health::Healthy)).expect("scanner alive");
    let registration = next_registration(&mut registrations).await;
    trees_tx.send(gpu_tree(Health::Unhealthy)).expect("scanner alive");
    tokio::time::sleep(Duration::from_millis(200)).await;

    stop_manager(shutdown, run).await;
    assert!(!dir.path().join(&registration.endpoint).exists());
}

#[test(tokio::test(flavor = "multi_thread"))]
async fn readded_type_keeps_its_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut registrations = start_kubelet(&dir.path().join(api::KUBELET_SOCKET));
    let (trees_tx, shutdown, run) = spawn_manager(dir.path());

    for _ in 0..5 {
        trees_tx.send(gpu_tree(Health::Healthy)).expect("scanner alive");
        next_registration(&mut registrations).await;
        trees_tx.send(DeviceTree::new()).expect("scanner alive");
    }
    trees_tx.send(gpu_tree(Health::Healthy)).expect("scanner alive");
    let registration = next_registration(&mut registrations).await;

    // leave time for any earlier serve loop to clean up after itself
    tokio::time::sleep(Duration::from_millis(500)).await;
    let plugin_socket = dir.path().join(&registration.endpoint);
    assert!(plugin_socket.exists());

    let mut client = connect(&plugin_socket).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list and watch")
        .into_inner();
    wait_for_health(&mut stream, api::HEALTHY).await;

    stop_manager(shutdown, run).await;
}

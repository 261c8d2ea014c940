//! Generated kubelet gRPC bindings and the Unix socket transport shared by
//! the plugin server, its registration client and the pod resources client.
#![allow(clippy::doc_markdown)]

use std::path::Path;
use std::path::PathBuf;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

pub mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod pod_resources {
    tonic::include_proto!("v1");
}

/// Device plugin API version announced during registration.
pub const VERSION: &str = "v1beta1";

/// Health strings understood by the kubelet.
pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";

/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// File name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Pod resources socket served by the kubelet.
pub const POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Create a gRPC channel connected to a Unix domain socket.
///
/// The channel connects eagerly, so a successful return means something is
/// accepting connections on `socket_path`.
pub async fn uds_channel(socket_path: impl AsRef<Path>) -> Result<Channel, tonic::transport::Error> {
    let socket_path: PathBuf = socket_path.as_ref().to_path_buf();

    // The URI is a placeholder, the connector below ignores it
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
        }))
        .await
}

//! Read-only cluster state the resource manager resolves allocations from.

use core::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::Api;
use kube::Client;

use crate::api;
use crate::api::pod_resources::pod_resources_lister_client::PodResourcesListerClient;
use crate::api::pod_resources::ListPodResourcesRequest;
use crate::api::pod_resources::PodResources;

#[derive(Debug, derive_more::Display)]
pub enum ClusterError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to list pending pods on node {node_name}")]
    PodList { node_name: String },
    #[display("Could not read pod resources from {socket}")]
    PodResources { socket: String },
}

impl Error for ClusterError {}

/// Queries the resource manager needs to find the pod being admitted.
#[async_trait]
pub trait ClusterView: Send + Sync + 'static {
    /// Pods in the `Pending` phase scheduled to this node.
    async fn pending_pods(&self) -> Result<Vec<Pod>, Report<ClusterError>>;

    /// Devices the kubelet already assigned, per pod and container.
    async fn pod_resources(&self) -> Result<Vec<PodResources>, Report<ClusterError>>;
}

/// [`ClusterView`] backed by the API server and the kubelet pod resources
/// socket.
#[derive(Clone)]
pub struct KubeletClusterView {
    pods: Api<Pod>,
    node_name: String,
    pod_resources_socket: PathBuf,
    timeout: Duration,
}

impl KubeletClusterView {
    pub fn new(
        client: Client,
        node_name: impl Into<String>,
        pod_resources_socket: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            pods: Api::all(client),
            node_name: node_name.into(),
            pod_resources_socket: pod_resources_socket.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ClusterView for KubeletClusterView {
    async fn pending_pods(&self) -> Result<Vec<Pod>, Report<ClusterError>> {
        let params = ListParams::default().fields(&format!(
            "spec.nodeName={},status.phase=Pending",
            self.node_name
        ));
        let pods = self
            .pods
            .list(&params)
            .await
            .change_context_lazy(|| ClusterError::PodList {
                node_name: self.node_name.clone(),
            })?;

        Ok(pods.items)
    }

    async fn pod_resources(&self) -> Result<Vec<PodResources>, Report<ClusterError>> {
        let pod_resources_error = || ClusterError::PodResources {
            socket: self.pod_resources_socket.display().to_string(),
        };

        let list = async {
            let channel = api::uds_channel(&self.pod_resources_socket)
                .await
                .change_context_lazy(pod_resources_error)?;
            let response = PodResourcesListerClient::new(channel)
                .list(ListPodResourcesRequest {})
                .await
                .change_context_lazy(pod_resources_error)?;
            Ok::<_, Report<ClusterError>>(response.into_inner().pod_resources)
        };

        match tokio::time::timeout(self.timeout, list).await {
            Ok(result) => result,
            Err(elapsed) => Err(Report::new(elapsed).change_context(pod_resources_error())),
        }
    }
}

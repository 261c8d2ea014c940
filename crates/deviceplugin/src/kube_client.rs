use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;
use tracing::debug;

use crate::rm::cluster::ClusterError;

/// Client for the API server, from an explicit kubeconfig or the in-cluster
/// service account.
pub async fn init_kube_client(kubeconfig: Option<&Path>) -> Result<Client, Report<ClusterError>> {
    let Some(path) = kubeconfig else {
        debug!("Using default Kubernetes configuration");
        return Client::try_default()
            .await
            .change_context(ClusterError::ConnectionFailed {
                message: "Failed to create Kubernetes client".to_string(),
            });
    };

    let failed = |what: &str| ClusterError::ConnectionFailed {
        message: format!("{what}: {}", path.display()),
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .change_context_lazy(|| failed("Failed to read kubeconfig file"))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| failed("Failed to create config from kubeconfig"))?;

    Client::try_from(config).change_context_lazy(|| failed("Failed to create Kubernetes client"))
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn missing_kubeconfig_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = init_kube_client(Some(&dir.path().join("missing")))
            .await
            .err()
            .expect("kubeconfig does not exist");
        assert!(matches!(
            error.current_context(),
            ClusterError::ConnectionFailed { .. }
        ));
    }
}

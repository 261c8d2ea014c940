//! Devices described in a YAML file, for nodes without discoverable
//! hardware and for testing the runtime end to end.
//!
//! ```yaml
//! fpga:
//!   dev0:
//!     health: Healthy
//!     nodes:
//!       - hostPath: /dev/fpga0
//!         containerPath: /dev/fpga0
//!     envs:
//!       FPGA_DEVICE_: dev0
//! ```

use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::v1beta1::AllocateResponse;
use crate::framework::scan::ScanError;
use crate::framework::AllocationHooks;
use crate::framework::DeviceScanner;
use crate::framework::DeviceTree;
use crate::framework::Notifier;

pub struct StaticScanner {
    devices_file: PathBuf,
    env_prefix: Option<String>,
}

impl StaticScanner {
    pub fn new(devices_file: impl Into<PathBuf>, env_prefix: Option<String>) -> Self {
        Self {
            devices_file: devices_file.into(),
            env_prefix,
        }
    }

    pub async fn load(&self) -> Result<DeviceTree, Report<ScanError>> {
        let path = self.devices_file.display().to_string();
        let content = tokio::fs::read_to_string(&self.devices_file)
            .await
            .change_context_lazy(|| ScanError::Read { path: path.clone() })?;

        let described: DeviceTree = serde_yaml::from_str(&content).change_context_lazy(|| {
            ScanError::InvalidDescription {
                message: format!("{path} is not a device tree"),
            }
        })?;

        // route through add_device so CDI specs are normalized
        let mut tree = DeviceTree::new();
        for (device_type, devices) in described {
            for (id, info) in devices {
                tree.add_device(&device_type, &id, info);
            }
        }
        Ok(tree)
    }
}

#[async_trait]
impl DeviceScanner for StaticScanner {
    #[tracing::instrument(skip_all, fields(file = %self.devices_file.display()))]
    async fn scan(
        &mut self,
        mut notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Result<(), Report<ScanError>> {
        let tree = self.load().await?;
        info!(types = tree.len(), "Loaded static devices");
        tokio::select! {
            result = notifier.notify(tree) => result.change_context(ScanError::Notify)?,
            () = shutdown.cancelled() => return Ok(()),
        }

        shutdown.cancelled().await;
        Ok(())
    }

    fn hooks(&self) -> AllocationHooks {
        match self.env_prefix.clone() {
            Some(prefix) => AllocationHooks::new().with_post_allocate(move |response| {
                renumber_envs(response, &prefix);
                Ok(())
            }),
            None => AllocationHooks::new(),
        }
    }
}

/// Rename every `prefix*` variable of a container to `{prefix}{n}`, counting
/// from zero in key order, so merged devices do not clobber each other.
fn renumber_envs(response: &mut AllocateResponse, prefix: &str) {
    for container in &mut response.container_responses {
        let mut keys: Vec<String> = container
            .envs
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();

        let values: Vec<String> = keys
            .iter()
            .filter_map(|key| container.envs.remove(key))
            .collect();
        for (n, value) in values.into_iter().enumerate() {
            container.envs.insert(format!("{prefix}{n}"), value);
        }
    }
}

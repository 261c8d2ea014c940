//! Intel GPU discovery from sysfs.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::framework::scan::ScanError;
use crate::framework::AllocationHooks;
use crate::framework::DeviceInfo;
use crate::framework::DeviceNode;
use crate::framework::DeviceScanner;
use crate::framework::DeviceTree;
use crate::framework::Health;
use crate::framework::Notifier;
use crate::rm::ResourceManager;

pub const SYSFS_DRM_DIR: &str = "/sys/class/drm";
pub const DEVFS_DRI_DIR: &str = "/dev/dri";

const VENDOR_INTEL: &str = "0x8086";

/// Resource type of the cards, named after the kernel driver.
pub const DEVICE_TYPE: &str = "i915";
pub const MONITORING_TYPE: &str = "i915_monitoring";
/// The single device of the monitoring resource.
pub const MONITORING_ID: &str = "all";

#[derive(Debug, Clone)]
pub struct GpuScannerConfig {
    pub sysfs_drm_dir: PathBuf,
    pub devfs_dri_dir: PathBuf,
    /// Containers that may share one card.
    pub shared_dev_num: usize,
    pub enable_monitoring: bool,
    pub scan_interval: Duration,
}

impl Default for GpuScannerConfig {
    fn default() -> Self {
        Self {
            sysfs_drm_dir: PathBuf::from(SYSFS_DRM_DIR),
            devfs_dri_dir: PathBuf::from(DEVFS_DRI_DIR),
            shared_dev_num: 1,
            enable_monitoring: false,
            scan_interval: Duration::from_secs(5),
        }
    }
}

pub struct GpuScanner {
    config: GpuScannerConfig,
    resource_manager: Option<Arc<ResourceManager>>,
}

impl GpuScanner {
    pub fn new(config: GpuScannerConfig, resource_manager: Option<Arc<ResourceManager>>) -> Self {
        Self {
            config,
            resource_manager,
        }
    }

    /// One pass over the DRM class directory.
    pub fn scan_once(&self) -> Result<DeviceTree, Report<ScanError>> {
        let sysfs = &self.config.sysfs_drm_dir;
        let read_error = |path: &Path| ScanError::Read {
            path: path.display().to_string(),
        };

        let mut cards: Vec<String> = fs::read_dir(sysfs)
            .change_context_lazy(|| read_error(sysfs.as_path()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_card(name))
            .collect();
        cards.sort();

        let mut tree = DeviceTree::new();
        let mut monitoring_nodes = Vec::new();

        for card in cards {
            let card_dir = sysfs.join(&card);
            match fs::read_to_string(card_dir.join("device/vendor")) {
                Ok(vendor) if vendor.trim() == VENDOR_INTEL => {}
                Ok(vendor) => {
                    debug!(%card, vendor = vendor.trim(), "Skipping non Intel card");
                    continue;
                }
                Err(e) => {
                    warn!(%card, "Cannot read vendor: {e}");
                    continue;
                }
            }

            let drm_dir = card_dir.join("device/drm");
            let mut drm_files: Vec<String> = fs::read_dir(&drm_dir)
                .change_context_lazy(|| read_error(drm_dir.as_path()))?
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .collect();
            drm_files.sort();

            let nodes: Vec<DeviceNode> = drm_files
                .iter()
                .map(|name| self.config.devfs_dri_dir.join(name))
                .filter(|path| path.exists())
                .map(|path| DeviceNode::new(path.display().to_string(), "rw"))
                .collect();
            if nodes.is_empty() {
                continue;
            }
            debug!(%card, nodes = ?nodes, "Found GPU");

            let info = DeviceInfo::new(Health::Healthy, nodes.clone(), Vec::new())
                .with_topology(numa_node(&card_dir));
            for i in 0..self.config.shared_dev_num.max(1) {
                tree.add_device(DEVICE_TYPE, &format!("{card}-{i}"), info.clone());
            }
            monitoring_nodes.extend(nodes);
        }

        if self.config.enable_monitoring && !monitoring_nodes.is_empty() {
            tree.add_device(
                MONITORING_TYPE,
                MONITORING_ID,
                DeviceInfo::new(Health::Healthy, monitoring_nodes, Vec::new()),
            );
        }

        Ok(tree)
    }
}

#[async_trait]
impl DeviceScanner for GpuScanner {
    #[tracing::instrument(skip_all, fields(sysfs = %self.config.sysfs_drm_dir.display()))]
    async fn scan(
        &mut self,
        mut notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Result<(), Report<ScanError>> {
        info!(interval = ?self.config.scan_interval, "Starting GPU scanner");
        let mut previous_count = None;

        loop {
            let tree = self.scan_once()?;

            let count = tree.device_type_count(DEVICE_TYPE);
            if previous_count != Some(count) {
                info!(cards = count, "GPU devices changed");
                previous_count = Some(count);
            }
            if let Some(rm) = &self.resource_manager {
                rm.set_device_infos(tree.get(DEVICE_TYPE).cloned().unwrap_or_default())
                    .await;
            }
            tokio::select! {
                result = notifier.notify(tree) => result.change_context(ScanError::Notify)?,
                _ = shutdown.cancelled() => {
                    info!("GPU scanner stopped with an update pending");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("GPU scanner stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }
    }

    fn hooks(&self) -> AllocationHooks {
        self.resource_manager
            .as_ref()
            .map(|rm| rm.hooks())
            .unwrap_or_default()
    }
}

fn is_card(name: &str) -> bool {
    name.strip_prefix("card")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// NUMA node of the card, empty when unknown.
fn numa_node(card_dir: &Path) -> Option<i64> {
    fs::read_to_string(card_dir.join("device/numa_node"))
        .ok()
        .and_then(|node| node.trim().parse::<i64>().ok())
        .filter(|&node| node >= 0)
}

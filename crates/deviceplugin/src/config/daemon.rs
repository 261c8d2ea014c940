use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::ValueEnum;

use crate::api;
use crate::framework::cdi;
use crate::framework::ServerConfig;
use crate::rm::ResourceManagerConfig;
use crate::scanner::gpu;
use crate::scanner::GpuScannerConfig;

/// How long the pod resources socket gets to answer.
pub const POD_RESOURCES_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before a pending pod is looked up a second time.
pub const CANDIDATE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScannerKind {
    /// Intel GPUs found in sysfs
    Gpu,
    /// Devices listed in a YAML file
    Static,
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_SCANNER",
        value_enum,
        default_value = "gpu",
        help = "Device family to discover and serve"
    )]
    pub scanner: ScannerKind,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_NAMESPACE",
        default_value = "intel.com",
        help = "Resource namespace, e.g. gpu.intel.com"
    )]
    pub namespace: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        default_value = api::DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the kubelet watches for device plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket (defaults to kubelet.sock in the device plugin directory)"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[arg(
        long,
        env = "POD_RESOURCES_SOCKET",
        default_value = api::POD_RESOURCES_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet pod resources socket used by the resource manager"
    )]
    pub pod_resources_socket: PathBuf,

    #[arg(
        long,
        env = "CDI_DIR",
        default_value = cdi::CDI_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory CDI specs are written to"
    )]
    pub cdi_dir: PathBuf,

    #[arg(
        long,
        env = "SYSFS_DRM_DIR",
        default_value = gpu::SYSFS_DRM_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "sysfs DRM class directory"
    )]
    pub sysfs_drm_dir: PathBuf,

    #[arg(
        long,
        env = "DEVFS_DRI_DIR",
        default_value = gpu::DEVFS_DRI_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "devfs DRI directory"
    )]
    pub devfs_dri_dir: PathBuf,

    #[arg(
        long,
        env = "SHARED_DEV_NUM",
        default_value = "1",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Number of containers sharing one GPU"
    )]
    pub shared_dev_num: u64,

    #[arg(
        long,
        env = "ENABLE_MONITORING",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Advertise a monitoring resource giving access to all GPUs"
    )]
    pub enable_monitoring: bool,

    #[arg(
        long,
        env = "RESOURCE_MANAGER",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Allocate GPUs and tiles as decided by the scheduler extender"
    )]
    pub resource_manager: bool,

    #[arg(
        long,
        env = "TILES_PER_CARD",
        default_value = "1",
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Tiles on each GPU card"
    )]
    pub tiles_per_card: u32,

    #[arg(
        long,
        env = "SCAN_INTERVAL_SECS",
        default_value = "5",
        help = "Seconds between GPU scans"
    )]
    pub scan_interval_secs: u64,

    #[arg(
        long,
        env = "DEVICES_FILE",
        value_hint = clap::ValueHint::FilePath,
        required_if_eq("scanner", "static"),
        help = "YAML description of the devices served by the static scanner"
    )]
    pub devices_file: Option<PathBuf>,

    #[arg(
        long,
        env = "ENV_PREFIX",
        help = "Renumber allocated environment variables with this prefix per container"
    )]
    pub env_prefix: Option<String>,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of this node, required by the resource manager"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,
}

impl DaemonArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            kubelet_socket: self
                .kubelet_socket
                .clone()
                .unwrap_or_else(|| self.device_plugin_dir.join(api::KUBELET_SOCKET)),
            device_plugin_dir: self.device_plugin_dir.clone(),
            cdi_dir: self.cdi_dir.clone(),
            ..Default::default()
        }
    }

    pub fn gpu_scanner_config(&self) -> GpuScannerConfig {
        GpuScannerConfig {
            sysfs_drm_dir: self.sysfs_drm_dir.clone(),
            devfs_dri_dir: self.devfs_dri_dir.clone(),
            shared_dev_num: usize::try_from(self.shared_dev_num).unwrap_or(usize::MAX),
            enable_monitoring: self.enable_monitoring,
            scan_interval: Duration::from_secs(self.scan_interval_secs.max(1)),
        }
    }

    pub fn resource_manager_config(&self) -> ResourceManagerConfig {
        ResourceManagerConfig {
            namespace: self.namespace.clone(),
            device_type: gpu::DEVICE_TYPE.to_string(),
            skip_id: gpu::MONITORING_ID.to_string(),
            tiles_per_card: self.tiles_per_card,
            sysfs_drm_dir: self.sysfs_drm_dir.clone(),
            retry_timeout: CANDIDATE_RETRY_DELAY,
        }
    }
}

//! Device descriptors and the per-scan device tree.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::api;
use crate::api::v1beta1;
use crate::framework::cdi;

/// Device health as reported to the kubelet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Health {
    #[default]
    Healthy,
    Unhealthy,
}

impl Health {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => api::HEALTHY,
            Self::Unhealthy => api::UNHEALTHY,
        }
    }
}

/// A device node bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub host_path: String,
    pub container_path: String,
    #[serde(default = "default_permissions")]
    pub permissions: String,
}

fn default_permissions() -> String {
    "rw".to_string()
}

impl DeviceNode {
    /// Node exposed at the same path inside the container.
    pub fn new(path: impl Into<String>, permissions: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            container_path: path.clone(),
            host_path: path,
            permissions: permissions.into(),
        }
    }
}

impl From<&DeviceNode> for v1beta1::DeviceSpec {
    fn from(node: &DeviceNode) -> Self {
        Self {
            container_path: node.container_path.clone(),
            host_path: node.host_path.clone(),
            permissions: node.permissions.clone(),
        }
    }
}

/// A filesystem mount added to the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl From<&Mount> for v1beta1::Mount {
    fn from(mount: &Mount) -> Self {
        Self {
            container_path: mount.container_path.clone(),
            host_path: mount.host_path.clone(),
            read_only: mount.read_only,
        }
    }
}

/// One allocatable unit of a resource type.
///
/// Descriptors are values: once built they are never mutated, a new scan
/// produces new descriptors. This keeps the change detection a plain
/// equality check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    health: Health,
    nodes: Vec<DeviceNode>,
    mounts: Vec<Mount>,
    envs: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    topology: Option<BTreeSet<i64>>,
    cdi_spec: Option<cdi::Spec>,
}

impl DeviceInfo {
    pub fn new(health: Health, nodes: Vec<DeviceNode>, mounts: Vec<Mount>) -> Self {
        Self {
            health,
            nodes,
            mounts,
            ..Default::default()
        }
    }

    pub fn with_envs(mut self, envs: BTreeMap<String, String>) -> Self {
        self.envs = envs;
        self
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.annotations = annotations;
        self
    }

    /// NUMA nodes the device is local to.
    pub fn with_topology(mut self, numa_nodes: impl IntoIterator<Item = i64>) -> Self {
        let nodes: BTreeSet<i64> = numa_nodes.into_iter().collect();
        self.topology = (!nodes.is_empty()).then_some(nodes);
        self
    }

    pub fn with_cdi_spec(mut self, spec: cdi::Spec) -> Self {
        self.cdi_spec = Some(spec);
        self
    }

    pub const fn health(&self) -> Health {
        self.health
    }

    pub fn nodes(&self) -> &[DeviceNode] {
        &self.nodes
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub const fn envs(&self) -> &BTreeMap<String, String> {
        &self.envs
    }

    pub const fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub const fn topology(&self) -> Option<&BTreeSet<i64>> {
        self.topology.as_ref()
    }

    pub const fn cdi_spec(&self) -> Option<&cdi::Spec> {
        self.cdi_spec.as_ref()
    }

    pub(crate) fn topology_info(&self) -> Option<v1beta1::TopologyInfo> {
        self.topology.as_ref().map(|nodes| v1beta1::TopologyInfo {
            nodes: nodes
                .iter()
                .map(|&id| v1beta1::NumaNode { id })
                .collect(),
        })
    }
}

/// Devices of one resource type, keyed by device ID.
pub type DeviceMap = BTreeMap<String, DeviceInfo>;

/// Result of one scanner pass: resource type -> device ID -> descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTree(BTreeMap<String, DeviceMap>);

impl DeviceTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, creating its resource type on first use.
    ///
    /// A descriptor may carry at most one CDI device: a spec without devices
    /// is dropped and extra devices are cut off.
    pub fn add_device(&mut self, device_type: &str, id: &str, mut info: DeviceInfo) {
        if let Some(spec) = info.cdi_spec.as_mut() {
            match spec.devices.len() {
                0 => {
                    warn!("No CDI devices defined in spec, removing spec");
                    info.cdi_spec = None;
                }
                1 => {}
                _ => {
                    warn!("Including more than one CDI device per spec is not supported, using first");
                    spec.devices.truncate(1);
                }
            }
        }

        self.0
            .entry(device_type.to_string())
            .or_default()
            .insert(id.to_string(), info);
    }

    /// Number of devices of the given type.
    pub fn device_type_count(&self, device_type: &str) -> usize {
        self.0.get(device_type).map_or(0, BTreeMap::len)
    }

    pub fn get(&self, device_type: &str) -> Option<&DeviceMap> {
        self.0.get(device_type)
    }

    pub fn contains_type(&self, device_type: &str) -> bool {
        self.0.contains_key(device_type)
    }

    pub fn insert(&mut self, device_type: String, devices: DeviceMap) {
        self.0.insert(device_type, devices);
    }

    pub fn remove(&mut self, device_type: &str) -> Option<DeviceMap> {
        self.0.remove(device_type)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, DeviceMap> {
        self.0.iter()
    }
}

impl IntoIterator for DeviceTree {
    type Item = (String, DeviceMap);
    type IntoIter = btree_map::IntoIter<String, DeviceMap>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, DeviceMap)> for DeviceTree {
    fn from_iter<I: IntoIterator<Item = (String, DeviceMap)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

//! Container Device Interface specs attached to device descriptors.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::framework::FrameworkError;

/// CDI version understood by containerd 1.7 and CRI-O 1.27.
pub const CDI_VERSION: &str = "0.5.0";

/// Default directory container runtimes read CDI specs from.
pub const CDI_DIR: &str = "/var/run/cdi";

pub const CDI_VENDOR: &str = "intel.cdi.k8s.io";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub cdi_version: String,
    pub kind: String,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_edits: Option<ContainerEdits>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    #[serde(default)]
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl Spec {
    fn file_name(&self, device: &str) -> String {
        format!("{}-{device}.yaml", self.kind.replace('/', "-"))
    }
}

/// Make sure `spec` is present in `cdi_dir` and return the qualified name of
/// its device.
///
/// An already existing spec file is left untouched, so repeated
/// allocations of the same device do not rewrite it.
pub fn write_spec(spec: &Spec, cdi_dir: &Path) -> Result<String, Report<FrameworkError>> {
    let device = match spec.devices.as_slice() {
        [device] => &device.name,
        _ => {
            return Err(Report::new(FrameworkError::Cdi {
                path: cdi_dir.display().to_string(),
            })
            .attach_printable(format!(
                "expected exactly one device in spec {}, found {}",
                spec.kind,
                spec.devices.len()
            )));
        }
    };
    let qualified_name = format!("{}={device}", spec.kind);
    let path = cdi_dir.join(spec.file_name(device));
    let cdi_error = || FrameworkError::Cdi {
        path: path.display().to_string(),
    };

    if path.exists() {
        return Ok(qualified_name);
    }

    let mut spec = spec.clone();
    spec.cdi_version = CDI_VERSION.to_string();
    let content = serde_yaml::to_string(&spec).change_context_lazy(cdi_error)?;

    fs::create_dir_all(cdi_dir).change_context_lazy(cdi_error)?;
    fs::write(&path, content).change_context_lazy(cdi_error)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
        .change_context_lazy(cdi_error)?;

    Ok(qualified_name)
}

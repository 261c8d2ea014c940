//! Fractional GPU resource manager.
//!
//! The kubelet picks interchangeable device IDs for a container without
//! knowing about GPU tiles. A scheduler extender has already decided which
//! cards and tiles the pod should get and recorded that as pod annotations.
//! The allocate hook built here finds the pod being admitted and hands out
//! the annotated cards instead of the kubelet's choice.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::v1beta1::AllocateRequest;
use crate::api::v1beta1::AllocateResponse;
use crate::api::v1beta1::ContainerAllocateResponse;
use crate::api::v1beta1::DeviceSpec;
use crate::framework::AllocationHooks;
use crate::framework::DeviceMap;
use crate::framework::HookError;

pub mod cluster;
pub mod tiles;

use cluster::ClusterError;
use cluster::ClusterView;
use tiles::HierarchyMode;

/// Scheduler timestamp, used to pick the earliest of several pending pods.
pub const TS_ANNOTATION: &str = "gas-ts";
/// Cards per GPU using container, e.g. `card0,card1|card2`.
pub const CARD_ANNOTATION: &str = "gas-container-cards";
/// Tiles per GPU using container, e.g. `card0:gt0+gt1|card2:gt1`.
pub const TILE_ANNOTATION: &str = "gas-container-tiles";

/// Settings of a [`ResourceManager`].
#[derive(Debug, Clone)]
pub struct ResourceManagerConfig {
    /// Resource namespace, e.g. `gpu.intel.com`.
    pub namespace: String,
    /// Resource type the hook is installed for, e.g. `i915`.
    pub device_type: String,
    /// Device ID that bypasses fractional allocation.
    pub skip_id: String,
    pub tiles_per_card: u32,
    pub sysfs_drm_dir: PathBuf,
    /// Pause before the single retry of candidate resolution.
    pub retry_timeout: Duration,
}

/// A pending pod that still has GPU using containers to be allocated.
#[derive(Debug, Clone)]
pub struct PodCandidate {
    pub key: String,
    pub pod: Pod,
    pub allocated_containers: usize,
    pub target_containers: usize,
}

#[derive(Debug)]
enum CandidateError {
    /// The scheduler annotations are not visible yet.
    Retry,
    /// No pod is waiting for this resource anymore.
    ZeroPending,
    Cluster(Report<ClusterError>),
}

pub struct ResourceManager {
    cluster: Arc<dyn ClusterView>,
    device_infos: RwLock<DeviceMap>,
    resource_prefix: String,
    full_resource_name: String,
    skip_id: String,
    tiles_per_card: u32,
    sysfs_drm_dir: PathBuf,
    retry_timeout: Duration,
}

impl ResourceManager {
    pub fn new(config: ResourceManagerConfig, cluster: Arc<dyn ClusterView>) -> Self {
        info!("GPU device plugin resource manager enabled");
        Self {
            cluster,
            device_infos: RwLock::new(DeviceMap::new()),
            full_resource_name: format!("{}/{}", config.namespace, config.device_type),
            resource_prefix: format!("{}/", config.namespace),
            skip_id: config.skip_id,
            tiles_per_card: config.tiles_per_card.max(1),
            sysfs_drm_dir: config.sysfs_drm_dir,
            retry_timeout: config.retry_timeout,
        }
    }

    /// Replace the card table allocations are built from.
    pub async fn set_device_infos(&self, device_infos: DeviceMap) {
        *self.device_infos.write().await = device_infos;
    }

    /// Allocation hooks delegating to this manager.
    pub fn hooks(self: &Arc<Self>) -> AllocationHooks {
        let rm = self.clone();
        AllocationHooks::new().with_allocate(move |request| {
            let rm = rm.clone();
            async move { rm.create_fractional_resource_response(&request).await }.boxed()
        })
    }

    /// Build the allocation from the scheduler's card and tile choice.
    ///
    /// # Errors
    ///
    /// Always [`HookError::UseDefault`]: any problem resolving the pod hands
    /// the decision back to the default allocation rather than failing pod
    /// admission.
    pub async fn create_fractional_resource_response(
        &self,
        request: &AllocateRequest,
    ) -> Result<AllocateResponse, HookError> {
        if !self.is_request_ok(request) {
            return Err(HookError::UseDefault);
        }
        debug!(
            device_ids = ?request.container_requests[0].devices_ids,
            "Proposed device ids"
        );

        let candidate = match self.find_candidate().await {
            Err(CandidateError::Retry) => {
                warn!("Retrying pod resolving after sleeping");
                tokio::time::sleep(self.retry_timeout).await;
                self.find_candidate().await
            }
            other => other,
        };
        let candidate = match candidate {
            Ok(candidate) => candidate,
            Err(CandidateError::ZeroPending) => {
                debug!("No pending pods on this node");
                return Err(HookError::UseDefault);
            }
            Err(CandidateError::Retry) => {
                error!("Allocation candidate not found, perhaps the GPU scheduler extender is not called");
                return Err(HookError::UseDefault);
            }
            Err(CandidateError::Cluster(report)) => {
                error!("Allocation candidate not resolved: {report:?}");
                return Err(HookError::UseDefault);
            }
        };

        let container_index = candidate.allocated_containers;
        let cards = container_cards(&candidate.pod, container_index);
        if cards.is_empty() {
            warn!(pod = %candidate.key, container_index, "No cards annotated for container");
            return Err(HookError::UseDefault);
        }
        let resources = container_resources(
            &candidate.pod,
            container_index,
            &self.full_resource_name,
            &self.resource_prefix,
        );
        let card_resources = per_card_resources(&resources, cards.len());
        let mask = self.container_tile_mask(&candidate.pod, container_index);
        info!(pod = %candidate.key, ?cards, ?card_resources, %mask, "Fractional allocation");

        let mut container_response = self.card_devices(&cards).await?;
        if !mask.is_empty() {
            container_response
                .envs
                .insert(tiles::AFFINITY_MASK_ENV.to_string(), mask);
        }
        self.add_resource_annotations(&mut container_response, &card_resources)
            .await;

        Ok(AllocateResponse {
            container_responses: vec![container_response],
        })
    }

    fn is_request_ok(&self, request: &AllocateRequest) -> bool {
        // the kubelet allocates one container per call
        let [container_request] = request.container_requests.as_slice() else {
            warn!("Multi-container allocation request not supported");
            return false;
        };
        if container_request.devices_ids.is_empty() {
            warn!("Allocation request without device ids");
            return false;
        }

        // monitoring gets full access to every card
        !container_request.devices_ids.contains(&self.skip_id)
    }

    /// Find the pod the current allocation is for.
    async fn find_candidate(&self) -> Result<PodCandidate, CandidateError> {
        let pending: HashMap<String, Pod> = self
            .cluster
            .pending_pods()
            .await
            .map_err(CandidateError::Cluster)?
            .into_iter()
            .filter(|pod| num_gpu_using_containers(pod, &self.full_resource_name) > 0)
            .map(|pod| (pod_key(&pod), pod))
            .collect();
        let pod_resources = self
            .cluster
            .pod_resources()
            .await
            .map_err(CandidateError::Cluster)?;

        let mut candidates = Vec::new();
        for resources in pod_resources {
            let key = format!("{}&{}", resources.namespace, resources.name);
            let Some(pod) = pending.get(&key) else {
                continue;
            };

            let allocated_containers = resources
                .containers
                .iter()
                .filter(|container| {
                    container
                        .devices
                        .iter()
                        .any(|device| device.resource_name == self.full_resource_name)
                })
                .count();
            let target_containers = num_gpu_using_containers(pod, &self.full_resource_name);
            if allocated_containers < target_containers {
                candidates.push(PodCandidate {
                    key,
                    pod: pod.clone(),
                    allocated_containers,
                    target_containers,
                });
            }
        }

        select_candidate(candidates)
    }

    fn container_tile_mask(&self, pod: &Pod, container_index: usize) -> String {
        let Some(annotation) = annotation(pod, TILE_ANNOTATION) else {
            return String::new();
        };
        let Some(segment) = tiles::container_segment(annotation, container_index) else {
            warn!(container_index, "No tile info for container");
            return String::new();
        };

        let mode = gpu_using_containers(pod, &self.full_resource_name)
            .nth(container_index)
            .map(|container| HierarchyMode::from_env_value(container_env(container, tiles::HIERARCHY_ENV)))
            .unwrap_or_default();

        tiles::affinity_mask(segment, mode, self.tiles_per_card)
    }

    async fn card_devices(&self, cards: &[String]) -> Result<ContainerAllocateResponse, HookError> {
        let device_infos = self.device_infos.read().await;
        let mut container_response = ContainerAllocateResponse::default();

        for card in cards {
            let device_id = format!("{card}-0");
            let Some(device) = device_infos.get(&device_id) else {
                warn!(%device_id, "No device info, using default allocation");
                return Err(HookError::UseDefault);
            };

            for node in device.nodes() {
                let spec = DeviceSpec::from(node);
                if !container_response.devices.contains(&spec) {
                    container_response.devices.push(spec);
                }
            }
            for mount in device.mounts() {
                let mount = crate::api::v1beta1::Mount::from(mount);
                if !container_response.mounts.contains(&mount) {
                    container_response.mounts.push(mount);
                }
            }
            container_response
                .envs
                .extend(device.envs().iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        Ok(container_response)
    }

    /// Per card resource amounts as `gpu.<resource>` annotations, keyed by the
    /// card's device number, for cgroup accounting.
    async fn add_resource_annotations(
        &self,
        container_response: &mut ContainerAllocateResponse,
        card_resources: &BTreeMap<String, i64>,
    ) {
        let mut annotations: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for device in &container_response.devices {
            if !device.host_path.contains("card") {
                continue;
            }
            let major_minor = match major_minor(&self.sysfs_drm_dir, &device.host_path).await {
                Ok(major_minor) => major_minor,
                Err(e) => {
                    warn!(host_path = %device.host_path, "Major/minor not resolved: {e}");
                    continue;
                }
            };

            for (resource_name, value) in card_resources {
                let Some(suffix) = resource_name.rsplit_once('/').map(|(_, s)| s) else {
                    continue;
                };
                if suffix.is_empty() {
                    continue;
                }
                annotations
                    .entry(format!("gpu.{suffix}"))
                    .or_default()
                    .push(format!("{major_minor}={value}"));
            }
        }

        container_response.annotations.extend(
            annotations
                .into_iter()
                .map(|(key, values)| (key, values.join(","))),
        );
    }
}

fn select_candidate(mut candidates: Vec<PodCandidate>) -> Result<PodCandidate, CandidateError> {
    match candidates.len() {
        0 => Err(CandidateError::ZeroPending),
        1 => {
            let candidate = candidates.remove(0);
            if annotation(&candidate.pod, CARD_ANNOTATION).is_none() {
                warn!(pod = %candidate.key, "Pending pod annotations from scheduler not yet visible");
                return Err(CandidateError::Retry);
            }
            Ok(candidate)
        }
        n => {
            debug!(pending = n, "Several pods pending, picking oldest");
            candidates
                .into_iter()
                .filter_map(|candidate| {
                    let ts = annotation(&candidate.pod, TS_ANNOTATION)?.to_string();
                    Some((ts, candidate))
                })
                .min_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, candidate)| candidate)
                .ok_or_else(|| {
                    warn!("Pending pod annotations from scheduler not yet visible");
                    CandidateError::Retry
                })
        }
    }
}

fn pod_key(pod: &Pod) -> String {
    format!(
        "{}&{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
}

fn requests(container: &Container) -> impl Iterator<Item = (&String, &Quantity)> {
    container
        .resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .into_iter()
        .flatten()
}

fn gpu_using_containers<'a>(
    pod: &'a Pod,
    full_resource_name: &'a str,
) -> impl Iterator<Item = &'a Container> + 'a {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .filter(move |container| {
            requests(container).any(|(name, quantity)| {
                name == full_resource_name && quantity_value(quantity).is_some_and(|v| v > 0)
            })
        })
}

fn num_gpu_using_containers(pod: &Pod, full_resource_name: &str) -> usize {
    gpu_using_containers(pod, full_resource_name).count()
}

fn container_env<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|env| env.name == name)?
        .value
        .as_deref()
}

/// Cards for the n:th GPU using container of the pod.
fn container_cards(pod: &Pod, container_index: usize) -> Vec<String> {
    annotation(pod, CARD_ANNOTATION)
        .and_then(|annotation| tiles::container_segment(annotation, container_index))
        .map(|segment| {
            segment
                .split(',')
                .filter(|card| !card.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Requests under the resource namespace of the n:th GPU using container.
fn container_resources(
    pod: &Pod,
    container_index: usize,
    full_resource_name: &str,
    resource_prefix: &str,
) -> BTreeMap<String, i64> {
    gpu_using_containers(pod, full_resource_name)
        .nth(container_index)
        .map(|container| {
            requests(container)
                .filter(|(name, _)| name.starts_with(resource_prefix))
                .filter_map(|(name, quantity)| Some((name.clone(), quantity_value(quantity)?)))
                .collect()
        })
        .unwrap_or_default()
}

/// Resources are split evenly between the container's cards.
fn per_card_resources(resources: &BTreeMap<String, i64>, card_count: usize) -> BTreeMap<String, i64> {
    let Ok(card_count) = i64::try_from(card_count) else {
        return BTreeMap::new();
    };
    if card_count == 0 {
        return BTreeMap::new();
    }

    resources
        .iter()
        .map(|(name, value)| (name.clone(), value / card_count))
        .collect()
}

/// Exact integer value of a quantity, `None` when it has a fractional part,
/// does not fit an `i64` or does not parse.
///
/// Follows the Kubernetes quantity grammar: a signed decimal number followed
/// by a binary SI suffix (`Ki` to `Ei`), a decimal SI suffix (`m`, `k` to `E`)
/// or a decimal exponent (`e3`, `E-2`).
fn quantity_value(quantity: &Quantity) -> Option<i64> {
    let value = quantity.0.trim();
    let (negative, unsigned) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let split = unsigned
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(split);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return None;
    }

    let mut mantissa: i128 = 0;
    for digit in whole.bytes().chain(fraction.bytes()) {
        mantissa = mantissa
            .checked_mul(10)?
            .checked_add(i128::from(digit - b'0'))?;
    }
    let mut exponent = -i32::try_from(fraction.len()).ok()?;

    let binary_shift = match suffix {
        "Ki" => Some(10),
        "Mi" => Some(20),
        "Gi" => Some(30),
        "Ti" => Some(40),
        "Pi" => Some(50),
        "Ei" => Some(60),
        _ => None,
    };
    match binary_shift {
        Some(shift) => mantissa = mantissa.checked_mul(1 << shift)?,
        None => {
            exponent += match suffix {
                "" => 0,
                "m" => -3,
                "k" => 3,
                "M" => 6,
                "G" => 9,
                "T" => 12,
                "P" => 15,
                "E" => 18,
                _ => suffix.strip_prefix(['e', 'E'])?.parse::<i32>().ok()?,
            }
        }
    }

    if mantissa == 0 {
        return Some(0);
    }
    let scale = 10_i128.checked_pow(exponent.unsigned_abs())?;
    let magnitude = if exponent >= 0 {
        mantissa.checked_mul(scale)?
    } else if mantissa % scale == 0 {
        mantissa / scale
    } else {
        return None;
    };

    i64::try_from(if negative { -magnitude } else { magnitude }).ok()
}

/// `major:minor` of a DRM card node, read from sysfs.
async fn major_minor(sysfs_drm_dir: &Path, host_path: &str) -> Result<String, String> {
    let card_name = host_path
        .rsplit_once('/')
        .map(|(_, name)| name)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| format!("bad path {host_path}"))?;
    if card_name.len() < 5 {
        return Err(format!("bad card name {card_name}"));
    }

    tokio::fs::read_to_string(sysfs_drm_dir.join(card_name).join("dev"))
        .await
        .map(|dev| dev.trim().to_string())
        .map_err(|e| e.to_string())
}

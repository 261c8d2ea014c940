use error_stack::Report;
use tokio::sync::mpsc;
use tracing::debug;

use crate::framework::DeviceTree;
use crate::framework::FrameworkError;

/// Resource types that changed between two consecutive scans.
///
/// A type shows up in at most one of the three trees.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    pub added: DeviceTree,
    pub updated: DeviceTree,
    pub removed: DeviceTree,
}

impl UpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Compare two scan results at resource type granularity.
    pub fn between(previous: &DeviceTree, current: &DeviceTree) -> Self {
        let mut remaining = previous.clone();
        let mut update = Self::default();

        for (device_type, devices) in current.iter() {
            match remaining.remove(device_type) {
                Some(old) if old != *devices => {
                    update.updated.insert(device_type.clone(), devices.clone());
                }
                Some(_) => {}
                None => {
                    update.added.insert(device_type.clone(), devices.clone());
                }
            }
        }
        update.removed = remaining;

        update
    }
}

/// Handed to the scanner; turns full scan results into [`UpdateInfo`]s.
#[derive(Debug)]
pub struct Notifier {
    device_tree: DeviceTree,
    updates_tx: mpsc::Sender<UpdateInfo>,
}

impl Notifier {
    pub fn new(updates_tx: mpsc::Sender<UpdateInfo>) -> Self {
        Self {
            device_tree: DeviceTree::new(),
            updates_tx,
        }
    }

    /// Publish the result of one scan.
    ///
    /// Nothing is sent when the scan matches the previous one. The stored
    /// tree is replaced either way.
    pub async fn notify(&mut self, device_tree: DeviceTree) -> Result<(), Report<FrameworkError>> {
        let update = UpdateInfo::between(&self.device_tree, &device_tree);
        self.device_tree = device_tree;

        if update.is_empty() {
            return Ok(());
        }

        debug!(
            added = update.added.len(),
            updated = update.updated.len(),
            removed = update.removed.len(),
            "Device tree changed"
        );
        self.updates_tx.send(update).await.map_err(|_| {
            Report::new(FrameworkError::QueueClosed {
                resource: "device manager".to_string(),
            })
        })
    }
}

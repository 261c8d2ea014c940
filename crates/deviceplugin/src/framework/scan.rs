use core::error::Error;

use async_trait::async_trait;
use error_stack::Report;
use tokio_util::sync::CancellationToken;

use crate::framework::AllocationHooks;
use crate::framework::Notifier;

#[derive(Debug, derive_more::Display)]
pub enum ScanError {
    #[display("Failed to read {path}")]
    Read { path: String },
    #[display("Invalid device description: {message}")]
    InvalidDescription { message: String },
    #[display("Failed to publish scan results")]
    Notify,
}

impl Error for ScanError {}

/// Device discovery for one accelerator family.
///
/// `scan` runs for the lifetime of the process and reports every pass
/// through the notifier. It only returns on an unrecoverable discovery
/// failure or once `shutdown` is cancelled.
#[async_trait]
pub trait DeviceScanner: Send + 'static {
    async fn scan(
        &mut self,
        notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Result<(), Report<ScanError>>;

    /// Allocation hooks installed on every server created for this family.
    fn hooks(&self) -> AllocationHooks {
        AllocationHooks::default()
    }
}

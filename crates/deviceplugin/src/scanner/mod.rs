//! Device families this binary can serve. One is selected at startup.

use async_trait::async_trait;
use error_stack::Report;
use tokio_util::sync::CancellationToken;

use crate::framework::scan::ScanError;
use crate::framework::AllocationHooks;
use crate::framework::DeviceScanner;
use crate::framework::Notifier;

pub mod gpu;
pub mod static_file;

pub use gpu::GpuScanner;
pub use gpu::GpuScannerConfig;
pub use static_file::StaticScanner;

pub enum Scanner {
    Gpu(GpuScanner),
    Static(StaticScanner),
}

#[async_trait]
impl DeviceScanner for Scanner {
    async fn scan(
        &mut self,
        notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Result<(), Report<ScanError>> {
        match self {
            Self::Gpu(scanner) => scanner.scan(notifier, shutdown).await,
            Self::Static(scanner) => scanner.scan(notifier, shutdown).await,
        }
    }

    fn hooks(&self) -> AllocationHooks {
        match self {
            Self::Gpu(scanner) => scanner.hooks(),
            Self::Static(scanner) => scanner.hooks(),
        }
    }
}

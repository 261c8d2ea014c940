//! Generic device plugin runtime: scan results flow through the
//! [`notifier::Notifier`] into the [`manager::Manager`], which runs one
//! [`server::PluginServer`] per resource type.

use core::error::Error;

pub mod cdi;
pub mod device;
pub mod hooks;
pub mod manager;
pub mod notifier;
pub mod scan;
pub mod server;
pub mod watch;

pub use device::DeviceInfo;
pub use device::DeviceMap;
pub use device::DeviceNode;
pub use device::DeviceTree;
pub use device::Health;
pub use device::Mount;
pub use hooks::AllocationHooks;
pub use hooks::HookError;
pub use manager::Manager;
pub use notifier::Notifier;
pub use notifier::UpdateInfo;
pub use scan::DeviceScanner;
pub use server::PluginServer;
pub use server::ServerConfig;

/// Errors raised by the runtime. All of them are fatal to the process.
#[derive(Debug, derive_more::Display)]
pub enum FrameworkError {
    #[display("Socket {path} is already in use")]
    AddressInUse { path: String },
    #[display("Failed to listen to plugin socket {path}")]
    Listen { path: String },
    #[display("Plugin server at {path} did not become ready")]
    ServerNotReady { path: String },
    #[display("Cannot register {resource} to kubelet service")]
    Registration { resource: String },
    #[display("Failed to watch socket {path}")]
    SocketWatch { path: String },
    #[display("Update queue for {resource} is closed")]
    QueueClosed { resource: String },
    #[display("No server for resource type {resource}")]
    UnknownResource { resource: String },
    #[display("Invalid server state: {message}")]
    InvalidState { message: String },
    #[display("Device scanner failed")]
    Scanner,
    #[display("Failed to write CDI spec {path}")]
    Cdi { path: String },
}

impl Error for FrameworkError {}

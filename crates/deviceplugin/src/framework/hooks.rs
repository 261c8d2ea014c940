//! Optional allocation hooks a device family can attach to its servers.
//!
//! Every hook is an independent, optional function value. A missing hook is
//! a regular state: the server falls back to its built-in behavior or
//! answers `Unimplemented`.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tonic::Status;

use crate::api::v1beta1::AllocateRequest;
use crate::api::v1beta1::AllocateResponse;
use crate::api::v1beta1::DevicePluginOptions;
use crate::api::v1beta1::PreStartContainerRequest;
use crate::api::v1beta1::PreferredAllocationRequest;
use crate::api::v1beta1::PreferredAllocationResponse;

/// Outcome of a custom `Allocate` hook that did not produce a response.
#[derive(Debug, derive_more::Display)]
pub enum HookError {
    /// Let the server run its default allocation for this request.
    #[display("use default allocation method")]
    UseDefault,
    #[display("allocation hook failed: {_0}")]
    Failed(Status),
}

impl From<Status> for HookError {
    fn from(status: Status) -> Self {
        Self::Failed(status)
    }
}

pub type AllocateFn =
    Arc<dyn Fn(AllocateRequest) -> BoxFuture<'static, Result<AllocateResponse, HookError>> + Send + Sync>;

pub type PostAllocateFn = Arc<dyn Fn(&mut AllocateResponse) -> Result<(), Status> + Send + Sync>;

pub type PreStartContainerFn =
    Arc<dyn Fn(PreStartContainerRequest) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

pub type PreferredAllocationFn = Arc<
    dyn Fn(PreferredAllocationRequest) -> BoxFuture<'static, Result<PreferredAllocationResponse, Status>>
        + Send
        + Sync,
>;

/// Hooks handed to every server the manager creates.
#[derive(Clone, Default)]
pub struct AllocationHooks {
    pub allocate: Option<AllocateFn>,
    pub post_allocate: Option<PostAllocateFn>,
    pub pre_start_container: Option<PreStartContainerFn>,
    pub preferred_allocation: Option<PreferredAllocationFn>,
}

impl AllocationHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocate<F>(mut self, hook: F) -> Self
    where
        F: Fn(AllocateRequest) -> BoxFuture<'static, Result<AllocateResponse, HookError>>
            + Send
            + Sync
            + 'static,
    {
        self.allocate = Some(Arc::new(hook));
        self
    }

    pub fn with_post_allocate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut AllocateResponse) -> Result<(), Status> + Send + Sync + 'static,
    {
        self.post_allocate = Some(Arc::new(hook));
        self
    }

    pub fn with_pre_start_container<F>(mut self, hook: F) -> Self
    where
        F: Fn(PreStartContainerRequest) -> BoxFuture<'static, Result<(), Status>>
            + Send
            + Sync
            + 'static,
    {
        self.pre_start_container = Some(Arc::new(hook));
        self
    }

    pub fn with_preferred_allocation<F>(mut self, hook: F) -> Self
    where
        F: Fn(PreferredAllocationRequest) -> BoxFuture<'static, Result<PreferredAllocationResponse, Status>>
            + Send
            + Sync
            + 'static,
    {
        self.preferred_allocation = Some(Arc::new(hook));
        self
    }

    /// Options announced to the kubelet for the optional RPCs.
    pub fn options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: self.pre_start_container.is_some(),
            get_preferred_allocation_available: self.preferred_allocation.is_some(),
        }
    }
}

impl fmt::Debug for AllocationHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationHooks")
            .field("allocate", &self.allocate.is_some())
            .field("post_allocate", &self.post_allocate.is_some())
            .field("pre_start_container", &self.pre_start_container.is_some())
            .field("preferred_allocation", &self.preferred_allocation.is_some())
            .finish()
    }
}

//! Kubernetes device plugin runtime.
//!
//! [`framework`] turns device scans into kubelet facing gRPC servers, one per
//! resource type. [`scanner`] holds the device families served by the
//! `device-plugin` binary and [`rm`] the fractional GPU allocation hook.

pub mod api;
pub mod app;
pub mod config;
pub mod framework;
pub mod kube_client;
pub mod rm;
pub mod scanner;

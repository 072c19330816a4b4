//! vpod-daemon - the host daemon around the per-VM core.
//!
//! Owns the pod registry, the persistent store, the migration controller
//! and the HTTP surface. Everything VM-side lives in `vpod-vmm`.

pub mod api;
pub mod config;
pub mod error;
pub mod migrate;
pub mod registry;
pub mod store;

use std::sync::Arc;

use tokio::sync::mpsc;

use registry::PodRegistry;
use vpod_vmm::vm::VmLifecycle;

/// Drain coordinator lifecycle events into the registry. Runs outside the
/// registry lock so coordinators never block on it.
pub async fn run_lifecycle(registry: Arc<PodRegistry>, mut rx: mpsc::Receiver<VmLifecycle>) {
    while let Some(event) = rx.recv().await {
        registry.handle_lifecycle(event).await;
    }
}

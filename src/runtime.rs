//! Process-wide [`VirtualMemory`] instance.
//!
//! Applications that do not want to thread an `Arc<VirtualMemory>` through
//! their code install one here at startup and fetch it with [`global`].

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::VirtualMemory;
use parking_lot::RwLock;
use std::sync::Arc;

static GLOBAL_VM: RwLock<Option<Arc<VirtualMemory>>> = RwLock::new(None);

/// Installs a global allocator with the default config.
pub fn init() -> Result<Arc<VirtualMemory>> {
    init_with_config(Config::default())
}

/// Installs a global allocator.
///
/// Fails with [`Error::AlreadyInitialized`] if one is already installed.
pub fn init_with_config(config: Config) -> Result<Arc<VirtualMemory>> {
    let mut global = GLOBAL_VM.write();
    if global.is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let vm = Arc::new(VirtualMemory::new(config)?);
    *global = Some(vm.clone());

    tracing::info!("global virtual memory allocator installed");
    Ok(vm)
}

/// The installed global allocator.
pub fn global() -> Result<Arc<VirtualMemory>> {
    GLOBAL_VM.read().clone().ok_or(Error::NotInitialized)
}

/// Uninstalls the global allocator.
///
/// The allocator itself lives on until the last `Arc` to it is dropped.
pub fn shutdown() {
    if GLOBAL_VM.write().take().is_some() {
        tracing::info!("global virtual memory allocator removed");
    }
}

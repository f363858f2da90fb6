//! Global registry of device providers.
//!
//! Device crates register a provider under their backend name; the framework asks every
//! registered provider for its devices when it is constructed. Providers are plain functions so
//! that enumeration (a hardware or toolchain query) happens lazily and can be repeated.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::{debug, info};

use super::Device;

/// Factory returning the devices a backend currently exposes.
pub type DeviceProvider = Box<dyn Fn() -> Vec<Arc<dyn Device>> + Send + Sync>;

static PROVIDERS: Lazy<RwLock<BTreeMap<String, DeviceProvider>>> =
    Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Registers (or replaces) the provider for `backend`.
pub fn register_device_provider<F>(backend: impl Into<String>, provider: F)
where
    F: Fn() -> Vec<Arc<dyn Device>> + Send + Sync + 'static,
{
    let backend = backend.into();
    debug!(backend = %backend, "registering device provider");
    PROVIDERS
        .write()
        .expect("device registry poisoned")
        .insert(backend, Box::new(provider));
}

/// Queries every registered provider.
pub fn enumerate_devices() -> Vec<Arc<dyn Device>> {
    let providers = PROVIDERS.read().expect("device registry poisoned");
    let mut devices = Vec::new();
    for (backend, provider) in providers.iter() {
        let found = provider();
        info!(backend = %backend, count = found.len(), "enumerated devices");
        devices.extend(found);
    }
    devices
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::context::ComputeContext;
use crate::device::{registry, Device};
use crate::error::{ComputeError, ComputeResult};

/// Directory of devices, each owning one persistent [`ComputeContext`].
pub struct ComputeFramework {
    contexts: BTreeMap<String, Arc<Mutex<ComputeContext>>>,
}

impl ComputeFramework {
    /// Builds the directory from every provider in the device registry.
    pub fn new() -> Self {
        Self::with_devices(registry::enumerate_devices())
    }

    pub fn with_devices(devices: Vec<Arc<dyn Device>>) -> Self {
        let mut contexts = BTreeMap::new();
        for device in devices {
            let name = device.info().identifier();
            if contexts.contains_key(&name) {
                warn!(device = %name, "duplicate device name, keeping the first");
                continue;
            }
            debug!(device = %name, "registered compute context");
            contexts.insert(name, Arc::new(Mutex::new(ComputeContext::new(device))));
        }
        Self { contexts }
    }

    /// Sorted device identifiers (`<backend>/<index-or-DEFAULT>/<device-name>`).
    pub fn available_devices(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    pub fn context(&self, name: &str) -> ComputeResult<Arc<Mutex<ComputeContext>>> {
        self.contexts.get(name).cloned().ok_or_else(|| {
            ComputeError::usage(
                "context",
                format!(
                    "device '{name}' not found. Available devices: {}",
                    self.available_devices().join(",")
                ),
            )
        })
    }
}

impl Default for ComputeFramework {
    fn default() -> Self {
        Self::new()
    }
}

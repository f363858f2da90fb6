pub mod cpu;

use std::sync::Arc;

use mcgraph::device::Device;

pub use cpu::RefCpuDevice;

/// Register the interpreting host device with the global device registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the device is registered.
pub fn register_ref_cpu_device() {
    mcgraph::device::registry::register_device_provider("RefCpu", || {
        vec![Arc::new(RefCpuDevice::new()) as Arc<dyn Device>]
    });
}

// Auto-register on library load
#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_REF_CPU_DEVICE: extern "C" fn() = {
    extern "C" fn register() {
        register_ref_cpu_device();
    }
    register
};

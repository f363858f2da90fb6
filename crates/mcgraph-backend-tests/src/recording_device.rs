use std::sync::{Arc, Mutex};

use mcgraph::device::{
    BufferId, Device, DeviceInfo, DeviceResult, KernelBindings, ModuleId,
};
use mcgraph::graph::KernelProgram;

/// Test-only device wrapper that records every build and launch before forwarding it.
pub struct RecordingDevice {
    inner: Arc<dyn Device>,
    builds: Mutex<Vec<Arc<KernelProgram>>>,
    launches: Mutex<Vec<(ModuleId, usize)>>,
    releases: Mutex<usize>,
}

impl RecordingDevice {
    pub fn new(inner: Arc<dyn Device>) -> Self {
        Self {
            inner,
            builds: Mutex::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
            releases: Mutex::new(0),
        }
    }

    pub fn built_programs(&self) -> Vec<Arc<KernelProgram>> {
        self.builds.lock().expect("device mutex poisoned").clone()
    }

    pub fn last_program_or_panic(&self) -> Arc<KernelProgram> {
        self.built_programs()
            .pop()
            .expect("device should have built a program")
    }

    /// Kernel indices launched so far, in order.
    pub fn launched_kernels(&self) -> Vec<usize> {
        self.launches
            .lock()
            .expect("device mutex poisoned")
            .iter()
            .map(|(_, kernel)| *kernel)
            .collect()
    }

    pub fn clear_launches(&self) {
        self.launches.lock().expect("device mutex poisoned").clear();
    }

    pub fn released_buffers(&self) -> usize {
        *self.releases.lock().expect("device mutex poisoned")
    }
}

impl Device for RecordingDevice {
    fn info(&self) -> DeviceInfo {
        let inner = self.inner.info();
        DeviceInfo::new(format!("Recording{}", inner.backend), inner.index, inner.name)
    }

    fn allocate(&self, len: usize) -> DeviceResult<BufferId> {
        self.inner.allocate(len)
    }

    fn release(&self, buffer: BufferId) -> DeviceResult<()> {
        *self.releases.lock().expect("device mutex poisoned") += 1;
        self.inner.release(buffer)
    }

    fn upload(&self, buffer: BufferId, offset: usize, data: &[f64]) -> DeviceResult<()> {
        self.inner.upload(buffer, offset, data)
    }

    fn download(&self, buffer: BufferId, offset: usize, out: &mut [f64]) -> DeviceResult<()> {
        self.inner.download(buffer, offset, out)
    }

    fn copy(
        &self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    ) -> DeviceResult<()> {
        self.inner.copy(src, src_offset, dst, dst_offset, len)
    }

    fn build(&self, program: &Arc<KernelProgram>) -> DeviceResult<ModuleId> {
        self.builds
            .lock()
            .expect("device mutex poisoned")
            .push(Arc::clone(program));
        self.inner.build(program)
    }

    fn release_module(&self, module: ModuleId) -> DeviceResult<()> {
        self.inner.release_module(module)
    }

    fn launch(&self, module: ModuleId, kernel: usize, bindings: &KernelBindings) -> DeviceResult<()> {
        self.launches
            .lock()
            .expect("device mutex poisoned")
            .push((module, kernel));
        self.inner.launch(module, kernel, bindings)
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mcgraph::device::{
    BindingRole, BoundBuffers, BufferId, Device, DeviceError, DeviceInfo, DeviceResult, HostHeap,
    KernelBindings, ModuleId,
};
use mcgraph::graph::{Kernel, KernelKind, KernelOp, KernelProgram, PATH_BLOCK};
use mcgraph::ir::Operand;
use mcgraph::numeric::{apply_elementwise, selected};
use mcgraph::regression::evaluate_terms;
use smallvec::SmallVec;
use tracing::debug;

/// Device that interprets lowered kernel programs on the host, one path at a time.
///
/// It needs no toolchain and serves as the portable default and as the conformance baseline
/// for compiled devices.
#[derive(Default)]
pub struct RefCpuDevice {
    heap: Mutex<HostHeap>,
    modules: Mutex<HashMap<ModuleId, Arc<KernelProgram>>>,
    next_module: AtomicU64,
}

impl RefCpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_buffers(&self) -> usize {
        self.heap.lock().expect("host heap poisoned").live_buffers()
    }

    pub fn live_modules(&self) -> usize {
        self.modules.lock().expect("module table poisoned").len()
    }
}

impl Device for RefCpuDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo::new("RefCpu", None, "Host")
    }

    fn allocate(&self, len: usize) -> DeviceResult<BufferId> {
        Ok(self.heap.lock().expect("host heap poisoned").allocate(len))
    }

    fn release(&self, buffer: BufferId) -> DeviceResult<()> {
        self.heap.lock().expect("host heap poisoned").release(buffer)
    }

    fn upload(&self, buffer: BufferId, offset: usize, data: &[f64]) -> DeviceResult<()> {
        self.heap
            .lock()
            .expect("host heap poisoned")
            .upload(buffer, offset, data)
    }

    fn download(&self, buffer: BufferId, offset: usize, out: &mut [f64]) -> DeviceResult<()> {
        self.heap
            .lock()
            .expect("host heap poisoned")
            .download(buffer, offset, out)
    }

    fn copy(
        &self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    ) -> DeviceResult<()> {
        self.heap
            .lock()
            .expect("host heap poisoned")
            .copy(src, src_offset, dst, dst_offset, len)
    }

    fn build(&self, program: &Arc<KernelProgram>) -> DeviceResult<ModuleId> {
        let id = ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(module = %id, kernels = program.kernels.len(), "registered interpreted module");
        self.modules
            .lock()
            .expect("module table poisoned")
            .insert(id, Arc::clone(program));
        Ok(id)
    }

    fn release_module(&self, module: ModuleId) -> DeviceResult<()> {
        self.modules
            .lock()
            .expect("module table poisoned")
            .remove(&module)
            .map(|_| ())
            .ok_or(DeviceError::UnknownModule(module))
    }

    fn launch(&self, module: ModuleId, kernel: usize, bindings: &KernelBindings) -> DeviceResult<()> {
        let program = self
            .modules
            .lock()
            .expect("module table poisoned")
            .get(&module)
            .cloned()
            .ok_or(DeviceError::UnknownModule(module))?;
        let kernel = program.kernels.get(kernel).ok_or_else(|| {
            DeviceError::execution(format!("{module} has no kernel {kernel}"))
        })?;

        let mut heap = self.heap.lock().expect("host heap poisoned");
        let mut frame = heap.bind(bindings)?;
        let result = match kernel.kind {
            KernelKind::Paths => run_paths(&program, kernel, &mut frame),
            KernelKind::Reduce => run_reduce(&program, kernel, &mut frame),
        };
        heap.unbind(frame);
        result
    }
}

fn operand(frame: &BoundBuffers, locals: &[f64], operand: &Operand, tid: usize) -> DeviceResult<f64> {
    match *operand {
        Operand::Input { offset, scalar } => {
            frame.read(BindingRole::Input, if scalar { offset } else { offset + tid })
        }
        Operand::Variate { offset } => frame.read(BindingRole::Variates, offset + tid),
        Operand::Local(id) => locals
            .get(id)
            .copied()
            .ok_or_else(|| DeviceError::execution(format!("local {id} outside the value table"))),
        Operand::Spilled { offset } => frame.read(BindingRole::Values, offset + tid),
        Operand::Result { index } => frame.read(BindingRole::Results, index),
    }
}

fn run_paths(program: &KernelProgram, kernel: &Kernel, frame: &mut BoundBuffers) -> DeviceResult<()> {
    let n = program.paths;
    let blocks = program.blocks;
    for slot in &kernel.reset_slots {
        let partials = frame.get_mut(BindingRole::Partials)?;
        let range = slot * blocks..(slot + 1) * blocks;
        let len = partials.len();
        partials
            .get_mut(range)
            .ok_or_else(|| DeviceError::execution(format!("partials hold {len} elements")))?
            .fill(0.0);
    }

    let mut locals = vec![0.0; program.variable_count];
    let mut args: SmallVec<[f64; 4]> = SmallVec::new();
    let mut point = Vec::new();
    let mut row = Vec::new();
    for tid in 0..n {
        for kernel_op in &kernel.ops {
            match kernel_op {
                KernelOp::Assign {
                    result, op, args: operands, ..
                } => {
                    args.clear();
                    for arg in operands {
                        args.push(operand(frame, &locals, arg, tid)?);
                    }
                    let value = apply_elementwise(*op, &args).ok_or_else(|| {
                        DeviceError::execution(format!("{op} has no pointwise kernel"))
                    })?;
                    locals[*result] = program.precision.round(value);
                }
                KernelOp::Predict {
                    result,
                    basis_offset,
                    basis_size,
                } => {
                    let mut value = 0.0;
                    for i in 0..*basis_size {
                        value += frame.read(BindingRole::Basis, (basis_offset + i) * n + tid)?
                            * frame.read(BindingRole::Coeffs, basis_offset + i)?;
                    }
                    locals[*result] = program.precision.round(value);
                }
                KernelOp::PartialSum {
                    value,
                    filter,
                    slot,
                } => {
                    if selected(operand(frame, &locals, filter, tid)?) {
                        let value = operand(frame, &locals, value, tid)?;
                        let index = slot * blocks + tid / PATH_BLOCK;
                        let sum = frame.read(BindingRole::Partials, index)? + value;
                        frame.write(BindingRole::Partials, index, sum)?;
                    }
                }
                KernelOp::Basis {
                    regression,
                    basis_offset,
                    terms,
                    regressors,
                    value,
                    filter,
                } => {
                    point.clear();
                    for regressor in regressors {
                        point.push(operand(frame, &locals, regressor, tid)?);
                    }
                    evaluate_terms(terms, &point, &mut row);
                    let keep = selected(operand(frame, &locals, filter, tid)?);
                    for (i, b) in row.iter().enumerate() {
                        let index = (basis_offset + i) * n + tid;
                        frame.write(BindingRole::Basis, index, *b)?;
                        frame.write(BindingRole::Design, index, if keep { *b } else { 0.0 })?;
                    }
                    let target = if keep {
                        operand(frame, &locals, value, tid)?
                    } else {
                        0.0
                    };
                    frame.write(BindingRole::Target, regression * n + tid, target)?;
                }
                KernelOp::Spill { source, offset } => {
                    let value = operand(frame, &locals, &Operand::Local(*source), tid)?;
                    frame.write(BindingRole::Values, offset + tid, value)?;
                }
                KernelOp::Output { source, index } => {
                    let value = operand(frame, &locals, source, tid)?;
                    frame.write(BindingRole::Output, index * n + tid, value)?;
                }
                KernelOp::Combine { .. } => {
                    return Err(DeviceError::execution(format!(
                        "{} is a path kernel and cannot combine partial sums",
                        kernel.name
                    )))
                }
            }
        }
    }
    Ok(())
}

fn run_reduce(program: &KernelProgram, kernel: &Kernel, frame: &mut BoundBuffers) -> DeviceResult<()> {
    for op in &kernel.ops {
        let KernelOp::Combine { slot } = op else {
            return Err(DeviceError::execution(format!(
                "{} is a reduce kernel and only combines partial sums",
                kernel.name
            )));
        };
        let mut sum = 0.0;
        for block in 0..program.blocks {
            sum += frame.read(BindingRole::Partials, slot * program.blocks + block)?;
        }
        frame.write(BindingRole::Results, *slot, sum / program.paths as f64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use mcgraph::graph::{lower, GraphRecorder};
    use mcgraph::ir::OpCode;
    use mcgraph::settings::Precision;

    use super::*;

    fn bind(device: &RefCpuDevice, program: &KernelProgram, input: &[f64]) -> KernelBindings {
        let alloc = |len: usize| (len > 0).then(|| device.allocate(len).unwrap());
        let bindings = KernelBindings {
            input: alloc(program.layout.input),
            values: alloc(program.layout.values),
            partials: alloc(program.layout.partials),
            results: alloc(program.layout.results),
            basis: alloc(program.layout.basis),
            design: alloc(program.layout.basis),
            target: alloc(program.layout.target),
            coeffs: alloc(program.layout.coeffs),
            output: alloc(program.layout.output),
            ..KernelBindings::default()
        };
        if let Some(buffer) = bindings.input {
            device.upload(buffer, 0, input).unwrap();
        }
        bindings
    }

    #[test]
    fn interprets_expectation_kernels() {
        let mut graph = GraphRecorder::new(4, 4);
        let a = graph.add_scalar_input(2.0);
        let b = graph.add_vector_input(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let one = graph.add_scalar_input(1.0);
        let c = graph.record(OpCode::Mult, &[a, b]).unwrap();
        let e = graph
            .record(OpCode::ConditionalExpectation, &[c, one])
            .unwrap();
        graph.declare_output(e).unwrap();
        let program = Arc::new(lower(&graph, Precision::Double).unwrap());

        let device = RefCpuDevice::new();
        let module = device.build(&program).unwrap();
        let bindings = bind(&device, &program, graph.staging());
        for kernel in 0..program.kernels.len() {
            device.launch(module, kernel, &bindings).unwrap();
        }
        let mut out = vec![0.0; 4];
        device.download(bindings.output.unwrap(), 0, &mut out).unwrap();
        for value in out {
            assert_relative_eq!(value, 5.0);
        }
        assert_eq!(device.live_buffers(), 4);
    }

    #[test]
    fn single_precision_rounds_locals() {
        let mut graph = GraphRecorder::new(1, 4);
        let x = graph.add_scalar_input(0.1);
        let y = graph.record(OpCode::None, &[x]).unwrap();
        graph.declare_output(y).unwrap();
        let program = Arc::new(lower(&graph, Precision::Single).unwrap());

        let device = RefCpuDevice::new();
        let module = device.build(&program).unwrap();
        let bindings = bind(&device, &program, graph.staging());
        device.launch(module, 0, &bindings).unwrap();
        let mut out = [0.0];
        device.download(bindings.output.unwrap(), 0, &mut out).unwrap();
        assert_eq!(out[0], 0.1f32 as f64);
    }

    #[test]
    fn unbound_buffer_is_reported_and_heap_restored() {
        let mut graph = GraphRecorder::new(2, 4);
        let x = graph.add_vector_input(&[1.0, 2.0]).unwrap();
        graph.declare_output(x).unwrap();
        let program = Arc::new(lower(&graph, Precision::Double).unwrap());

        let device = RefCpuDevice::new();
        let module = device.build(&program).unwrap();
        let input = device.allocate(2).unwrap();
        let bindings = KernelBindings {
            input: Some(input),
            ..KernelBindings::default()
        };
        let err = device.launch(module, 0, &bindings).unwrap_err();
        assert!(err.to_string().contains("output buffer is not bound"));
        device.release(input).unwrap();
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn released_module_cannot_launch() {
        let device = RefCpuDevice::new();
        let graph = GraphRecorder::new(1, 4);
        let program = Arc::new(lower(&graph, Precision::Double).unwrap());
        let module = device.build(&program).unwrap();
        device.release_module(module).unwrap();
        assert!(matches!(
            device.launch(module, 0, &KernelBindings::default()),
            Err(DeviceError::UnknownModule(_))
        ));
        assert_eq!(device.live_modules(), 0);
    }
}

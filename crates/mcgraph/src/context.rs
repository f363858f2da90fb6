//! Compute context: the stateful calculation API of one device.
//!
//! A calculation goes through `initiate_calculation`, input and variate registration,
//! `apply_operation` calls and output declarations, and ends with `finalize_calculation`. The
//! first finalize of a (slot, version) lowers the recording and builds one device module; later
//! finalizes of the same version only resupply inputs and rerun the cached module.
//!
//! ```text
//!  Idle --initiate--> CreateInput --variates--> CreateVariates --apply--> Calc
//!    ^                    |                                          |
//!    +------------------- finalize (always, also on failure) <-------+
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::debug::DebugInfo;
use crate::device::{BufferId, Device, DeviceError, DeviceInfo, KernelBindings, ModuleId};
use crate::error::{ComputeError, ComputeResult};
use crate::graph::{lower, BufferLayout, GraphRecorder, KernelProgram, SolveGroup, Step};
use crate::ir::{OpCode, VariableId};
use crate::memory::{DeviceArena, Generation, VariatePool};
use crate::reference::Recording;
use crate::regression::LeastSquaresWorkspace;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeState {
    Idle,
    CreateInput,
    CreateVariates,
    Calc,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChainBuffers {
    values: Option<BufferId>,
    partials: Option<BufferId>,
    results: Option<BufferId>,
    basis: Option<BufferId>,
    design: Option<BufferId>,
    target: Option<BufferId>,
    coeffs: Option<BufferId>,
}

struct CompiledChain {
    module: ModuleId,
    program: Arc<KernelProgram>,
    buffers: ChainBuffers,
    /// Scalar flag of every input the chain was compiled against.
    input_kinds: Vec<bool>,
}

/// Everything the context keeps about one calculation slot.
struct SlotRecord {
    id: usize,
    paths: usize,
    version: usize,
    disposed: bool,
    graph: GraphRecorder,
    chain: Option<CompiledChain>,
}

impl SlotRecord {
    fn generation(&self) -> Generation {
        Generation {
            slot: self.id,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OutputBuffer {
    buffer: BufferId,
    paths: usize,
    count: usize,
}

fn backend_error(
    op: &'static str,
    generation: Generation,
) -> impl FnOnce(DeviceError) -> ComputeError {
    move |source| ComputeError::Backend {
        op,
        slot: generation.slot,
        version: generation.version,
        source,
    }
}

pub struct ComputeContext {
    device: Arc<dyn Device>,
    state: ComputeState,
    current: Option<usize>,
    settings: Settings,
    slots: Vec<SlotRecord>,
    arena: DeviceArena,
    variates: VariatePool,
    output: Option<OutputBuffer>,
    staging: Vec<BufferId>,
    debug: DebugInfo,
}

impl ComputeContext {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            state: ComputeState::Idle,
            current: None,
            settings: Settings::default(),
            slots: Vec::new(),
            arena: DeviceArena::new(),
            variates: VariatePool::new(),
            output: None,
            staging: Vec::new(),
            debug: DebugInfo::default(),
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.device.info()
    }

    pub fn state(&self) -> ComputeState {
        self.state
    }

    pub fn debug_info(&self) -> DebugInfo {
        self.debug
    }

    pub fn reset_debug_info(&mut self) {
        self.debug = DebugInfo::default();
    }

    /// Device buffers currently owned by the live generation of slot `id`.
    pub fn allocated_buffers(&self, id: usize) -> usize {
        match id.checked_sub(1).and_then(|index| self.slots.get(index)) {
            Some(slot) => self.arena.live_buffers(slot.generation()),
            None => 0,
        }
    }

    /// Current capacity of the shared variate pool, in draws.
    pub fn variate_capacity(&self) -> usize {
        self.variates.capacity()
    }

    /// Snapshot of the calculation in progress, for the host reference interpreter.
    pub fn recording(&self) -> Option<Recording> {
        let index = self.current?;
        Some(self.slots[index].graph.recording(self.settings))
    }

    /// Starts recording or re-evaluating a calculation and returns `(slot id, is new build)`.
    ///
    /// `id == 0` allocates a new slot. For an existing slot a changed `version` (or a slot that
    /// never finished a build) discards the old chain and starts a fresh recording; otherwise the
    /// compiled chain is reused and the caller only resupplies inputs.
    pub fn initiate_calculation(
        &mut self,
        paths: usize,
        id: usize,
        version: usize,
        settings: Settings,
    ) -> ComputeResult<(usize, bool)> {
        const OP: &str = "initiate_calculation";
        if self.state != ComputeState::Idle {
            return Err(ComputeError::usage(
                OP,
                format!("context is not idle (state {:?})", self.state),
            ));
        }
        if paths == 0 {
            return Err(ComputeError::usage(OP, "number of paths must be positive"));
        }

        let (index, is_new) = if id == 0 {
            let id = self.slots.len() + 1;
            self.slots.push(SlotRecord {
                id,
                paths,
                version,
                disposed: false,
                graph: GraphRecorder::new(paths, settings.regression_order),
                chain: None,
            });
            (id - 1, true)
        } else {
            let index = self.slot_index(OP, id)?;
            if self.slots[index].paths != paths {
                return Err(ComputeError::usage(
                    OP,
                    format!(
                        "slot {id} was created with {} paths, got {paths}",
                        self.slots[index].paths
                    ),
                ));
            }
            if self.slots[index].version != version || self.slots[index].chain.is_none() {
                self.release_chain(index);
                let slot = &mut self.slots[index];
                slot.version = version;
                slot.graph = GraphRecorder::new(paths, settings.regression_order);
                (index, true)
            } else {
                self.slots[index].graph.clear_inputs();
                (index, false)
            }
        };

        self.settings = settings;
        self.current = Some(index);
        self.state = ComputeState::CreateInput;
        let slot = &self.slots[index];
        debug!(slot = slot.id, version = slot.version, paths, is_new, "initiated calculation");
        Ok((slot.id, is_new))
    }

    /// Registers a scalar input, broadcast to every path.
    pub fn create_input_variable(&mut self, value: f64) -> ComputeResult<VariableId> {
        let index = self.input_slot("create_input_variable", true)?;
        Ok(self.slots[index].graph.add_scalar_input(value))
    }

    /// Registers a per-path input; `values` must hold one entry per path.
    pub fn create_input_vector(&mut self, values: &[f64]) -> ComputeResult<VariableId> {
        let index = self.input_slot("create_input_variable", false)?;
        self.slots[index].graph.add_vector_input(values)
    }

    fn input_slot(&self, op: &'static str, scalar: bool) -> ComputeResult<usize> {
        let index = self.current_index(op, &[ComputeState::CreateInput])?;
        let slot = &self.slots[index];
        if let Some(chain) = &slot.chain {
            let position = slot.graph.input_slots().len();
            match chain.input_kinds.get(position) {
                Some(compiled) if *compiled == scalar => {}
                Some(compiled) => {
                    return Err(ComputeError::usage(
                        op,
                        format!(
                            "input {position} was compiled as {}, got {}",
                            kind_label(*compiled),
                            kind_label(scalar)
                        ),
                    ))
                }
                None => {
                    return Err(ComputeError::usage(
                        op,
                        format!(
                            "compiled graph of slot {} takes {} inputs",
                            slot.id,
                            chain.input_kinds.len()
                        ),
                    ))
                }
            }
        }
        Ok(index)
    }

    /// Registers `dim * steps` standard-normal draws per path; `ids[i][j]` is dimension `i`,
    /// step `j`.
    pub fn create_input_variates(
        &mut self,
        dim: usize,
        steps: usize,
    ) -> ComputeResult<Vec<Vec<VariableId>>> {
        const OP: &str = "create_input_variates";
        let index = self.current_index(
            OP,
            &[ComputeState::CreateInput, ComputeState::CreateVariates],
        )?;
        self.ensure_not_compiled(OP, index)?;
        self.state = ComputeState::CreateVariates;

        let slot = &mut self.slots[index];
        let ids: Vec<VariableId> = slot.graph.add_variates(dim * steps).collect();
        let required = slot.graph.variate_count() * slot.paths;
        let generation = slot.generation();
        let paths = slot.paths;

        let start = Instant::now();
        self.variates
            .ensure(self.device.as_ref(), required, self.settings.rng_seed)
            .map_err(backend_error(OP, generation))?;
        if self.settings.debug {
            self.debug.add_data_copy(start.elapsed());
            self.debug.add_operations(paths * dim * steps);
        }

        Ok((0..dim)
            .map(|i| ids[i * steps..(i + 1) * steps].to_vec())
            .collect())
    }

    /// Records one operation and returns the id of its result.
    pub fn apply_operation(&mut self, op: OpCode, args: &[VariableId]) -> ComputeResult<VariableId> {
        const OP: &str = "apply_operation";
        let index = self.current_index(
            OP,
            &[
                ComputeState::CreateInput,
                ComputeState::CreateVariates,
                ComputeState::Calc,
            ],
        )?;
        self.ensure_not_compiled(OP, index)?;
        self.state = ComputeState::Calc;
        let slot = &mut self.slots[index];
        let id = slot.graph.record(op, args)?;
        if self.settings.debug {
            self.debug.add_operations(slot.paths);
        }
        Ok(id)
    }

    /// [`ComputeContext::apply_operation`] addressed by numeric op code.
    pub fn apply_operation_code(
        &mut self,
        code: usize,
        args: &[VariableId],
    ) -> ComputeResult<VariableId> {
        let op = OpCode::from_code(code).ok_or_else(|| {
            ComputeError::internal("apply_operation", format!("no implementation for op code {code}"))
        })?;
        self.apply_operation(op, args)
    }

    pub fn free_variable(&mut self, id: VariableId) -> ComputeResult<()> {
        const OP: &str = "free_variable";
        let index = self.current_index(OP, &[ComputeState::Calc])?;
        self.ensure_not_compiled(OP, index)?;
        self.slots[index].graph.free(id)?;
        Ok(())
    }

    pub fn declare_output_variable(&mut self, id: VariableId) -> ComputeResult<()> {
        const OP: &str = "declare_output_variable";
        let index = self.current_index(
            OP,
            &[
                ComputeState::CreateInput,
                ComputeState::CreateVariates,
                ComputeState::Calc,
            ],
        )?;
        self.ensure_not_compiled(OP, index)?;
        self.slots[index].graph.declare_output(id)
    }

    /// Builds (first time) and runs the calculation, filling one buffer of `paths` values per
    /// declared output. The context is idle afterwards, whether or not the call succeeded.
    pub fn finalize_calculation(&mut self, outputs: &mut [&mut [f64]]) -> ComputeResult<()> {
        let scope = FinalizeScope { context: self };
        scope.context.run_finalize(outputs)
    }

    /// [`ComputeContext::finalize_calculation`] into freshly allocated buffers.
    pub fn finalize_to_vec(&mut self) -> ComputeResult<Vec<Vec<f64>>> {
        let (paths, count) = match self.current {
            Some(index) => {
                let slot = &self.slots[index];
                (slot.paths, slot.graph.outputs().len())
            }
            None => (0, 0),
        };
        let mut buffers = vec![vec![0.0; paths]; count];
        let mut views: Vec<&mut [f64]> = buffers.iter_mut().map(Vec::as_mut_slice).collect();
        self.finalize_calculation(&mut views)?;
        Ok(buffers)
    }

    /// Releases the compiled chain and memory of slot `id`; the id can no longer be used.
    pub fn dispose_calculation(&mut self, id: usize) -> ComputeResult<()> {
        const OP: &str = "dispose_calculation";
        let index = self.slot_index(OP, id).map_err(|err| match err {
            ComputeError::Usage { message, .. } if message.contains("disposed") => {
                ComputeError::usage(OP, format!("slot {id} is already disposed"))
            }
            other => other,
        })?;
        self.release_chain(index);
        let slot = &mut self.slots[index];
        slot.disposed = true;
        slot.graph = GraphRecorder::new(slot.paths, 0);
        if self.current == Some(index) {
            self.current = None;
            self.state = ComputeState::Idle;
        }
        debug!(slot = id, "disposed calculation");
        Ok(())
    }

    fn slot_index(&self, op: &'static str, id: usize) -> ComputeResult<usize> {
        let index = id
            .checked_sub(1)
            .filter(|index| *index < self.slots.len())
            .ok_or_else(|| {
                ComputeError::usage(
                    op,
                    format!("slot {id} is out of range 1..={}", self.slots.len()),
                )
            })?;
        if self.slots[index].disposed {
            return Err(ComputeError::usage(op, format!("slot {id} is disposed")));
        }
        Ok(index)
    }

    fn current_index(&self, op: &'static str, allowed: &[ComputeState]) -> ComputeResult<usize> {
        if !allowed.contains(&self.state) {
            return Err(ComputeError::usage(
                op,
                format!("not allowed in state {:?}", self.state),
            ));
        }
        self.current
            .ok_or_else(|| ComputeError::usage(op, "no calculation in progress"))
    }

    fn ensure_not_compiled(&self, op: &'static str, index: usize) -> ComputeResult<()> {
        let slot = &self.slots[index];
        if slot.chain.is_some() {
            return Err(ComputeError::usage(
                op,
                format!(
                    "slot {} in version {} already has a compiled chain",
                    slot.id, slot.version
                ),
            ));
        }
        Ok(())
    }

    fn release_chain(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let generation = slot.generation();
        if let Some(chain) = slot.chain.take() {
            if let Err(err) = self.device.release_module(chain.module) {
                warn!(
                    slot = generation.slot,
                    version = generation.version,
                    module = %chain.module,
                    error = %err,
                    "failed to release compiled module"
                );
            }
        }
        self.arena.release_generation(self.device.as_ref(), generation);
    }

    fn run_finalize(&mut self, outputs: &mut [&mut [f64]]) -> ComputeResult<()> {
        const OP: &str = "finalize_calculation";
        let index = self.current_index(
            OP,
            &[
                ComputeState::CreateInput,
                ComputeState::CreateVariates,
                ComputeState::Calc,
            ],
        )?;
        let slot = &self.slots[index];
        let paths = slot.paths;
        let generation = slot.generation();
        let expected = slot.graph.outputs().len();
        if outputs.len() != expected {
            return Err(ComputeError::usage(
                OP,
                format!("{expected} outputs declared, got {} buffers", outputs.len()),
            ));
        }
        if let Some(buffer) = outputs.iter().find(|buffer| buffer.len() != paths) {
            return Err(ComputeError::usage(
                OP,
                format!("output buffers need {paths} values, got {}", buffer.len()),
            ));
        }

        self.ensure_chain(index)?;
        let input = self.upload_inputs(index)?;

        let required = self.slots[index].graph.variate_count() * paths;
        self.variates
            .ensure(self.device.as_ref(), required, self.settings.rng_seed)
            .map_err(backend_error(OP, generation))?;
        self.ensure_output_buffer(generation, paths, expected)?;

        self.execute(index, input)?;

        if let Some(output) = self.output.filter(|_| expected > 0) {
            let start = Instant::now();
            for (i, buffer) in outputs.iter_mut().enumerate() {
                self.device
                    .download(output.buffer, i * paths, &mut **buffer)
                    .map_err(backend_error(OP, generation))?;
            }
            if self.settings.debug {
                self.debug.add_data_copy(start.elapsed());
            }
        }
        Ok(())
    }

    fn ensure_chain(&mut self, index: usize) -> ComputeResult<()> {
        const OP: &str = "finalize_calculation";
        let slot = &self.slots[index];
        let generation = slot.generation();
        if let Some(chain) = &slot.chain {
            let kinds: Vec<bool> = slot.graph.input_slots().iter().map(|s| s.scalar).collect();
            if kinds != chain.input_kinds {
                return Err(ComputeError::usage(
                    OP,
                    format!(
                        "compiled graph of slot {} takes {} inputs, {} were supplied",
                        slot.id,
                        chain.input_kinds.len(),
                        kinds.len()
                    ),
                ));
            }
            debug!(slot = slot.id, version = slot.version, "reusing compiled chain");
            return Ok(());
        }

        let start = Instant::now();
        let program = lower(&slot.graph, self.settings.precision())
            .map_err(|err| ComputeError::internal(OP, err.to_string()))?;
        let program = Arc::new(program);
        let input_kinds = slot.graph.input_slots().iter().map(|s| s.scalar).collect();

        let built = self
            .allocate_chain_buffers(generation, &program.layout)
            .and_then(|buffers| {
                let module = self.device.build(&program)?;
                Ok((module, buffers))
            });
        let (module, buffers) = match built {
            Ok(built) => built,
            Err(err) => {
                self.arena.release_generation(self.device.as_ref(), generation);
                return Err(backend_error(OP, generation)(err));
            }
        };

        debug!(
            slot = generation.slot,
            version = generation.version,
            stages = program.stage_count,
            kernels = program.kernels.len(),
            "built kernel chain"
        );
        self.slots[index].chain = Some(CompiledChain {
            module,
            program,
            buffers,
            input_kinds,
        });
        if self.settings.debug {
            self.debug.add_program_build(start.elapsed());
        }
        Ok(())
    }

    fn allocate_chain_buffers(
        &mut self,
        generation: Generation,
        layout: &BufferLayout,
    ) -> Result<ChainBuffers, DeviceError> {
        let device = self.device.as_ref();
        let arena = &mut self.arena;
        let mut allocate = |label: &'static str, len: usize| -> Result<Option<BufferId>, DeviceError> {
            if len == 0 {
                return Ok(None);
            }
            arena.allocate(device, generation, label, len).map(Some)
        };
        Ok(ChainBuffers {
            values: allocate("values", layout.values)?,
            partials: allocate("partials", layout.partials)?,
            results: allocate("results", layout.results)?,
            basis: allocate("basis", layout.basis)?,
            design: allocate("design", layout.basis)?,
            target: allocate("target", layout.target)?,
            coeffs: allocate("coeffs", layout.coeffs)?,
        })
    }

    fn upload_inputs(&mut self, index: usize) -> ComputeResult<BufferId> {
        const OP: &str = "finalize_calculation";
        let slot = &self.slots[index];
        let generation = slot.generation();
        let staging = slot.graph.staging();
        let start = Instant::now();
        let buffer = self
            .device
            .allocate(staging.len().max(1))
            .map_err(backend_error(OP, generation))?;
        self.staging.push(buffer);
        if !staging.is_empty() {
            self.device
                .upload(buffer, 0, staging)
                .map_err(backend_error(OP, generation))?;
        }
        if self.settings.debug {
            self.debug.add_data_copy(start.elapsed());
        }
        Ok(buffer)
    }

    fn ensure_output_buffer(
        &mut self,
        generation: Generation,
        paths: usize,
        count: usize,
    ) -> ComputeResult<()> {
        if count == 0 {
            return Ok(());
        }
        if let Some(output) = self.output {
            if output.paths == paths && output.count == count {
                return Ok(());
            }
            if let Err(err) = self.device.release(output.buffer) {
                warn!(buffer = %output.buffer, error = %err, "failed to release output buffer");
            }
            self.output = None;
        }
        let buffer = self
            .device
            .allocate(paths * count)
            .map_err(backend_error("finalize_calculation", generation))?;
        self.output = Some(OutputBuffer {
            buffer,
            paths,
            count,
        });
        Ok(())
    }

    fn execute(&mut self, index: usize, input: BufferId) -> ComputeResult<()> {
        const OP: &str = "finalize_calculation";
        let slot = &self.slots[index];
        let generation = slot.generation();
        let chain = slot
            .chain
            .as_ref()
            .ok_or_else(|| ComputeError::internal(OP, "no compiled chain to execute"))?;
        let program = Arc::clone(&chain.program);
        let module = chain.module;
        let buffers = chain.buffers;
        let bindings = KernelBindings {
            input: Some(input),
            variates: self.variates.buffer(),
            values: buffers.values,
            partials: buffers.partials,
            results: buffers.results,
            basis: buffers.basis,
            design: buffers.design,
            target: buffers.target,
            coeffs: buffers.coeffs,
            output: self.output.filter(|_| program.output_count() > 0).map(|o| o.buffer),
        };

        for step in &program.schedule {
            match step {
                Step::Launch(kernel) => {
                    let start = Instant::now();
                    self.device
                        .launch(module, *kernel, &bindings)
                        .map_err(backend_error(OP, generation))?;
                    if self.settings.debug {
                        self.debug.add_calculation(start.elapsed());
                    }
                }
                Step::Solve(groups) => {
                    self.solve_regressions(generation, program.paths, &buffers, groups)?;
                }
            }
        }
        Ok(())
    }

    fn solve_regressions(
        &mut self,
        generation: Generation,
        paths: usize,
        buffers: &ChainBuffers,
        groups: &[SolveGroup],
    ) -> ComputeResult<()> {
        const OP: &str = "finalize_calculation";
        let missing = || ComputeError::internal(OP, "regression buffers were not allocated");
        let design_buffer = buffers.design.ok_or_else(missing)?;
        let target_buffer = buffers.target.ok_or_else(missing)?;
        let coeffs_buffer = buffers.coeffs.ok_or_else(missing)?;

        for group in groups {
            let mut workspace = LeastSquaresWorkspace::new(paths, group.basis_size);
            let mut design = vec![0.0; paths * group.basis_size];
            let mut target = vec![0.0; paths];
            for member in &group.members {
                let copy_start = Instant::now();
                self.device
                    .download(design_buffer, member.basis_offset * paths, &mut design)
                    .and_then(|()| {
                        self.device
                            .download(target_buffer, member.regression * paths, &mut target)
                    })
                    .map_err(backend_error(OP, generation))?;
                let solve_start = Instant::now();
                let coefficients = workspace.solve(&design, &target).map_err(|failure| {
                    ComputeError::Solve {
                        op: OP,
                        slot: generation.slot,
                        version: generation.version,
                        regression: member.regression,
                        paths,
                        basis_size: group.basis_size,
                        message: failure.to_string(),
                    }
                })?;
                let upload_start = Instant::now();
                self.device
                    .upload(coeffs_buffer, member.basis_offset, &coefficients)
                    .map_err(backend_error(OP, generation))?;
                if self.settings.debug {
                    self.debug.add_data_copy(solve_start - copy_start);
                    self.debug.add_calculation(upload_start - solve_start);
                    self.debug.add_data_copy(upload_start.elapsed());
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        for buffer in self.staging.drain(..) {
            if let Err(err) = self.device.release(buffer) {
                warn!(buffer = %buffer, error = %err, "failed to release staging buffer");
            }
        }
        self.current = None;
        self.state = ComputeState::Idle;
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        self.finish();
        for index in 0..self.slots.len() {
            self.release_chain(index);
        }
        self.arena.release_all(self.device.as_ref());
        self.variates.release(self.device.as_ref());
        if let Some(output) = self.output.take() {
            if let Err(err) = self.device.release(output.buffer) {
                warn!(buffer = %output.buffer, error = %err, "failed to release output buffer");
            }
        }
    }
}

/// Returns the context to idle and frees per-call staging buffers when a finalize ends, on
/// every exit path.
struct FinalizeScope<'a> {
    context: &'a mut ComputeContext,
}

impl Drop for FinalizeScope<'_> {
    fn drop(&mut self) {
        self.context.finish();
    }
}

fn kind_label(scalar: bool) -> &'static str {
    if scalar {
        "a scalar"
    } else {
        "an array"
    }
}

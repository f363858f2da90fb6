//! Lowering of a staged graph into a device-independent kernel program.
//!
//! Every stage becomes a per-path kernel; stages with expectations add a reduce kernel, and
//! stages with regressions add a host solve step. Devices either interpret the program or
//! translate it to source text, so all operand locations are already resolved here.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::ir::{Instruction, OpCode, Operand, VariableId};
use crate::regression::{monomial_terms, BasisTerm};
use crate::settings::Precision;

use super::recorder::GraphRecorder;
use super::stages::{allocate_spills, analyze, split_stages, DefinitionKind};
use super::symbols::{ResolveError, SymbolTable};

/// Paths per partial sum in the first reduction level.
pub const PATH_BLOCK: usize = 256;

/// One per-path (or, in reduce kernels, one-shot) operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelOp {
    /// `v[result] = op(args)`; `declare` marks the first definition inside the kernel,
    /// counting the kernel's `Predict` results.
    Assign {
        result: VariableId,
        declare: bool,
        op: OpCode,
        args: SmallVec<[Operand; 4]>,
    },
    /// `v[result] = sum_i basis[(offset + i) * n + tid] * coeffs[offset + i]`.
    Predict {
        result: VariableId,
        basis_offset: usize,
        basis_size: usize,
    },
    /// `partials[slot * blocks + tid / PATH_BLOCK] += value` on selected paths.
    PartialSum {
        value: Operand,
        filter: Operand,
        slot: usize,
    },
    /// Writes the unfiltered basis, the filtered design rows and the filtered target.
    Basis {
        regression: usize,
        basis_offset: usize,
        terms: Vec<BasisTerm>,
        regressors: Vec<Operand>,
        value: Operand,
        filter: Operand,
    },
    /// `values[offset + tid] = v[source]`.
    Spill { source: VariableId, offset: usize },
    /// `output[index * n + tid] = source`.
    Output { source: Operand, index: usize },
    /// Reduce kernels only: `results[slot] = sum(partials[slot * blocks ..]) / n`.
    Combine { slot: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelKind {
    /// Runs its ops once per path.
    Paths,
    /// Runs its ops once.
    Reduce,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub name: String,
    pub kind: KernelKind,
    pub stage: usize,
    /// Partial-sum slots zeroed before the first path runs.
    pub reset_slots: Vec<usize>,
    pub ops: Vec<KernelOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionSolve {
    pub regression: usize,
    pub basis_offset: usize,
}

/// Regressions of one stage sharing a basis size, solved with one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveGroup {
    pub basis_size: usize,
    pub members: Vec<RegressionSolve>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Launch(usize),
    Solve(Vec<SolveGroup>),
}

/// Element counts of the buffers a program binds. Zero means the buffer is not needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferLayout {
    pub input: usize,
    pub values: usize,
    pub partials: usize,
    pub results: usize,
    pub basis: usize,
    pub target: usize,
    pub coeffs: usize,
    pub output: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelProgram {
    pub paths: usize,
    pub blocks: usize,
    pub precision: Precision,
    /// One past the largest variable id, the size of a per-path local table.
    pub variable_count: usize,
    pub stage_count: usize,
    pub kernels: Vec<Kernel>,
    pub schedule: Vec<Step>,
    pub layout: BufferLayout,
}

impl KernelProgram {
    pub fn output_count(&self) -> usize {
        self.layout.output / self.paths.max(1)
    }
}

/// Splits, analyses and lowers everything recorded in `graph`.
pub fn lower(graph: &GraphRecorder, precision: Precision) -> Result<KernelProgram, ResolveError> {
    let paths = graph.paths();
    let instructions = graph.instructions();
    let outputs = graph.outputs();
    let plan = split_stages(instructions, outputs);
    let analysis = analyze(instructions, &plan);
    let spills = allocate_spills(instructions, &plan, &analysis, outputs);
    let blocks = paths.div_ceil(PATH_BLOCK);

    let mut kernels = Vec::new();
    let mut schedule = Vec::new();
    for stage in &plan.stages {
        let table = SymbolTable::new(
            stage.index,
            paths,
            graph.input_slots(),
            graph.variate_count(),
            &analysis,
            &spills,
        );
        let mut ops = Vec::new();
        let mut reset_slots = Vec::new();
        let mut combine = Vec::new();
        let mut groups: BTreeMap<usize, Vec<RegressionSolve>> = BTreeMap::new();
        let mut declared = HashSet::new();

        if stage.index > 0 {
            for instruction in &instructions[plan.stages[stage.index - 1].instructions.clone()] {
                let result = instruction.result();
                if let DefinitionKind::Regression {
                    basis_offset,
                    basis_size,
                    ..
                } = analysis.definitions[&result].kind
                {
                    declared.insert(result);
                    ops.push(KernelOp::Predict {
                        result,
                        basis_offset,
                        basis_size,
                    });
                }
            }
        }

        for instruction in &instructions[stage.instructions.clone()] {
            match instruction {
                Instruction::Elementwise { op, args, result } => {
                    let args = args
                        .iter()
                        .map(|id| table.resolve(*id))
                        .collect::<Result<SmallVec<_>, _>>()?;
                    ops.push(KernelOp::Assign {
                        result: *result,
                        declare: declared.insert(*result),
                        op: *op,
                        args,
                    });
                }
                Instruction::Expectation {
                    value,
                    filter,
                    result,
                } => {
                    let DefinitionKind::Expectation { slot } = analysis.definitions[result].kind
                    else {
                        unreachable!("expectation {result} analysed as another kind");
                    };
                    ops.push(KernelOp::PartialSum {
                        value: table.resolve(*value)?,
                        filter: table.resolve(*filter)?,
                        slot,
                    });
                    reset_slots.push(slot);
                    combine.push(KernelOp::Combine { slot });
                }
                Instruction::ConditionalExpectation {
                    value,
                    filter,
                    regressors,
                    order,
                    basis_size,
                    result,
                } => {
                    let DefinitionKind::Regression {
                        regression,
                        basis_offset,
                        ..
                    } = analysis.definitions[result].kind
                    else {
                        unreachable!("regression {result} analysed as another kind");
                    };
                    ops.push(KernelOp::Basis {
                        regression,
                        basis_offset,
                        terms: monomial_terms(regressors.len(), *order),
                        regressors: regressors
                            .iter()
                            .map(|id| table.resolve(*id))
                            .collect::<Result<_, _>>()?,
                        value: table.resolve(*value)?,
                        filter: table.resolve(*filter)?,
                    });
                    groups
                        .entry(*basis_size)
                        .or_default()
                        .push(RegressionSolve {
                            regression,
                            basis_offset,
                        });
                }
            }
        }

        if stage.index == plan.last_stage() {
            for (index, id) in outputs.iter().enumerate() {
                ops.push(KernelOp::Output {
                    source: table.resolve(*id)?,
                    index,
                });
            }
        }
        for id in spills.spilled_by(stage.index) {
            if let Some(position) = spills.position(*id) {
                ops.push(KernelOp::Spill {
                    source: *id,
                    offset: position * paths,
                });
            }
        }

        kernels.push(Kernel {
            name: format!("stage{}_paths", stage.index),
            kind: KernelKind::Paths,
            stage: stage.index,
            reset_slots,
            ops,
        });
        schedule.push(Step::Launch(kernels.len() - 1));
        if !combine.is_empty() {
            kernels.push(Kernel {
                name: format!("stage{}_reduce", stage.index),
                kind: KernelKind::Reduce,
                stage: stage.index,
                reset_slots: Vec::new(),
                ops: combine,
            });
            schedule.push(Step::Launch(kernels.len() - 1));
        }
        if !groups.is_empty() {
            schedule.push(Step::Solve(
                groups
                    .into_iter()
                    .map(|(basis_size, members)| SolveGroup {
                        basis_size,
                        members,
                    })
                    .collect(),
            ));
        }
    }

    Ok(KernelProgram {
        paths,
        blocks,
        precision,
        variable_count: graph.variable_count(),
        stage_count: plan.len(),
        kernels,
        schedule,
        layout: BufferLayout {
            input: graph.staging().len(),
            values: spills.slots() * paths,
            partials: analysis.expectation_count * blocks,
            results: analysis.expectation_count,
            basis: analysis.total_basis * paths,
            target: analysis.regression_count * paths,
            coeffs: analysis.total_basis,
            output: outputs.len() * paths,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_graph_lowers_to_two_stages() {
        let mut graph = GraphRecorder::new(4, 4);
        let a = graph.add_scalar_input(2.0);
        let b = graph.add_vector_input(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let one = graph.add_scalar_input(1.0);
        let c = graph.record(OpCode::Mult, &[a, b]).unwrap();
        let e = graph
            .record(OpCode::ConditionalExpectation, &[c, one])
            .unwrap();
        graph.declare_output(e).unwrap();

        let program = lower(&graph, Precision::Double).unwrap();
        assert_eq!(program.stage_count, 2);
        assert_eq!(
            program.schedule,
            vec![Step::Launch(0), Step::Launch(1), Step::Launch(2)]
        );
        assert_eq!(program.kernels[1].kind, KernelKind::Reduce);
        assert_eq!(program.kernels[0].reset_slots, vec![0]);
        assert_eq!(
            program.kernels[2].ops,
            vec![KernelOp::Output {
                source: Operand::Result { index: 0 },
                index: 0
            }]
        );
        assert_eq!(program.layout.partials, 1);
        assert_eq!(program.layout.input, 6);
        assert_eq!(program.output_count(), 1);
    }

    #[test]
    fn reused_id_is_declared_once_per_kernel() {
        let mut graph = GraphRecorder::new(2, 4);
        let x = graph.add_vector_input(&[1.0, 2.0]).unwrap();
        let a = graph.record(OpCode::Exp, &[x]).unwrap();
        graph.free(a).unwrap();
        let b = graph.record(OpCode::Log, &[x]).unwrap();
        assert_eq!(a, b);
        graph.declare_output(b).unwrap();

        let program = lower(&graph, Precision::Double).unwrap();
        let declares: Vec<bool> = program.kernels[0]
            .ops
            .iter()
            .filter_map(|op| match op {
                KernelOp::Assign { declare, .. } => Some(*declare),
                _ => None,
            })
            .collect();
        assert_eq!(declares, vec![true, false]);
    }

    #[test]
    fn regression_stage_schedules_solve_then_predicts() {
        let mut graph = GraphRecorder::new(16, 1);
        let x = graph.add_vector_input(&[0.5; 16]).unwrap();
        let one = graph.add_scalar_input(1.0);
        let r = graph
            .record(OpCode::ConditionalExpectation, &[x, one, x])
            .unwrap();
        let y = graph.record(OpCode::Add, &[r, x]).unwrap();
        graph.declare_output(y).unwrap();

        let program = lower(&graph, Precision::Double).unwrap();
        assert_eq!(
            program.schedule,
            vec![
                Step::Launch(0),
                Step::Solve(vec![SolveGroup {
                    basis_size: 2,
                    members: vec![RegressionSolve {
                        regression: 0,
                        basis_offset: 0
                    }],
                }]),
                Step::Launch(1),
            ]
        );
        assert_eq!(
            program.kernels[1].ops[0],
            KernelOp::Predict {
                result: r,
                basis_offset: 0,
                basis_size: 2
            }
        );
        assert_eq!(program.layout.basis, 32);
        assert_eq!(program.layout.coeffs, 2);
    }
}

//! Stage-split pass and cross-stage liveness.
//!
//! A stage is a maximal run of instructions that needs no global synchronisation. Expectation
//! and conditional-expectation results only become available after their stage has finished,
//! so the first instruction (or output) that reads one of them opens a new stage. Sync nodes
//! recorded before any of their results is consumed share a stage.
//!
//! ```text
//!   stage 0: a = x * y      e = E[a | f]     r = CE[a | f; x]
//!   ----------------------- boundary: next read of e or r ------------------
//!   stage 1: predict r     b = e + r        ...
//! ```
//!
//! Values that must outlive the stage they are computed in are written to a spill buffer.
//! Expectation results never spill; they stay in the results array for the whole generation.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use crate::ir::{Instruction, VariableId};

/// Incremental boundary detection, shared by the recorder and [`split_stages`].
#[derive(Debug, Clone, Default)]
pub struct BoundaryTracker {
    stage: usize,
    pending: HashSet<VariableId>,
    local: HashSet<VariableId>,
}

impl BoundaryTracker {
    pub fn stage(&self) -> usize {
        self.stage
    }

    /// Whether reading `ids` requires closing the current stage first.
    pub fn needs_boundary(&self, ids: &[VariableId]) -> bool {
        ids.iter().any(|id| self.pending.contains(id))
    }

    /// Whether `id` was produced by an elementwise instruction of the current stage.
    pub fn is_local(&self, id: VariableId) -> bool {
        self.local.contains(&id)
    }

    pub fn close(&mut self) {
        self.stage += 1;
        self.pending.clear();
        self.local.clear();
    }

    pub fn record(&mut self, instruction: &Instruction) {
        if instruction.is_sync() {
            self.pending.insert(instruction.result());
        } else {
            self.local.insert(instruction.result());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpan {
    pub index: usize,
    /// Indices into the instruction list.
    pub instructions: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stages: Vec<StageSpan>,
    instruction_stage: Vec<usize>,
}

impl StagePlan {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn last_stage(&self) -> usize {
        self.stages.len().saturating_sub(1)
    }

    pub fn stage_of(&self, instruction: usize) -> usize {
        self.instruction_stage[instruction]
    }
}

/// Splits a recorded instruction list into stages. Always returns at least one stage; a trailing
/// empty stage is added when an output reads a result of the last stage's sync nodes.
pub fn split_stages(instructions: &[Instruction], outputs: &[VariableId]) -> StagePlan {
    let mut tracker = BoundaryTracker::default();
    let mut stages = Vec::new();
    let mut instruction_stage = Vec::with_capacity(instructions.len());
    let mut start = 0;
    for (i, instruction) in instructions.iter().enumerate() {
        if tracker.needs_boundary(&instruction.reads()) {
            stages.push(StageSpan {
                index: stages.len(),
                instructions: start..i,
            });
            start = i;
            tracker.close();
        }
        tracker.record(instruction);
        instruction_stage.push(tracker.stage());
    }
    stages.push(StageSpan {
        index: stages.len(),
        instructions: start..instructions.len(),
    });
    if tracker.needs_boundary(outputs) {
        stages.push(StageSpan {
            index: stages.len(),
            instructions: instructions.len()..instructions.len(),
        });
    }
    StagePlan {
        stages,
        instruction_stage,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Local,
    Expectation {
        slot: usize,
    },
    Regression {
        regression: usize,
        basis_offset: usize,
        basis_size: usize,
    },
}

/// Where and how a computed id gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Definition {
    pub stage: usize,
    pub kind: DefinitionKind,
}

impl Definition {
    /// Stage in which the value exists as a path-local variable. Regression results are
    /// materialised at the start of the stage after their solve.
    pub fn home_stage(&self) -> Option<usize> {
        match self.kind {
            DefinitionKind::Local => Some(self.stage),
            DefinitionKind::Regression { .. } => Some(self.stage + 1),
            DefinitionKind::Expectation { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphAnalysis {
    pub definitions: HashMap<VariableId, Definition>,
    pub expectation_count: usize,
    pub regression_count: usize,
    /// Sum of all regression basis sizes; the length of the coefficient buffer.
    pub total_basis: usize,
}

/// Assigns result slots, regression indices and basis offsets in record order.
pub fn analyze(instructions: &[Instruction], plan: &StagePlan) -> GraphAnalysis {
    let mut analysis = GraphAnalysis::default();
    for (i, instruction) in instructions.iter().enumerate() {
        let kind = match instruction {
            Instruction::Elementwise { .. } => DefinitionKind::Local,
            Instruction::Expectation { .. } => {
                analysis.expectation_count += 1;
                DefinitionKind::Expectation {
                    slot: analysis.expectation_count - 1,
                }
            }
            Instruction::ConditionalExpectation { basis_size, .. } => {
                let kind = DefinitionKind::Regression {
                    regression: analysis.regression_count,
                    basis_offset: analysis.total_basis,
                    basis_size: *basis_size,
                };
                analysis.regression_count += 1;
                analysis.total_basis += basis_size;
                kind
            }
        };
        analysis.definitions.insert(
            instruction.result(),
            Definition {
                stage: plan.stage_of(i),
                kind,
            },
        );
    }
    analysis
}

/// Spill-buffer positions for values read after their home stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpillLayout {
    positions: HashMap<VariableId, usize>,
    spill_out: Vec<Vec<VariableId>>,
    slots: usize,
}

impl SpillLayout {
    pub fn position(&self, id: VariableId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// Ids written to the spill buffer at the end of `stage`.
    pub fn spilled_by(&self, stage: usize) -> &[VariableId] {
        self.spill_out.get(stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of spill positions, each `n` elements wide.
    pub fn slots(&self) -> usize {
        self.slots
    }
}

/// Greedy interval allocation: each spilled value occupies a position from its home stage to
/// its last reading stage; a position is reused once every earlier occupant is dead.
pub fn allocate_spills(
    instructions: &[Instruction],
    plan: &StagePlan,
    analysis: &GraphAnalysis,
    outputs: &[VariableId],
) -> SpillLayout {
    let mut last_read: HashMap<VariableId, usize> = HashMap::new();
    let mut note_read = |id: VariableId, stage: usize| {
        if analysis.definitions.contains_key(&id) {
            let entry = last_read.entry(id).or_insert(stage);
            *entry = (*entry).max(stage);
        }
    };
    for (i, instruction) in instructions.iter().enumerate() {
        let stage = plan.stage_of(i);
        for id in instruction.reads() {
            note_read(id, stage);
        }
    }
    for id in outputs {
        note_read(*id, plan.last_stage());
    }

    let mut intervals: Vec<(usize, usize, VariableId)> = analysis
        .definitions
        .iter()
        .filter_map(|(id, definition)| {
            let home = definition.home_stage()?;
            let last = *last_read.get(id)?;
            (last > home).then_some((home, last, *id))
        })
        .collect();
    intervals.sort_unstable();

    let mut layout = SpillLayout {
        spill_out: vec![Vec::new(); plan.len()],
        ..SpillLayout::default()
    };
    let mut free_after: Vec<usize> = Vec::new();
    for (home, last, id) in intervals {
        let position = match free_after.iter().position(|&end| end < home) {
            Some(position) => {
                free_after[position] = last;
                position
            }
            None => {
                free_after.push(last);
                free_after.len() - 1
            }
        };
        layout.positions.insert(id, position);
        layout.spill_out[home].push(id);
    }
    layout.slots = free_after.len();
    layout
}

#[cfg(test)]
mod tests {
    use crate::ir::{Args, OpCode};

    use super::*;

    fn ew(op: OpCode, args: &[VariableId], result: VariableId) -> Instruction {
        Instruction::Elementwise {
            op,
            args: Args::from_slice(args),
            result,
        }
    }

    fn expectation(value: VariableId, filter: VariableId, result: VariableId) -> Instruction {
        Instruction::Expectation {
            value,
            filter,
            result,
        }
    }

    fn regression(value: VariableId, regressor: VariableId, result: VariableId) -> Instruction {
        Instruction::ConditionalExpectation {
            value,
            filter: 0,
            regressors: Args::from_slice(&[regressor]),
            order: 1,
            basis_size: 2,
            result,
        }
    }

    #[test]
    fn elementwise_only_graph_is_one_stage() {
        let insts = vec![ew(OpCode::Mult, &[0, 1], 2), ew(OpCode::Exp, &[2], 3)];
        let plan = split_stages(&insts, &[3]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.stages[0].instructions, 0..2);
    }

    #[test]
    fn reading_pending_result_opens_stage() {
        let insts = vec![
            ew(OpCode::Mult, &[0, 1], 2),
            expectation(2, 0, 3),
            ew(OpCode::Add, &[2, 1], 4),
            ew(OpCode::Add, &[3, 4], 5),
        ];
        let plan = split_stages(&insts, &[5]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.stages[0].instructions, 0..3);
        assert_eq!(plan.stages[1].instructions, 3..4);
        assert_eq!(plan.stage_of(3), 1);
    }

    #[test]
    fn independent_sync_nodes_share_a_stage() {
        let insts = vec![
            expectation(1, 0, 2),
            regression(1, 0, 3),
            ew(OpCode::Add, &[2, 3], 4),
        ];
        let plan = split_stages(&insts, &[4]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.stages[0].instructions, 0..2);
    }

    #[test]
    fn pending_output_adds_trailing_stage() {
        let insts = vec![expectation(1, 0, 2)];
        let plan = split_stages(&insts, &[2]);
        assert_eq!(plan.len(), 2);
        assert!(plan.stages[1].instructions.is_empty());
    }

    #[test]
    fn analysis_assigns_offsets_in_record_order() {
        let insts = vec![
            regression(1, 0, 2),
            expectation(1, 0, 3),
            regression(1, 0, 4),
        ];
        let plan = split_stages(&insts, &[]);
        let analysis = analyze(&insts, &plan);
        assert_eq!(analysis.regression_count, 2);
        assert_eq!(analysis.total_basis, 4);
        assert_eq!(
            analysis.definitions[&4].kind,
            DefinitionKind::Regression {
                regression: 1,
                basis_offset: 2,
                basis_size: 2
            }
        );
        assert_eq!(
            analysis.definitions[&3].kind,
            DefinitionKind::Expectation { slot: 0 }
        );
    }

    #[test]
    fn spills_cover_cross_stage_reads_and_reuse_positions() {
        // stage 0: 2 = 0*1, 3 = E[2]; stage 1: 4 = 2+3, 5 = E[4]; stage 2: 6 = 4+5
        let insts = vec![
            ew(OpCode::Mult, &[0, 1], 2),
            expectation(2, 0, 3),
            ew(OpCode::Add, &[2, 3], 4),
            expectation(4, 0, 5),
            ew(OpCode::Add, &[4, 5], 6),
        ];
        let plan = split_stages(&insts, &[6]);
        assert_eq!(plan.len(), 3);
        let analysis = analyze(&insts, &plan);
        let spills = allocate_spills(&insts, &plan, &analysis, &[6]);
        assert_eq!(spills.spilled_by(0), &[2]);
        assert_eq!(spills.spilled_by(1), &[4]);
        assert_eq!(spills.position(3), None);
        assert_eq!(spills.position(6), None);
        // 2 lives over [0, 1] and 4 over [1, 2]; they overlap at stage 1
        assert_eq!(spills.slots(), 2);
    }

    #[test]
    fn regression_result_read_two_stages_later_is_spilled_from_home_stage() {
        let insts = vec![
            regression(1, 0, 2),
            ew(OpCode::Add, &[2, 1], 3),
            expectation(3, 0, 4),
            ew(OpCode::Add, &[2, 4], 5),
        ];
        let plan = split_stages(&insts, &[5]);
        assert_eq!(plan.len(), 3);
        let analysis = analyze(&insts, &plan);
        let spills = allocate_spills(&insts, &plan, &analysis, &[5]);
        assert_eq!(spills.spilled_by(1), &[2]);
        assert_eq!(spills.slots(), 1);
    }

    #[test]
    fn disjoint_intervals_share_a_position() {
        // 2 lives over [0, 1]; 6 lives over [2, 3]
        let insts = vec![
            ew(OpCode::Exp, &[1], 2),
            expectation(1, 0, 3),
            ew(OpCode::Add, &[2, 3], 4),
            expectation(4, 0, 5),
            ew(OpCode::Add, &[5, 1], 6),
            expectation(6, 0, 7),
            ew(OpCode::Add, &[6, 7], 8),
        ];
        let plan = split_stages(&insts, &[8]);
        assert_eq!(plan.len(), 4);
        let analysis = analyze(&insts, &plan);
        let spills = allocate_spills(&insts, &plan, &analysis, &[8]);
        assert_eq!(spills.position(2), Some(0));
        assert_eq!(spills.position(6), Some(0));
        assert_eq!(spills.slots(), 1);
    }
}

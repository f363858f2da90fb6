//! Per-slot graph recording.
//!
//! One [`GraphRecorder`] holds everything recorded for a (slot, version): the input layout and
//! staged input values, the variate count, the instruction list and the output list. Ids are
//! handed out densely: inputs first, then variates, then computed results.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, ComputeResult};
use crate::ir::{Args, Instruction, OpCode, VariableId};
use crate::reference::{InputValue, Recording};
use crate::regression::{adaptive_order, basis_size};
use crate::settings::Settings;

use super::stages::BoundaryTracker;

/// Largest path count supported by the single-pass block reduction behind expectations.
pub const MAX_REDUCTION_PATHS: usize = 65_536;

/// Location of one input inside the flat staging vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputSlot {
    pub offset: usize,
    pub scalar: bool,
}

#[derive(Debug, Clone)]
pub struct GraphRecorder {
    paths: usize,
    regression_order: usize,
    inputs: Vec<InputSlot>,
    staging: Vec<f64>,
    variate_count: usize,
    computed: usize,
    instructions: Vec<Instruction>,
    outputs: Vec<VariableId>,
    freed: Vec<VariableId>,
    tracker: BoundaryTracker,
}

impl GraphRecorder {
    pub fn new(paths: usize, regression_order: usize) -> Self {
        Self {
            paths,
            regression_order,
            inputs: Vec::new(),
            staging: Vec::new(),
            variate_count: 0,
            computed: 0,
            instructions: Vec::new(),
            outputs: Vec::new(),
            freed: Vec::new(),
            tracker: BoundaryTracker::default(),
        }
    }

    pub fn paths(&self) -> usize {
        self.paths
    }

    pub fn input_slots(&self) -> &[InputSlot] {
        &self.inputs
    }

    /// Flattened input values: one entry per scalar, `n` per array.
    pub fn staging(&self) -> &[f64] {
        &self.staging
    }

    pub fn variate_count(&self) -> usize {
        self.variate_count
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn outputs(&self) -> &[VariableId] {
        &self.outputs
    }

    pub fn first_computed(&self) -> VariableId {
        self.inputs.len() + self.variate_count
    }

    /// One past the largest id handed out so far.
    pub fn variable_count(&self) -> usize {
        self.first_computed() + self.computed
    }

    /// Index of the stage currently being recorded.
    pub fn current_stage(&self) -> usize {
        self.tracker.stage()
    }

    /// Forgets staged input values so a cached graph can be fed again.
    pub fn clear_inputs(&mut self) {
        self.inputs.clear();
        self.staging.clear();
    }

    pub fn add_scalar_input(&mut self, value: f64) -> VariableId {
        self.push_input(&[value], true)
    }

    pub fn add_vector_input(&mut self, values: &[f64]) -> ComputeResult<VariableId> {
        if values.len() != self.paths {
            return Err(ComputeError::usage(
                "create_input_variable",
                format!(
                    "input array has {} values, the calculation has {} paths",
                    values.len(),
                    self.paths
                ),
            ));
        }
        Ok(self.push_input(values, false))
    }

    fn push_input(&mut self, values: &[f64], scalar: bool) -> VariableId {
        let id = self.inputs.len();
        self.inputs.push(InputSlot {
            offset: self.staging.len(),
            scalar,
        });
        self.staging.extend_from_slice(values);
        id
    }

    /// Registers `count` variates and returns their ids.
    pub fn add_variates(&mut self, count: usize) -> Range<VariableId> {
        let start = self.first_computed();
        self.variate_count += count;
        start..start + count
    }

    fn fresh_id(&mut self) -> VariableId {
        let id = self.variable_count();
        self.computed += 1;
        id
    }

    fn check_ids(&self, op: &'static str, ids: &[VariableId]) -> ComputeResult<()> {
        let limit = self.variable_count();
        match ids.iter().find(|id| **id >= limit) {
            Some(id) => Err(ComputeError::usage(
                op,
                format!("variable {id} is out of range, valid ids are 0..{limit}"),
            )),
            None => Ok(()),
        }
    }

    /// Appends one instruction and returns the id holding its result.
    ///
    /// `ConditionalExpectation` with exactly two arguments records a plain expectation
    /// `E[value | filter]`; with more it records a regression on the trailing regressors.
    pub fn record(&mut self, op: OpCode, args: &[VariableId]) -> ComputeResult<VariableId> {
        const OP: &str = "apply_operation";
        if !op.accepts(args.len()) {
            return Err(ComputeError::usage(
                OP,
                format!("{op} does not accept {} arguments", args.len()),
            ));
        }
        self.check_ids(OP, args)?;

        // validate sync nodes before touching any state
        let regression = if op == OpCode::ConditionalExpectation {
            if args.len() == 2 {
                if self.paths > MAX_REDUCTION_PATHS {
                    return Err(ComputeError::numerical(
                        OP,
                        format!(
                            "expectation supports at most {MAX_REDUCTION_PATHS} paths, got {}",
                            self.paths
                        ),
                    ));
                }
                None
            } else {
                Some(self.regression_shape(args.len() - 2)?)
            }
        } else {
            None
        };

        if self.tracker.needs_boundary(args) {
            self.tracker.close();
            self.freed.clear();
        }

        let instruction = if op == OpCode::ConditionalExpectation {
            let result = self.fresh_id();
            match regression {
                Some((order, basis_size)) => Instruction::ConditionalExpectation {
                    value: args[0],
                    filter: args[1],
                    regressors: Args::from_slice(&args[2..]),
                    order,
                    basis_size,
                    result,
                },
                None => Instruction::Expectation {
                    value: args[0],
                    filter: args[1],
                    result,
                },
            }
        } else {
            let result = match self.freed.pop() {
                Some(id) => id,
                None => self.fresh_id(),
            };
            Instruction::Elementwise {
                op,
                args: Args::from_slice(args),
                result,
            }
        };
        let result = instruction.result();
        self.tracker.record(&instruction);
        self.instructions.push(instruction);
        Ok(result)
    }

    fn regression_shape(&self, regressors: usize) -> ComputeResult<(usize, usize)> {
        let order = adaptive_order(self.regression_order, regressors, self.paths).ok_or_else(
            || {
                let message = if self.regression_order == 0 {
                    "regression order must be at least 1".to_string()
                } else {
                    format!(
                        "linear basis for {regressors} regressors needs {} paths, got {}",
                        basis_size(regressors, 1),
                        self.paths
                    )
                };
                ComputeError::numerical("apply_operation", message)
            },
        )?;
        Ok((order, basis_size(regressors, order)))
    }

    /// Marks `id` reusable for a later result of the current stage.
    ///
    /// Inputs, variates, values from earlier stages and pending sync results are kept.
    /// Returns whether the id was actually freed.
    pub fn free(&mut self, id: VariableId) -> ComputeResult<bool> {
        self.check_ids("free_variable", &[id])?;
        if id < self.first_computed() || !self.tracker.is_local(id) || self.freed.contains(&id) {
            return Ok(false);
        }
        self.freed.push(id);
        Ok(true)
    }

    pub fn declare_output(&mut self, id: VariableId) -> ComputeResult<()> {
        self.check_ids("declare_output_variable", &[id])?;
        self.outputs.push(id);
        Ok(())
    }

    /// Snapshot of the graph together with its current input values.
    pub fn recording(&self, settings: Settings) -> Recording {
        let inputs = self
            .inputs
            .iter()
            .map(|slot| {
                if slot.scalar {
                    InputValue::Scalar(self.staging[slot.offset])
                } else {
                    InputValue::Vector(self.staging[slot.offset..slot.offset + self.paths].to_vec())
                }
            })
            .collect();
        Recording {
            paths: self.paths,
            inputs,
            variate_count: self.variate_count,
            instructions: self.instructions.clone(),
            outputs: self.outputs.clone(),
            settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder_with_inputs(paths: usize) -> GraphRecorder {
        let mut graph = GraphRecorder::new(paths, 4);
        graph.add_scalar_input(2.0);
        graph
            .add_vector_input(&(1..=paths).map(|v| v as f64).collect::<Vec<_>>())
            .unwrap();
        graph
    }

    #[test]
    fn ids_are_inputs_then_variates_then_results() {
        let mut graph = recorder_with_inputs(4);
        assert_eq!(graph.add_variates(3), 2..5);
        let c = graph.record(OpCode::Mult, &[0, 1]).unwrap();
        assert_eq!(c, 5);
        assert_eq!(graph.staging(), &[2.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            graph.input_slots()[1],
            InputSlot {
                offset: 1,
                scalar: false
            }
        );
    }

    #[test]
    fn vector_input_must_match_paths() {
        let mut graph = GraphRecorder::new(4, 4);
        let err = graph.add_vector_input(&[1.0, 2.0]).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn freed_ids_are_reused_within_the_stage() {
        let mut graph = recorder_with_inputs(4);
        let a = graph.record(OpCode::Exp, &[1]).unwrap();
        assert!(graph.free(a).unwrap());
        let b = graph.record(OpCode::Log, &[1]).unwrap();
        assert_eq!(a, b);
        // inputs are never freed
        assert!(!graph.free(0).unwrap());
    }

    #[test]
    fn freed_ids_expire_at_stage_boundary() {
        let mut graph = recorder_with_inputs(4);
        let a = graph.record(OpCode::Exp, &[1]).unwrap();
        let e = graph.record(OpCode::ConditionalExpectation, &[a, 0]).unwrap();
        let b = graph.record(OpCode::Exp, &[1]).unwrap();
        assert!(graph.free(b).unwrap());
        // reading e closes the stage and drops b from the free list
        let c = graph.record(OpCode::Add, &[e, a]).unwrap();
        assert_ne!(c, b);
        assert_eq!(graph.current_stage(), 1);
        // a now belongs to the previous stage
        assert!(!graph.free(a).unwrap());
    }

    #[test]
    fn pending_results_cannot_be_freed() {
        let mut graph = recorder_with_inputs(4);
        let e = graph.record(OpCode::ConditionalExpectation, &[1, 0]).unwrap();
        assert!(!graph.free(e).unwrap());
    }

    #[test]
    fn regression_order_adapts_to_paths() {
        // three regressors: order 3 needs 20 paths, order 2 needs 10
        let mut graph = GraphRecorder::new(12, 3);
        graph.add_variates(5);
        let r = graph
            .record(OpCode::ConditionalExpectation, &[0, 1, 2, 3, 4])
            .unwrap();
        match graph.instructions().last().unwrap() {
            Instruction::ConditionalExpectation {
                order,
                basis_size,
                result,
                ..
            } => {
                assert_eq!((*order, *basis_size, *result), (2, 10, r));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn degenerate_regression_is_a_numerical_error() {
        let mut graph = GraphRecorder::new(2, 3);
        graph.add_variates(4);
        let err = graph
            .record(OpCode::ConditionalExpectation, &[0, 1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, ComputeError::Numerical { .. }));
        assert!(graph.instructions().is_empty());
    }

    #[test]
    fn expectation_path_limit() {
        let mut graph = GraphRecorder::new(MAX_REDUCTION_PATHS + 1, 4);
        graph.add_scalar_input(1.0);
        let err = graph
            .record(OpCode::ConditionalExpectation, &[0, 0])
            .unwrap_err();
        assert!(matches!(err, ComputeError::Numerical { .. }));
    }

    #[test]
    fn out_of_range_ids_and_bad_arity_are_usage_errors() {
        let mut graph = recorder_with_inputs(4);
        assert!(graph.record(OpCode::Add, &[0, 7]).unwrap_err().is_usage());
        assert!(graph.record(OpCode::Mult, &[0]).unwrap_err().is_usage());
        assert!(graph.declare_output(9).unwrap_err().is_usage());
    }
}

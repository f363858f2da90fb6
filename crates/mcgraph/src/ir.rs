//! Typed instruction IR recorded by the graph builder.
//!
//! Instructions reference operands by [`VariableId`]. Ids are dense per (slot, version) and
//! partitioned into three consecutive ranges: inputs, random variates, computed results.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type VariableId = usize;

/// Argument list of one instruction; most opcodes take at most three operands.
pub type Args = SmallVec<[VariableId; 4]>;

/// Operation codes accepted by `apply_operation`.
///
/// The numeric codes are stable and match the op-code table used by the pricing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    None,
    Add,
    Subtract,
    Negative,
    Mult,
    Div,
    ConditionalExpectation,
    IndicatorEq,
    IndicatorGt,
    IndicatorGeq,
    Min,
    Max,
    Abs,
    Exp,
    Sqrt,
    Log,
    Pow,
    NormalCdf,
    NormalPdf,
}

impl OpCode {
    pub const ALL: [OpCode; 19] = [
        OpCode::None,
        OpCode::Add,
        OpCode::Subtract,
        OpCode::Negative,
        OpCode::Mult,
        OpCode::Div,
        OpCode::ConditionalExpectation,
        OpCode::IndicatorEq,
        OpCode::IndicatorGt,
        OpCode::IndicatorGeq,
        OpCode::Min,
        OpCode::Max,
        OpCode::Abs,
        OpCode::Exp,
        OpCode::Sqrt,
        OpCode::Log,
        OpCode::Pow,
        OpCode::NormalCdf,
        OpCode::NormalPdf,
    ];

    pub fn from_code(code: usize) -> Option<OpCode> {
        Self::ALL.get(code).copied()
    }

    pub fn code(self) -> usize {
        Self::ALL
            .iter()
            .position(|op| *op == self)
            .unwrap_or_default()
    }

    pub fn label(self) -> &'static str {
        match self {
            OpCode::None => "None",
            OpCode::Add => "Add",
            OpCode::Subtract => "Subtract",
            OpCode::Negative => "Negative",
            OpCode::Mult => "Mult",
            OpCode::Div => "Div",
            OpCode::ConditionalExpectation => "ConditionalExpectation",
            OpCode::IndicatorEq => "IndicatorEq",
            OpCode::IndicatorGt => "IndicatorGt",
            OpCode::IndicatorGeq => "IndicatorGeq",
            OpCode::Min => "Min",
            OpCode::Max => "Max",
            OpCode::Abs => "Abs",
            OpCode::Exp => "Exp",
            OpCode::Sqrt => "Sqrt",
            OpCode::Log => "Log",
            OpCode::Pow => "Pow",
            OpCode::NormalCdf => "NormalCdf",
            OpCode::NormalPdf => "NormalPdf",
        }
    }

    /// Accepted argument counts as an inclusive range; `None` upper bound means unbounded.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            OpCode::None
            | OpCode::Negative
            | OpCode::Abs
            | OpCode::Exp
            | OpCode::Sqrt
            | OpCode::Log
            | OpCode::NormalCdf
            | OpCode::NormalPdf => (1, Some(1)),
            OpCode::Add => (1, None),
            OpCode::ConditionalExpectation => (2, None),
            OpCode::Subtract
            | OpCode::Mult
            | OpCode::Div
            | OpCode::IndicatorEq
            | OpCode::IndicatorGt
            | OpCode::IndicatorGeq
            | OpCode::Min
            | OpCode::Max
            | OpCode::Pow => (2, Some(2)),
        }
    }

    pub fn accepts(self, count: usize) -> bool {
        let (min, max) = self.arity();
        count >= min && max.map_or(true, |max| count <= max)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One recorded instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Pointwise opcode evaluated independently on every path.
    Elementwise {
        op: OpCode,
        args: Args,
        result: VariableId,
    },
    /// Filtered cross-path mean: paths whose filter is close to one contribute `value`.
    Expectation {
        value: VariableId,
        filter: VariableId,
        result: VariableId,
    },
    /// Least-squares projection of the filtered `value` onto a monomial basis of `regressors`.
    ConditionalExpectation {
        value: VariableId,
        filter: VariableId,
        regressors: Args,
        order: usize,
        basis_size: usize,
        result: VariableId,
    },
}

impl Instruction {
    pub fn result(&self) -> VariableId {
        match self {
            Instruction::Elementwise { result, .. }
            | Instruction::Expectation { result, .. }
            | Instruction::ConditionalExpectation { result, .. } => *result,
        }
    }

    /// Operands read by this instruction, in argument order.
    pub fn reads(&self) -> Args {
        match self {
            Instruction::Elementwise { args, .. } => args.clone(),
            Instruction::Expectation { value, filter, .. } => {
                let mut out = Args::new();
                out.push(*value);
                out.push(*filter);
                out
            }
            Instruction::ConditionalExpectation {
                value,
                filter,
                regressors,
                ..
            } => {
                let mut out = Args::with_capacity(regressors.len() + 2);
                out.push(*value);
                out.push(*filter);
                out.extend(regressors.iter().copied());
                out
            }
        }
    }

    /// Whether the result needs a global synchronisation across all paths.
    pub fn is_sync(&self) -> bool {
        !matches!(self, Instruction::Elementwise { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Instruction::Elementwise { op, .. } => op.label(),
            Instruction::Expectation { .. } => "Expectation",
            Instruction::ConditionalExpectation { .. } => "ConditionalExpectation",
        }
    }
}

/// Resolved location of an operand inside one stage.
///
/// Offsets are element offsets into the corresponding device buffer; per-path operands add
/// the path index on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    /// Input staging slot; scalars are shared by all paths.
    Input { offset: usize, scalar: bool },
    /// Random-variate pool, `offset = variate_index * n`.
    Variate { offset: usize },
    /// Value computed earlier in the same stage.
    Local(VariableId),
    /// Cross-stage value read from the spill buffer, `offset = position * n`.
    Spilled { offset: usize },
    /// Expectation result produced by an earlier reduction.
    Result { index: usize },
}

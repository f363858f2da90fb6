//! Graph recording and the compiler passes that turn a recording into a kernel program:
//! stage splitting, operand resolution and lowering.

pub mod lower;
pub mod recorder;
pub mod stages;
pub mod symbols;

pub use lower::{
    lower, BufferLayout, Kernel, KernelKind, KernelOp, KernelProgram, RegressionSolve,
    SolveGroup, Step, PATH_BLOCK,
};
pub use recorder::{GraphRecorder, InputSlot, MAX_REDUCTION_PATHS};
pub use stages::{split_stages, StagePlan};
pub use symbols::{ResolveError, SymbolTable};

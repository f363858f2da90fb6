use thiserror::Error;

use crate::ir::{Operand, VariableId};

use super::recorder::InputSlot;
use super::stages::{DefinitionKind, GraphAnalysis, SpillLayout};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("variable {id} is never defined")]
    Undefined { id: VariableId },
    #[error("variable {id} defined in stage {defined} is not readable in stage {stage}")]
    Unavailable {
        id: VariableId,
        defined: usize,
        stage: usize,
    },
}

/// Immutable view used to resolve operands of one stage.
///
/// Resolution order is fixed: input, variate, same-stage local, spilled value, reduction result.
/// Buffer layouts differ between stages, so a table is built per stage and never reused.
pub struct SymbolTable<'a> {
    stage: usize,
    paths: usize,
    inputs: &'a [InputSlot],
    variate_count: usize,
    analysis: &'a GraphAnalysis,
    spills: &'a SpillLayout,
}

impl<'a> SymbolTable<'a> {
    pub fn new(
        stage: usize,
        paths: usize,
        inputs: &'a [InputSlot],
        variate_count: usize,
        analysis: &'a GraphAnalysis,
        spills: &'a SpillLayout,
    ) -> Self {
        Self {
            stage,
            paths,
            inputs,
            variate_count,
            analysis,
            spills,
        }
    }

    pub fn resolve(&self, id: VariableId) -> Result<Operand, ResolveError> {
        if let Some(slot) = self.inputs.get(id) {
            return Ok(Operand::Input {
                offset: slot.offset,
                scalar: slot.scalar,
            });
        }
        let first_variate = self.inputs.len();
        if id < first_variate + self.variate_count {
            return Ok(Operand::Variate {
                offset: (id - first_variate) * self.paths,
            });
        }

        let definition = self
            .analysis
            .definitions
            .get(&id)
            .ok_or(ResolveError::Undefined { id })?;
        let home = definition.home_stage();
        if home == Some(self.stage) {
            return Ok(Operand::Local(id));
        }
        if let (Some(home), Some(position)) = (home, self.spills.position(id)) {
            if home < self.stage {
                return Ok(Operand::Spilled {
                    offset: position * self.paths,
                });
            }
        }
        if let DefinitionKind::Expectation { slot } = definition.kind {
            if definition.stage < self.stage {
                return Ok(Operand::Result { index: slot });
            }
        }
        Err(ResolveError::Unavailable {
            id,
            defined: definition.stage,
            stage: self.stage,
        })
    }
}

//! Host reference interpreter.
//!
//! Evaluates a recording vector-wise in record order, without stages, spills or devices. It
//! produces the same output layout as `finalize_calculation` and serves as the oracle the
//! device conformance tests compare against.

use serde::{Deserialize, Serialize};

use crate::error::{ComputeError, ComputeResult};
use crate::ir::{Instruction, VariableId};
use crate::numeric::{apply_elementwise, selected};
use crate::regression::{evaluate_terms, monomial_terms, LeastSquaresWorkspace};
use crate::rng::normal_variates;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

/// Self-contained copy of one recorded graph and its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub paths: usize,
    pub inputs: Vec<InputValue>,
    pub variate_count: usize,
    pub instructions: Vec<Instruction>,
    pub outputs: Vec<VariableId>,
    pub settings: Settings,
}

const OP: &str = "reference::evaluate";

/// Evaluates `recording`; one vector of `paths` values per declared output.
///
/// Variates are regenerated from `settings.rng_seed` with the same layout as the device pool.
pub fn evaluate(recording: &Recording) -> ComputeResult<Vec<Vec<f64>>> {
    let n = recording.paths;
    let mut values: Vec<Option<Vec<f64>>> = Vec::new();

    for input in &recording.inputs {
        let id = values.len();
        let value = match input {
            InputValue::Scalar(v) => vec![*v; n],
            InputValue::Vector(v) => v.clone(),
        };
        store(&mut values, id, value);
    }
    let draws = normal_variates(recording.settings.rng_seed, recording.variate_count * n);
    for chunk in draws.chunks_exact(n.max(1)).take(recording.variate_count) {
        let id = values.len();
        store(&mut values, id, chunk.to_vec());
    }

    for instruction in &recording.instructions {
        let result = match instruction {
            Instruction::Elementwise { op, args, .. } => {
                let columns = args
                    .iter()
                    .map(|id| read(&values, *id))
                    .collect::<ComputeResult<Vec<_>>>()?;
                let mut scratch = Vec::with_capacity(columns.len());
                let mut out = Vec::with_capacity(n);
                for path in 0..n {
                    scratch.clear();
                    scratch.extend(columns.iter().map(|column| column[path]));
                    let value = apply_elementwise(*op, &scratch).ok_or_else(|| {
                        ComputeError::internal(OP, format!("{op} has no pointwise meaning"))
                    })?;
                    out.push(value);
                }
                out
            }
            Instruction::Expectation { value, filter, .. } => {
                let value = read(&values, *value)?;
                let filter = read(&values, *filter)?;
                let sum: f64 = value
                    .iter()
                    .zip(filter)
                    .filter(|(_, f)| selected(**f))
                    .map(|(v, _)| *v)
                    .sum();
                vec![sum / n as f64; n]
            }
            Instruction::ConditionalExpectation {
                value,
                filter,
                regressors,
                order,
                basis_size,
                ..
            } => {
                let value = read(&values, *value)?;
                let filter = read(&values, *filter)?;
                let regressors = regressors
                    .iter()
                    .map(|id| read(&values, *id))
                    .collect::<ComputeResult<Vec<_>>>()?;
                conditional_expectation(value, filter, &regressors, *order, *basis_size)?
            }
        };
        store(&mut values, instruction.result(), result);
    }

    recording
        .outputs
        .iter()
        .map(|id| read(&values, *id).map(<[f64]>::to_vec))
        .collect()
}

fn store(values: &mut Vec<Option<Vec<f64>>>, id: VariableId, value: Vec<f64>) {
    if values.len() <= id {
        values.resize(id + 1, None);
    }
    values[id] = Some(value);
}

fn read(values: &[Option<Vec<f64>>], id: VariableId) -> ComputeResult<&[f64]> {
    values
        .get(id)
        .and_then(Option::as_deref)
        .ok_or_else(|| ComputeError::internal(OP, format!("variable {id} read before definition")))
}

fn conditional_expectation(
    value: &[f64],
    filter: &[f64],
    regressors: &[&[f64]],
    order: usize,
    basis_size: usize,
) -> ComputeResult<Vec<f64>> {
    let n = value.len();
    let terms = monomial_terms(regressors.len(), order);
    let mut basis = vec![0.0; basis_size * n];
    let mut design = vec![0.0; basis_size * n];
    let mut target = vec![0.0; n];
    let mut point = Vec::with_capacity(regressors.len());
    let mut row = Vec::with_capacity(basis_size);
    for path in 0..n {
        point.clear();
        point.extend(regressors.iter().map(|r| r[path]));
        evaluate_terms(&terms, &point, &mut row);
        let keep = selected(filter[path]);
        for (i, b) in row.iter().enumerate() {
            basis[i * n + path] = *b;
            design[i * n + path] = if keep { *b } else { 0.0 };
        }
        target[path] = if keep { value[path] } else { 0.0 };
    }
    let coefficients = LeastSquaresWorkspace::new(n, basis_size)
        .solve(&design, &target)
        .map_err(|failure| {
            ComputeError::numerical(
                OP,
                format!("least-squares solve with {n} paths and basis size {basis_size}: {failure}"),
            )
        })?;
    Ok((0..n)
        .map(|path| {
            coefficients
                .iter()
                .enumerate()
                .map(|(i, c)| basis[i * n + path] * c)
                .sum()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::ir::{Args, OpCode};

    use super::*;

    fn recording(
        inputs: Vec<InputValue>,
        instructions: Vec<Instruction>,
        outputs: Vec<VariableId>,
    ) -> Recording {
        Recording {
            paths: 4,
            inputs,
            variate_count: 0,
            instructions,
            outputs,
            settings: Settings::default(),
        }
    }

    #[test]
    fn scalar_times_vector_expectation() {
        let rec = recording(
            vec![
                InputValue::Scalar(2.0),
                InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]),
                InputValue::Vector(vec![1.0; 4]),
            ],
            vec![
                Instruction::Elementwise {
                    op: OpCode::Mult,
                    args: Args::from_slice(&[0, 1]),
                    result: 3,
                },
                Instruction::Expectation {
                    value: 3,
                    filter: 2,
                    result: 4,
                },
            ],
            vec![4],
        );
        let out = evaluate(&rec).unwrap();
        assert_eq!(out, vec![vec![5.0; 4]]);
    }

    #[test]
    fn filtered_out_paths_contribute_zero() {
        let rec = recording(
            vec![
                InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]),
                InputValue::Vector(vec![1.0, 0.0, 1.0, 0.0]),
            ],
            vec![Instruction::Expectation {
                value: 0,
                filter: 1,
                result: 2,
            }],
            vec![2],
        );
        assert_relative_eq!(evaluate(&rec).unwrap()[0][0], 1.0);
    }

    #[test]
    fn linear_regression_reproduces_linear_target() {
        let rec = recording(
            vec![
                InputValue::Vector(vec![3.0, 5.0, 7.0, 9.0]),
                InputValue::Scalar(1.0),
                InputValue::Vector(vec![1.0, 2.0, 3.0, 4.0]),
            ],
            vec![Instruction::ConditionalExpectation {
                value: 0,
                filter: 1,
                regressors: Args::from_slice(&[2]),
                order: 1,
                basis_size: 2,
                result: 3,
            }],
            vec![3],
        );
        let out = evaluate(&rec).unwrap();
        for (got, want) in out[0].iter().zip([3.0, 5.0, 7.0, 9.0]) {
            assert_relative_eq!(*got, want, epsilon = 1e-10);
        }
    }

    #[test]
    fn variates_follow_pool_layout() {
        let mut rec = recording(vec![], vec![], vec![1]);
        rec.variate_count = 2;
        let out = evaluate(&rec).unwrap();
        let draws = normal_variates(rec.settings.rng_seed, 8);
        assert_eq!(out[0], draws[4..8].to_vec());
    }
}

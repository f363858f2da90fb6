//! Polynomial regression basis and the dense least-squares solve behind conditional
//! expectations.

use faer::Mat;
use serde::{Deserialize, Serialize};

/// Number of monomials of total degree `<= order` in `regressors` variables, `C(order + k, order)`.
pub fn basis_size(regressors: usize, order: usize) -> usize {
    let mut size: u128 = 1;
    for i in 1..=order as u128 {
        size = size * (regressors as u128 + i) / i;
    }
    usize::try_from(size).unwrap_or(usize::MAX)
}

/// Largest order `<= requested` whose basis fits into `paths`, never going below one.
///
/// Returns `None` when even the linear basis does not fit or `requested` is zero.
pub fn adaptive_order(requested: usize, regressors: usize, paths: usize) -> Option<usize> {
    if requested == 0 {
        return None;
    }
    let mut order = requested;
    while basis_size(regressors, order) > paths && order > 1 {
        order -= 1;
    }
    (basis_size(regressors, order) <= paths).then_some(order)
}

/// One column of the monomial basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasisTerm {
    One,
    /// Regressor `i` (degree one).
    Regressor(usize),
    /// Product of two earlier columns, `lhs` always a degree-one column.
    Product { lhs: usize, rhs: usize },
}

/// Monomial basis in combinatorial order: degree 0, then each degree built by multiplying
/// regressor `j` with every previous-degree term whose leading regressor is `>= j`.
pub fn monomial_terms(regressors: usize, order: usize) -> Vec<BasisTerm> {
    let mut terms = Vec::with_capacity(basis_size(regressors, order));
    terms.push(BasisTerm::One);
    if order == 0 {
        return terms;
    }
    terms.extend((0..regressors).map(BasisTerm::Regressor));
    if regressors == 0 {
        return terms;
    }

    // start[j]: first column of the previous degree whose leading regressor is j
    let mut start: Vec<usize> = (1..=regressors).collect();
    for _degree in 2..=order {
        for j in 0..regressors {
            let first = terms.len();
            let last = start[regressors - 1];
            for rhs in start[j]..=last {
                terms.push(BasisTerm::Product { lhs: j + 1, rhs });
            }
            start[j] = first;
        }
    }
    terms
}

/// Evaluates a basis on one path.
pub fn evaluate_terms(terms: &[BasisTerm], regressors: &[f64], out: &mut Vec<f64>) {
    out.clear();
    for term in terms {
        let value = match *term {
            BasisTerm::One => 1.0,
            BasisTerm::Regressor(i) => regressors[i],
            BasisTerm::Product { lhs, rhs } => out[lhs] * out[rhs],
        };
        out.push(value);
    }
}

/// Reason a least-squares solve was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveFailure {
    ShapeMismatch { expected: usize, got: usize },
    NonFiniteInput { row: usize },
    NoConvergence,
    NonFinite { coefficient: usize },
}

impl std::fmt::Display for SolveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveFailure::ShapeMismatch { expected, got } => {
                write!(f, "expected {expected} values, got {got}")
            }
            SolveFailure::NonFiniteInput { row } => {
                write!(f, "design or target row {row} is not finite")
            }
            SolveFailure::NoConvergence => write!(f, "singular value decomposition did not converge"),
            SolveFailure::NonFinite { coefficient } => {
                write!(f, "coefficient {coefficient} is not finite")
            }
        }
    }
}

/// Reusable design-matrix/target storage for one basis size.
///
/// Regressions sharing a basis size are solved through the same workspace so the dense
/// buffers are allocated once per group.
pub struct LeastSquaresWorkspace {
    paths: usize,
    basis_size: usize,
    design: Mat<f64>,
    target: Mat<f64>,
}

impl LeastSquaresWorkspace {
    pub fn new(paths: usize, basis_size: usize) -> Self {
        Self {
            paths,
            basis_size,
            design: Mat::zeros(paths, basis_size),
            target: Mat::zeros(paths, 1),
        }
    }

    /// Solves `min ||A x - b||` with `A` given column-major (`columns[c * paths + row]`).
    ///
    /// Returns the minimum-norm solution. Singular values below `max(m, n) * eps * s_max` are
    /// treated as zero, so a rank-deficient design (rows zeroed by the filter) still solves,
    /// and an all-zero design yields all-zero coefficients.
    pub fn solve(&mut self, columns: &[f64], target: &[f64]) -> Result<Vec<f64>, SolveFailure> {
        let expected = self.paths * self.basis_size;
        if columns.len() != expected {
            return Err(SolveFailure::ShapeMismatch {
                expected,
                got: columns.len(),
            });
        }
        if target.len() != self.paths {
            return Err(SolveFailure::ShapeMismatch {
                expected: self.paths,
                got: target.len(),
            });
        }
        for col in 0..self.basis_size {
            let column = &columns[col * self.paths..(col + 1) * self.paths];
            for (row, value) in column.iter().enumerate() {
                if !value.is_finite() {
                    return Err(SolveFailure::NonFiniteInput { row });
                }
                self.design[(row, col)] = *value;
            }
        }
        for (row, value) in target.iter().enumerate() {
            if !value.is_finite() {
                return Err(SolveFailure::NonFiniteInput { row });
            }
            self.target[(row, 0)] = *value;
        }

        let svd = self
            .design
            .thin_svd()
            .map_err(|_| SolveFailure::NoConvergence)?;
        let u = svd.U();
        let v = svd.V();
        let singular = svd.S().column_vector();
        let count = singular.nrows();
        let largest = (0..count).map(|i| singular[i]).fold(0.0f64, f64::max);
        let cutoff = largest * self.paths.max(self.basis_size) as f64 * f64::EPSILON;

        let mut coefficients = vec![0.0; self.basis_size];
        for i in 0..count {
            let sigma = singular[i];
            if sigma <= cutoff {
                continue;
            }
            let projection: f64 = (0..self.paths)
                .map(|row| u[(row, i)] * self.target[(row, 0)])
                .sum();
            let weight = projection / sigma;
            for (j, coefficient) in coefficients.iter_mut().enumerate() {
                *coefficient += v[(j, i)] * weight;
            }
        }
        if let Some(coefficient) = coefficients.iter().position(|c| !c.is_finite()) {
            return Err(SolveFailure::NonFinite { coefficient });
        }
        Ok(coefficients)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn basis_size_is_binomial() {
        assert_eq!(basis_size(1, 1), 2);
        assert_eq!(basis_size(2, 2), 6);
        assert_eq!(basis_size(3, 3), 20);
        assert_eq!(basis_size(4, 0), 1);
        assert_eq!(basis_size(5, 4), 126);
    }

    #[test]
    fn adaptive_order_lowers_until_basis_fits() {
        assert_eq!(adaptive_order(4, 1, 1000), Some(4));
        // k = 3: order 3 -> 20, order 2 -> 10, order 1 -> 4
        assert_eq!(adaptive_order(3, 3, 12), Some(2));
        assert_eq!(adaptive_order(3, 3, 4), Some(1));
        assert_eq!(adaptive_order(3, 3, 3), None);
        assert_eq!(adaptive_order(0, 1, 100), None);
    }

    #[test]
    fn monomial_terms_count_matches_basis_size() {
        for k in 1..=4 {
            for order in 0..=4 {
                assert_eq!(monomial_terms(k, order).len(), basis_size(k, order), "k={k} order={order}");
            }
        }
    }

    #[test]
    fn monomial_terms_two_regressors_order_three() {
        let terms = monomial_terms(2, 3);
        let mut out = Vec::new();
        evaluate_terms(&terms, &[2.0, 3.0], &mut out);
        // 1, x, y, x^2, xy, y^2, x^3, x^2y, xy^2, y^3
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 6.0, 9.0, 8.0, 12.0, 18.0, 27.0]);
    }

    #[test]
    fn least_squares_recovers_exact_line() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mut columns = vec![1.0; x.len()];
        columns.extend_from_slice(&x);
        let target: Vec<f64> = x.iter().map(|v| 1.5 + 0.25 * v).collect();
        let mut ws = LeastSquaresWorkspace::new(x.len(), 2);
        let coef = ws.solve(&columns, &target).expect("solve");
        assert_abs_diff_eq!(coef[0], 1.5, epsilon = 1e-10);
        assert_abs_diff_eq!(coef[1], 0.25, epsilon = 1e-10);
    }

    #[test]
    fn all_zero_design_gives_zero_coefficients() {
        let mut ws = LeastSquaresWorkspace::new(8, 2);
        let coef = ws.solve(&[0.0; 16], &[0.0; 8]).expect("solve");
        assert_eq!(coef, vec![0.0, 0.0]);
    }

    #[test]
    fn rank_deficient_design_returns_minimum_norm_fit() {
        // two identical columns: the fit splits the slope evenly between them
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let mut columns = x.to_vec();
        columns.extend_from_slice(&x);
        let target: Vec<f64> = x.iter().map(|v| 2.0 * v).collect();
        let mut ws = LeastSquaresWorkspace::new(x.len(), 2);
        let coef = ws.solve(&columns, &target).expect("solve");
        assert_abs_diff_eq!(coef[0], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(coef[1], 1.0, epsilon = 1e-8);
    }

    #[test]
    fn non_finite_inputs_are_rejected() {
        let mut ws = LeastSquaresWorkspace::new(2, 1);
        let err = ws.solve(&[1.0, f64::NAN], &[0.0, 0.0]).unwrap_err();
        assert_eq!(err, SolveFailure::NonFiniteInput { row: 1 });
    }

    #[test]
    fn least_squares_rejects_wrong_shapes() {
        let mut ws = LeastSquaresWorkspace::new(3, 2);
        let err = ws.solve(&[1.0; 5], &[0.0; 3]).unwrap_err();
        assert_eq!(err, SolveFailure::ShapeMismatch { expected: 6, got: 5 });
    }
}

//! Translation of a [`KernelProgram`] into a single C translation unit.
//!
//! Kernel `k` becomes `int32_t mcg_kernel_k(const mcg_kernel_args* args)`. Path kernels loop
//! over every path with `tid` as the path index; reduce kernels run their combines once. Path
//! count, block count and all buffer offsets are baked into the source as constants, so a
//! module is only valid for the program it was generated from.
//!
//! The prelude carries C versions of the helpers in `mcgraph::numeric`. Locals are computed in
//! `double` and rounded to `mcg_real` on assignment, matching `Precision::round`.

mod utils;

use std::collections::HashSet;

use mcgraph::device::BindingRole;
use mcgraph::graph::{BufferLayout, Kernel, KernelKind, KernelOp, KernelProgram, PATH_BLOCK};
use mcgraph::ir::{OpCode, Operand};
use mcgraph::regression::BasisTerm;
use mcgraph::settings::Precision;
use thiserror::Error;

use self::utils::{local_name, push_block, push_line, real_type};

#[derive(Debug, Error)]
#[error("C codegen failed in {kernel}: {message}")]
pub struct CodegenError {
    pub kernel: String,
    pub message: String,
}

impl CodegenError {
    fn new(kernel: &Kernel, message: impl Into<String>) -> Self {
        Self {
            kernel: kernel.name.clone(),
            message: message.into(),
        }
    }
}

/// Generated source plus the exported symbol of every kernel, in kernel order.
#[derive(Debug, Clone)]
pub struct CModule {
    pub source: String,
    pub entrypoints: Vec<String>,
}

pub fn kernel_symbol(index: usize) -> String {
    format!("mcg_kernel_{index}")
}

const PRELUDE: &str = r#"
#include <float.h>
#include <math.h>
#include <stddef.h>
#include <stdint.h>
#include <string.h>

typedef struct mcg_kernel_args {
  const double* input;
  const double* variates;
  double* values;
  double* partials;
  double* results;
  double* basis;
  double* design;
  double* target;
  const double* coeffs;
  double* output;
} mcg_kernel_args;

#define MCG_TOL (42.0 * DBL_EPSILON)
#define MCG_PI 3.14159265358979323846
#define MCG_FRAC_1_SQRT_2 0.70710678118654752440

static inline int mcg_close_enough(double x, double y) {
  const double diff = fabs(x - y);
  if (x == 0.0 || y == 0.0) {
    return diff < MCG_TOL * MCG_TOL;
  }
  return diff <= MCG_TOL * fabs(x) || diff <= MCG_TOL * fabs(y);
}

static inline int mcg_selected(double filter) {
  return mcg_close_enough(filter, 1.0);
}

static inline double mcg_indicator_eq(double x, double y) {
  return mcg_close_enough(x, y) ? 1.0 : 0.0;
}

static inline double mcg_indicator_gt(double x, double y) {
  return (x > y && !mcg_close_enough(x, y)) ? 1.0 : 0.0;
}

static inline double mcg_indicator_geq(double x, double y) {
  return (x > y || mcg_close_enough(x, y)) ? 1.0 : 0.0;
}

static inline double mcg_normal_pdf(double x) {
  return exp(-0.5 * x * x) / sqrt(2.0 * MCG_PI);
}

static inline double mcg_normal_cdf(double x) {
  return 0.5 * erfc(-x * MCG_FRAC_1_SQRT_2);
}
"#;

pub fn generate_c_module(program: &KernelProgram) -> Result<CModule, CodegenError> {
    let mut module = String::new();
    push_block(&mut module, 0, PRELUDE);
    module.push('\n');
    push_line(
        &mut module,
        0,
        &format!("typedef {} mcg_real;", real_type(program.precision)),
    );
    push_line(
        &mut module,
        0,
        &format!("#define MCG_PATHS ((size_t){})", program.paths),
    );
    push_line(
        &mut module,
        0,
        &format!("#define MCG_BLOCKS ((size_t){})", program.blocks),
    );
    push_line(
        &mut module,
        0,
        &format!("#define MCG_PATH_BLOCK ((size_t){PATH_BLOCK})"),
    );

    let mut entrypoints = Vec::with_capacity(program.kernels.len());
    for (index, kernel) in program.kernels.iter().enumerate() {
        let symbol = kernel_symbol(index);
        module.push('\n');
        push_line(&mut module, 0, &format!("/* {} (stage {}) */", kernel.name, kernel.stage));
        push_line(
            &mut module,
            0,
            &format!("int32_t {symbol}(const mcg_kernel_args* args) {{"),
        );
        match kernel.kind {
            KernelKind::Paths => emit_paths_kernel(&mut module, program, kernel)?,
            KernelKind::Reduce => emit_reduce_kernel(&mut module, program, kernel)?,
        }
        push_line(&mut module, 1, "return 0;");
        push_line(&mut module, 0, "}");
        entrypoints.push(symbol);
    }

    Ok(CModule {
        source: module,
        entrypoints,
    })
}

fn emit_paths_kernel(
    module: &mut String,
    program: &KernelProgram,
    kernel: &Kernel,
) -> Result<(), CodegenError> {
    let n = program.paths;
    let blocks = program.blocks;
    for slot in &kernel.reset_slots {
        push_line(
            module,
            1,
            &format!(
                "memset(args->partials + {}, 0, MCG_BLOCKS * sizeof(double));",
                slot * blocks
            ),
        );
    }

    let mut declared = HashSet::new();
    push_line(module, 1, "for (size_t tid = 0; tid < MCG_PATHS; ++tid) {");
    for op in &kernel.ops {
        match op {
            KernelOp::Assign {
                result,
                declare,
                op,
                args,
            } => {
                let operands: Vec<String> = args
                    .iter()
                    .map(|arg| operand_expr(program.precision, arg))
                    .collect();
                let expr = elementwise_expr(kernel, *op, &operands)?;
                let decl = if *declare {
                    declared.insert(*result);
                    "mcg_real "
                } else {
                    ""
                };
                push_line(
                    module,
                    2,
                    &format!("{decl}{} = {};", local_name(*result), rounded(program.precision, &expr)),
                );
            }
            KernelOp::Predict {
                result,
                basis_offset,
                basis_size,
            } => {
                let terms: Vec<String> = (0..*basis_size)
                    .map(|i| {
                        let column = basis_offset + i;
                        format!("args->basis[{} + tid] * args->coeffs[{column}]", column * n)
                    })
                    .collect();
                let expr = if terms.is_empty() {
                    "0.0".to_string()
                } else {
                    terms.join(" + ")
                };
                let decl = if declared.insert(*result) {
                    "mcg_real "
                } else {
                    ""
                };
                push_line(
                    module,
                    2,
                    &format!("{decl}{} = {};", local_name(*result), rounded(program.precision, &expr)),
                );
            }
            KernelOp::PartialSum {
                value,
                filter,
                slot,
            } => {
                push_block(
                    module,
                    2,
                    &format!(
                        r#"
                        if (mcg_selected({filter})) {{
                          args->partials[{base} + tid / MCG_PATH_BLOCK] += {value};
                        }}
                        "#,
                        filter = operand_expr(program.precision, filter),
                        base = slot * blocks,
                        value = operand_expr(program.precision, value),
                    ),
                );
            }
            KernelOp::Basis {
                regression,
                basis_offset,
                terms,
                regressors,
                value,
                filter,
            } => {
                push_line(module, 2, "{");
                push_line(
                    module,
                    3,
                    &format!(
                        "const int keep = mcg_selected({});",
                        operand_expr(program.precision, filter)
                    ),
                );
                for (i, term) in terms.iter().enumerate() {
                    let expr = match *term {
                        BasisTerm::One => "1.0".to_string(),
                        BasisTerm::Regressor(r) => {
                            let regressor = regressors.get(r).ok_or_else(|| {
                                CodegenError::new(kernel, format!("basis term reads regressor {r}"))
                            })?;
                            operand_expr(program.precision, regressor)
                        }
                        BasisTerm::Product { lhs, rhs } => {
                            if lhs >= i || rhs >= i {
                                return Err(CodegenError::new(
                                    kernel,
                                    format!("basis term {i} multiplies later columns"),
                                ));
                            }
                            format!("b{lhs} * b{rhs}")
                        }
                    };
                    push_line(module, 3, &format!("const double b{i} = {expr};"));
                }
                for i in 0..terms.len() {
                    let index = (basis_offset + i) * n;
                    push_line(module, 3, &format!("args->basis[{index} + tid] = b{i};"));
                    push_line(
                        module,
                        3,
                        &format!("args->design[{index} + tid] = keep ? b{i} : 0.0;"),
                    );
                }
                push_line(
                    module,
                    3,
                    &format!(
                        "args->target[{} + tid] = keep ? {} : 0.0;",
                        regression * n,
                        operand_expr(program.precision, value)
                    ),
                );
                push_line(module, 2, "}");
            }
            KernelOp::Spill { source, offset } => {
                push_line(
                    module,
                    2,
                    &format!("args->values[{offset} + tid] = {};", local_name(*source)),
                );
            }
            KernelOp::Output { source, index } => {
                push_line(
                    module,
                    2,
                    &format!(
                        "args->output[{} + tid] = {};",
                        index * n,
                        operand_expr(program.precision, source)
                    ),
                );
            }
            KernelOp::Combine { .. } => {
                return Err(CodegenError::new(
                    kernel,
                    "path kernels cannot combine partial sums",
                ))
            }
        }
    }
    push_line(module, 1, "}");
    Ok(())
}

fn emit_reduce_kernel(
    module: &mut String,
    program: &KernelProgram,
    kernel: &Kernel,
) -> Result<(), CodegenError> {
    for op in &kernel.ops {
        let KernelOp::Combine { slot } = op else {
            return Err(CodegenError::new(
                kernel,
                "reduce kernels only combine partial sums",
            ));
        };
        push_block(
            module,
            1,
            &format!(
                r#"
                {{
                  double sum = 0.0;
                  for (size_t block = 0; block < MCG_BLOCKS; ++block) {{
                    sum += args->partials[{base} + block];
                  }}
                  args->results[{slot}] = sum / (double)MCG_PATHS;
                }}
                "#,
                base = slot * program.blocks,
            ),
        );
    }
    Ok(())
}

fn rounded(precision: Precision, expr: &str) -> String {
    match precision {
        Precision::Double => expr.to_string(),
        Precision::Single => format!("(mcg_real)({expr})"),
    }
}

/// C expression reading `operand` as a `double`.
fn operand_expr(precision: Precision, operand: &Operand) -> String {
    match *operand {
        Operand::Input {
            offset,
            scalar: true,
        } => format!("args->input[{offset}]"),
        Operand::Input {
            offset,
            scalar: false,
        } => format!("args->input[{offset} + tid]"),
        Operand::Variate { offset } => format!("args->variates[{offset} + tid]"),
        Operand::Local(id) => match precision {
            Precision::Double => local_name(id),
            Precision::Single => format!("(double){}", local_name(id)),
        },
        Operand::Spilled { offset } => format!("args->values[{offset} + tid]"),
        Operand::Result { index } => format!("args->results[{index}]"),
    }
}

fn elementwise_expr(kernel: &Kernel, op: OpCode, args: &[String]) -> Result<String, CodegenError> {
    if op == OpCode::ConditionalExpectation {
        return Err(CodegenError::new(
            kernel,
            format!("{op} has no pointwise kernel"),
        ));
    }
    if !op.accepts(args.len()) {
        return Err(CodegenError::new(
            kernel,
            format!("{op} does not accept {} arguments", args.len()),
        ));
    }

    let call = |name: &str| format!("{name}({})", args.join(", "));
    let expr = match op {
        OpCode::None | OpCode::Add if args.len() == 1 => args[0].clone(),
        OpCode::None | OpCode::Add => format!("({})", args.join(" + ")),
        OpCode::Subtract => format!("({} - {})", args[0], args[1]),
        OpCode::Negative => format!("(-{})", args[0]),
        OpCode::Mult => format!("({} * {})", args[0], args[1]),
        OpCode::Div => format!("({} / {})", args[0], args[1]),
        OpCode::IndicatorEq => call("mcg_indicator_eq"),
        OpCode::IndicatorGt => call("mcg_indicator_gt"),
        OpCode::IndicatorGeq => call("mcg_indicator_geq"),
        OpCode::Min => call("fmin"),
        OpCode::Max => call("fmax"),
        OpCode::Abs => call("fabs"),
        OpCode::Exp => call("exp"),
        OpCode::Sqrt => call("sqrt"),
        OpCode::Log => call("log"),
        OpCode::Pow => call("pow"),
        OpCode::NormalCdf => call("mcg_normal_cdf"),
        OpCode::NormalPdf => call("mcg_normal_pdf"),
        OpCode::ConditionalExpectation => unreachable!("rejected above"),
    };
    Ok(expr)
}

/// Minimum bound length of every buffer role the generated code indexes without checks.
pub fn required_lengths(program: &KernelProgram) -> [(BindingRole, usize); 10] {
    let BufferLayout {
        input,
        values,
        partials,
        results,
        basis,
        target,
        coeffs,
        output,
    } = program.layout;
    [
        (BindingRole::Input, input),
        (BindingRole::Variates, variate_extent(program)),
        (BindingRole::Values, values),
        (BindingRole::Partials, partials),
        (BindingRole::Results, results),
        (BindingRole::Basis, basis),
        (BindingRole::Design, basis),
        (BindingRole::Target, target),
        (BindingRole::Coeffs, coeffs),
        (BindingRole::Output, output),
    ]
}

/// One past the last variate element any kernel reads.
pub fn variate_extent(program: &KernelProgram) -> usize {
    let mut extent = 0;
    let mut visit = |operand: &Operand| {
        if let Operand::Variate { offset } = *operand {
            extent = extent.max(offset + program.paths);
        }
    };
    for kernel in &program.kernels {
        for op in &kernel.ops {
            match op {
                KernelOp::Assign { args, .. } => args.iter().for_each(&mut visit),
                KernelOp::PartialSum { value, filter, .. } => {
                    visit(value);
                    visit(filter);
                }
                KernelOp::Basis {
                    regressors,
                    value,
                    filter,
                    ..
                } => {
                    regressors.iter().for_each(&mut visit);
                    visit(value);
                    visit(filter);
                }
                KernelOp::Output { source, .. } => visit(source),
                KernelOp::Predict { .. } | KernelOp::Spill { .. } | KernelOp::Combine { .. } => {}
            }
        }
    }
    extent
}

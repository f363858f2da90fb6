use mcgraph::device::BindingRole;
use mcgraph::graph::{lower, GraphRecorder, KernelKind, KernelOp, KernelProgram};
use mcgraph::ir::OpCode;
use mcgraph::settings::Precision;
use mcgraph_backend_c::codegen::{generate_c_module, required_lengths, variate_extent};

fn elementwise_program(precision: Precision) -> KernelProgram {
    let mut graph = GraphRecorder::new(16, 4);
    let spot = graph.add_scalar_input(100.0);
    let moves = graph.add_variates(1);
    let z = moves.start;
    let vol = graph.add_scalar_input(0.2);
    let shock = graph.record(OpCode::Mult, &[vol, z]).unwrap();
    let growth = graph.record(OpCode::Exp, &[shock]).unwrap();
    let path = graph.record(OpCode::Mult, &[spot, growth]).unwrap();
    let cdf = graph.record(OpCode::NormalCdf, &[z]).unwrap();
    let sum = graph.record(OpCode::Add, &[path, cdf, spot]).unwrap();
    graph.declare_output(sum).unwrap();
    lower(&graph, precision).expect("lowering succeeds")
}

#[test]
fn c_codegen_emits_path_loop_and_operands() {
    let program = elementwise_program(Precision::Double);
    let module = generate_c_module(&program).expect("codegen succeeds");
    assert_eq!(module.entrypoints, vec!["mcg_kernel_0".to_string()]);
    assert!(module.source.contains("typedef double mcg_real;"));
    assert!(module.source.contains("#define MCG_PATHS ((size_t)16)"));
    assert!(module.source.contains("int32_t mcg_kernel_0(const mcg_kernel_args* args) {"));
    assert!(module.source.contains("for (size_t tid = 0; tid < MCG_PATHS; ++tid) {"));
    assert!(module.source.contains("args->variates[0 + tid]"));
    assert!(module.source.contains("exp("));
    assert!(module.source.contains("mcg_normal_cdf("));
    assert!(module.source.contains("args->output[0 + tid] = "));
}

#[test]
fn c_codegen_rounds_locals_in_single_precision() {
    let program = elementwise_program(Precision::Single);
    let module = generate_c_module(&program).expect("codegen succeeds");
    assert!(module.source.contains("typedef float mcg_real;"));
    assert!(module.source.contains("= (mcg_real)("));
    assert!(module.source.contains("(double)v"));
}

#[test]
fn c_codegen_emits_partial_sums_and_combine() {
    let mut graph = GraphRecorder::new(600, 4);
    let xs: Vec<f64> = (0..600).map(|i| i as f64).collect();
    let x = graph.add_vector_input(&xs).unwrap();
    let one = graph.add_scalar_input(1.0);
    let mean = graph
        .record(OpCode::ConditionalExpectation, &[x, one])
        .unwrap();
    let centred = graph.record(OpCode::Subtract, &[x, mean]).unwrap();
    graph.declare_output(centred).unwrap();
    let program = lower(&graph, Precision::Double).unwrap();
    assert!(program
        .kernels
        .iter()
        .any(|kernel| kernel.kind == KernelKind::Reduce));

    let module = generate_c_module(&program).unwrap();
    assert_eq!(module.entrypoints.len(), program.kernels.len());
    assert!(module.source.contains("#define MCG_BLOCKS ((size_t)3)"));
    assert!(module
        .source
        .contains("memset(args->partials + 0, 0, MCG_BLOCKS * sizeof(double));"));
    assert!(module.source.contains("if (mcg_selected(args->input["));
    assert!(module
        .source
        .contains("args->partials[0 + tid / MCG_PATH_BLOCK] += args->input["));
    assert!(module
        .source
        .contains("args->results[0] = sum / (double)MCG_PATHS;"));
    assert!(module.source.contains("args->results[0])"));
}

#[test]
fn c_codegen_emits_basis_rows_and_prediction() {
    let mut graph = GraphRecorder::new(64, 2);
    let xs: Vec<f64> = (0..64).map(|i| i as f64 / 64.0).collect();
    let x = graph.add_vector_input(&xs).unwrap();
    let y = graph.add_vector_input(&xs).unwrap();
    let one = graph.add_scalar_input(1.0);
    let fitted = graph
        .record(OpCode::ConditionalExpectation, &[y, one, x])
        .unwrap();
    graph.declare_output(fitted).unwrap();
    let program = lower(&graph, Precision::Double).unwrap();

    let module = generate_c_module(&program).unwrap();
    assert!(module.source.contains("const int keep = mcg_selected("));
    assert!(module.source.contains("const double b0 = 1.0;"));
    assert!(module.source.contains("const double b2 = b1 * b1;"));
    assert!(module.source.contains("args->design[128 + tid] = keep ? b2 : 0.0;"));
    assert!(module.source.contains("args->target[0 + tid] = keep ? "));
    assert!(module.source.contains(
        "args->basis[0 + tid] * args->coeffs[0] + args->basis[64 + tid] * args->coeffs[1]"
    ));
}

#[test]
fn c_codegen_rejects_combine_in_path_kernel() {
    let mut program = elementwise_program(Precision::Double);
    program.kernels[0].ops.push(KernelOp::Combine { slot: 0 });
    let err = generate_c_module(&program).unwrap_err();
    assert!(err.to_string().contains("path kernels cannot combine"), "{err}");
}

#[test]
fn required_lengths_cover_variate_reads() {
    let program = elementwise_program(Precision::Double);
    assert_eq!(variate_extent(&program), 16);
    let required = required_lengths(&program);
    assert!(required.contains(&(BindingRole::Variates, 16)));
    assert!(required.contains(&(BindingRole::Output, 16)));
    assert!(required.contains(&(BindingRole::Values, 0)));
}

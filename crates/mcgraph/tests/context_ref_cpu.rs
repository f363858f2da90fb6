use std::sync::Arc;

use approx::assert_relative_eq;
use mcgraph::graph::MAX_REDUCTION_PATHS;
use mcgraph::reference::{self, Recording};
use mcgraph::{ComputeContext, ComputeError, ComputeFramework, Device, OpCode, Settings};
use mcgraph_backend_ref_cpu::RefCpuDevice;
use proptest::prelude::*;

fn ref_cpu() -> Arc<dyn Device> {
    Arc::new(RefCpuDevice::new())
}

const BINARY_OPS: [OpCode; 6] = [
    OpCode::Add,
    OpCode::Subtract,
    OpCode::Mult,
    OpCode::Min,
    OpCode::Max,
    OpCode::IndicatorGt,
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_elementwise_chains_match_reference(
        xs in prop::collection::vec(-5.0f64..5.0, 9),
        scale in 0.1f64..3.0,
        picks in prop::collection::vec((0usize..BINARY_OPS.len(), any::<bool>()), 1..12),
    ) {
        let mut ctx = ComputeContext::new(ref_cpu());
        ctx.initiate_calculation(xs.len(), 0, 0, Settings::default()).unwrap();
        let x = ctx.create_input_vector(&xs).unwrap();
        let s = ctx.create_input_variable(scale).unwrap();
        let mut acc = x;
        for (pick, use_scalar) in picks {
            let rhs = if use_scalar { s } else { x };
            acc = ctx.apply_operation(BINARY_OPS[pick], &[acc, rhs]).unwrap();
        }
        let abs = ctx.apply_operation(OpCode::Abs, &[acc]).unwrap();
        let root = ctx.apply_operation(OpCode::Sqrt, &[abs]).unwrap();
        ctx.declare_output_variable(acc).unwrap();
        ctx.declare_output_variable(root).unwrap();

        let expected = reference::evaluate(&ctx.recording().unwrap()).unwrap();
        let got = ctx.finalize_to_vec().unwrap();
        prop_assert_eq!(got.len(), expected.len());
        for (got, expected) in got.iter().zip(&expected) {
            for (g, e) in got.iter().zip(expected) {
                prop_assert!((g - e).abs() <= 1e-12 * e.abs().max(1.0), "{} vs {}", g, e);
            }
        }
    }
}

#[test]
fn expectation_rejects_too_many_paths() {
    let mut ctx = ComputeContext::new(ref_cpu());
    ctx.initiate_calculation(MAX_REDUCTION_PATHS + 1, 0, 0, Settings::default())
        .unwrap();
    let x = ctx.create_input_variable(1.0).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let err = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[x, one])
        .unwrap_err();
    assert!(matches!(err, ComputeError::Numerical { .. }), "{err}");
}

#[test]
fn regression_needs_positive_order() {
    let mut ctx = ComputeContext::new(ref_cpu());
    ctx.initiate_calculation(16, 0, 0, Settings::default().with_regression_order(0))
        .unwrap();
    let xs: Vec<f64> = (0..16).map(f64::from).collect();
    let x = ctx.create_input_vector(&xs).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let err = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[x, one, x])
        .unwrap_err();
    assert!(err.to_string().contains("regression order must be at least 1"));
}

#[test]
fn debug_counters_track_builds_and_operations() {
    let settings = Settings::default().with_debug(true);
    let mut ctx = ComputeContext::new(ref_cpu());

    let (id, is_new) = ctx.initiate_calculation(8, 0, 0, settings).unwrap();
    assert!(is_new);
    let x = ctx.create_input_variable(2.0).unwrap();
    let y = ctx.apply_operation(OpCode::Mult, &[x, x]).unwrap();
    let z = ctx.apply_operation(OpCode::Exp, &[y]).unwrap();
    ctx.declare_output_variable(z).unwrap();
    ctx.finalize_to_vec().unwrap();

    let info = ctx.debug_info();
    assert_eq!(info.number_of_program_builds, 1);
    assert_eq!(info.number_of_operations, 16);

    let (same, is_new) = ctx.initiate_calculation(8, id, 0, settings).unwrap();
    assert_eq!(same, id);
    assert!(!is_new);
    ctx.create_input_variable(1.0).unwrap();
    let out = ctx.finalize_to_vec().unwrap();
    assert_relative_eq!(out[0][0], 1.0f64.exp());
    assert_eq!(ctx.debug_info().number_of_program_builds, 1);
}

#[test]
fn single_precision_rounds_path_values() {
    let settings = Settings {
        use_double_precision: false,
        ..Settings::default()
    };
    let mut ctx = ComputeContext::new(ref_cpu());
    ctx.initiate_calculation(2, 0, 0, settings).unwrap();
    let x = ctx.create_input_vector(&[0.1, 1.0 / 3.0]).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let y = ctx.apply_operation(OpCode::Mult, &[x, one]).unwrap();
    ctx.declare_output_variable(y).unwrap();
    let out = ctx.finalize_to_vec().unwrap();
    assert_eq!(out[0], vec![0.1f32 as f64, (1.0f64 / 3.0) as f32 as f64]);
}

#[test]
fn recordings_survive_a_json_round_trip() {
    let mut ctx = ComputeContext::new(ref_cpu());
    ctx.initiate_calculation(32, 0, 0, Settings::default().with_regression_order(2))
        .unwrap();
    let s0 = ctx.create_input_variable(1.0).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let z = ctx.create_input_variates(1, 1).unwrap()[0][0];
    let s1 = ctx.apply_operation(OpCode::Add, &[s0, z]).unwrap();
    let fit = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[s1, one, z])
        .unwrap();
    ctx.declare_output_variable(fit).unwrap();

    let recording = ctx.recording().unwrap();
    let json = serde_json::to_string(&recording).unwrap();
    let restored: Recording = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, recording);

    let expected = reference::evaluate(&restored).unwrap();
    let got = ctx.finalize_to_vec().unwrap();
    for (g, e) in got[0].iter().zip(&expected[0]) {
        assert_relative_eq!(*g, *e, epsilon = 1e-10);
    }
}

#[test]
fn framework_hands_out_one_context_per_device() {
    let framework = ComputeFramework::with_devices(vec![ref_cpu()]);
    assert_eq!(framework.available_devices(), vec!["RefCpu/DEFAULT/Host".to_string()]);

    let context = framework.context("RefCpu/DEFAULT/Host").unwrap();
    let again = framework.context("RefCpu/DEFAULT/Host").unwrap();
    assert!(Arc::ptr_eq(&context, &again));

    let mut ctx = context.lock().unwrap();
    ctx.initiate_calculation(4, 0, 0, Settings::default()).unwrap();
    let a = ctx.create_input_variable(5.0).unwrap();
    ctx.declare_output_variable(a).unwrap();
    assert_eq!(ctx.finalize_to_vec().unwrap(), vec![vec![5.0; 4]]);
}

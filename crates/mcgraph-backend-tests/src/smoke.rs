use std::sync::Arc;

use approx::assert_relative_eq;
use mcgraph::device::Device;
use mcgraph::reference;
use mcgraph::{ComputeContext, ComputeResult, ComputeState, OpCode, Settings, VariableId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Records a Longstaff-Schwartz Bermudan put on one lognormal factor and returns the id of
/// its price (an expectation, broadcast over all paths).
pub fn record_bermudan_put(
    ctx: &mut ComputeContext,
    spot: f64,
    strike: f64,
    steps: usize,
) -> ComputeResult<VariableId> {
    let sigma: f64 = 0.2;
    let dt: f64 = 0.25;
    let s0 = ctx.create_input_variable(spot)?;
    let strike = ctx.create_input_variable(strike)?;
    let drift = ctx.create_input_variable(-0.5 * sigma * sigma * dt)?;
    let vol = ctx.create_input_variable(sigma * dt.sqrt())?;
    let zero = ctx.create_input_variable(0.0)?;
    let one = ctx.create_input_variable(1.0)?;
    let z = ctx.create_input_variates(1, steps)?;

    let mut spots = Vec::with_capacity(steps);
    let mut s = s0;
    for draw in &z[0] {
        let shock = ctx.apply_operation(OpCode::Mult, &[vol, *draw])?;
        let shock = ctx.apply_operation(OpCode::Add, &[shock, drift])?;
        let growth = ctx.apply_operation(OpCode::Exp, &[shock])?;
        s = ctx.apply_operation(OpCode::Mult, &[s, growth])?;
        spots.push(s);
    }

    let mut value = put_intrinsic(ctx, strike, zero, spots[steps - 1])?;
    for t in (0..steps - 1).rev() {
        let exercise = put_intrinsic(ctx, strike, zero, spots[t])?;
        let itm = ctx.apply_operation(OpCode::IndicatorGt, &[exercise, zero])?;
        let continuation =
            ctx.apply_operation(OpCode::ConditionalExpectation, &[value, itm, spots[t]])?;
        let better = ctx.apply_operation(OpCode::IndicatorGt, &[exercise, continuation])?;
        let take = ctx.apply_operation(OpCode::Mult, &[better, itm])?;
        let keep = ctx.apply_operation(OpCode::Subtract, &[one, take])?;
        let exercised = ctx.apply_operation(OpCode::Mult, &[take, exercise])?;
        let held = ctx.apply_operation(OpCode::Mult, &[keep, value])?;
        value = ctx.apply_operation(OpCode::Add, &[exercised, held])?;
    }
    ctx.apply_operation(OpCode::ConditionalExpectation, &[value, one])
}

fn put_intrinsic(
    ctx: &mut ComputeContext,
    strike: VariableId,
    zero: VariableId,
    spot: VariableId,
) -> ComputeResult<VariableId> {
    let diff = ctx.apply_operation(OpCode::Subtract, &[strike, spot])?;
    ctx.apply_operation(OpCode::Max, &[diff, zero])
}

fn assert_matches_reference(ctx: &mut ComputeContext, tolerance: f64) -> Vec<Vec<f64>> {
    let recording = ctx.recording().expect("calculation in progress");
    let expected = reference::evaluate(&recording).expect("reference evaluation succeeds");
    let actual = ctx.finalize_to_vec().expect("finalize succeeds");
    assert_eq!(actual.len(), expected.len());
    for (got, want) in actual.iter().zip(&expected) {
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want) {
            assert_relative_eq!(*g, *w, epsilon = tolerance, max_relative = tolerance);
        }
    }
    actual
}

pub fn scenario_expectation_is_five(device: &Arc<dyn Device>) {
    let mut ctx = ComputeContext::new(Arc::clone(device));
    let (slot, is_new) = ctx
        .initiate_calculation(4, 0, 0, Settings::default())
        .unwrap();
    assert_eq!(slot, 1);
    assert!(is_new);
    let a = ctx.create_input_variable(2.0).unwrap();
    let b = ctx.create_input_vector(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    let ones = ctx.create_input_vector(&[1.0; 4]).unwrap();
    let c = ctx.apply_operation(OpCode::Mult, &[a, b]).unwrap();
    let e = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[c, ones])
        .unwrap();
    ctx.declare_output_variable(e).unwrap();

    let out = ctx.finalize_to_vec().unwrap();
    assert_eq!(out, vec![vec![5.0; 4]]);
    assert_eq!(ctx.state(), ComputeState::Idle);
}

pub fn elementwise_ops_match_reference(device: &Arc<dyn Device>) {
    let n = 37;
    let mut rng = StdRng::seed_from_u64(7);
    let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(0.5..2.0)).collect();
    let mut ys: Vec<f64> = (0..n).map(|_| rng.gen_range(0.5..2.0)).collect();
    ys[3] = xs[3];

    let mut ctx = ComputeContext::new(Arc::clone(device));
    ctx.initiate_calculation(n, 0, 0, Settings::default())
        .unwrap();
    let x = ctx.create_input_vector(&xs).unwrap();
    let y = ctx.create_input_vector(&ys).unwrap();
    let s = ctx.create_input_variable(1.5).unwrap();

    let binary = [
        OpCode::Subtract,
        OpCode::Mult,
        OpCode::Div,
        OpCode::IndicatorEq,
        OpCode::IndicatorGt,
        OpCode::IndicatorGeq,
        OpCode::Min,
        OpCode::Max,
        OpCode::Pow,
    ];
    let unary = [
        OpCode::None,
        OpCode::Negative,
        OpCode::Abs,
        OpCode::Exp,
        OpCode::Sqrt,
        OpCode::Log,
        OpCode::NormalCdf,
        OpCode::NormalPdf,
    ];
    let mut results = vec![ctx.apply_operation(OpCode::Add, &[x, y, s]).unwrap()];
    for op in binary {
        results.push(ctx.apply_operation(op, &[x, y]).unwrap());
        results.push(ctx.apply_operation(op, &[s, x]).unwrap());
    }
    for op in unary {
        results.push(ctx.apply_operation(op, &[y]).unwrap());
    }
    let chained = ctx.apply_operation(OpCode::Mult, &results[..2]).unwrap();
    results.push(chained);
    for id in results {
        ctx.declare_output_variable(id).unwrap();
    }

    assert_matches_reference(&mut ctx, 1e-12);
}

pub fn expectation_respects_filter(device: &Arc<dyn Device>) {
    // more paths than one reduction block
    let n = 300;
    let values: Vec<f64> = (0..n).map(|i| (i % 17) as f64 - 4.5).collect();
    let mask: Vec<f64> = (0..n).map(|i| (i % 3 == 0) as u8 as f64).collect();

    let mut ctx = ComputeContext::new(Arc::clone(device));
    ctx.initiate_calculation(n, 0, 0, Settings::default())
        .unwrap();
    let v = ctx.create_input_vector(&values).unwrap();
    let m = ctx.create_input_vector(&mask).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let zero = ctx.create_input_variable(0.0).unwrap();
    let all = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[v, one])
        .unwrap();
    let none = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[v, zero])
        .unwrap();
    let some = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[v, m])
        .unwrap();
    for id in [all, none, some] {
        ctx.declare_output_variable(id).unwrap();
    }

    let out = ctx.finalize_to_vec().unwrap();
    let mean = values.iter().sum::<f64>() / n as f64;
    let filtered = values
        .iter()
        .zip(&mask)
        .map(|(v, m)| v * m)
        .sum::<f64>()
        / n as f64;
    for path in [0, 150, n - 1] {
        assert_relative_eq!(out[0][path], mean, epsilon = 1e-12);
        assert_eq!(out[1][path], 0.0);
        assert_relative_eq!(out[2][path], filtered, epsilon = 1e-12);
    }
}

pub fn conditional_expectation_matches_ols(device: &Arc<dyn Device>) {
    let n = 64;
    let mut rng = StdRng::seed_from_u64(11);
    let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|x| 1.0 + 2.0 * x + rng.gen_range(-0.1..0.1))
        .collect();

    let mut ctx = ComputeContext::new(Arc::clone(device));
    ctx.initiate_calculation(n, 0, 0, Settings::default().with_regression_order(1))
        .unwrap();
    let x = ctx.create_input_vector(&xs).unwrap();
    let y = ctx.create_input_vector(&ys).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let fitted = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[y, one, x])
        .unwrap();
    ctx.declare_output_variable(fitted).unwrap();
    let out = ctx.finalize_to_vec().unwrap();

    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let cov: f64 = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();
    let var: f64 = xs.iter().map(|x| (x - mean_x) * (x - mean_x)).sum();
    let beta = cov / var;
    let alpha = mean_y - beta * mean_x;
    for (x, got) in xs.iter().zip(&out[0]) {
        assert_relative_eq!(*got, alpha + beta * x, epsilon = 1e-9);
    }
}

pub fn conditional_expectation_with_empty_filter_is_zero(device: &Arc<dyn Device>) {
    let n = 8;
    let xs: Vec<f64> = (0..n).map(|i| 1.0 + i as f64).collect();

    let mut ctx = ComputeContext::new(Arc::clone(device));
    ctx.initiate_calculation(n, 0, 0, Settings::default().with_regression_order(1))
        .unwrap();
    let x = ctx.create_input_vector(&xs).unwrap();
    let zero = ctx.create_input_variable(0.0).unwrap();
    let fitted = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[x, zero, x])
        .unwrap();
    let shifted = ctx.apply_operation(OpCode::Add, &[fitted, x]).unwrap();
    ctx.declare_output_variable(fitted).unwrap();
    ctx.declare_output_variable(shifted).unwrap();

    let out = assert_matches_reference(&mut ctx, 1e-12);
    assert_eq!(out[0], vec![0.0; n]);
    assert_eq!(out[1], xs);
}

pub fn deep_out_of_the_money_put_is_worthless(device: &Arc<dyn Device>) {
    let mut ctx = ComputeContext::new(Arc::clone(device));
    ctx.initiate_calculation(512, 0, 0, Settings::default().with_regression_order(2))
        .unwrap();
    // no path comes near the strike, so every exercise date has an empty regression filter
    let price = record_bermudan_put(&mut ctx, 400.0, 100.0, 4).unwrap();
    ctx.declare_output_variable(price).unwrap();

    let out = assert_matches_reference(&mut ctx, 1e-12);
    assert_eq!(out[0], vec![0.0; 512]);
    assert_eq!(ctx.state(), ComputeState::Idle);
}

pub fn bermudan_put_matches_reference(device: &Arc<dyn Device>) {
    let mut ctx = ComputeContext::new(Arc::clone(device));
    ctx.initiate_calculation(512, 0, 0, Settings::default().with_regression_order(2))
        .unwrap();
    let price = record_bermudan_put(&mut ctx, 100.0, 100.0, 4).unwrap();
    ctx.declare_output_variable(price).unwrap();

    let out = assert_matches_reference(&mut ctx, 1e-9);
    assert!(out[0][0] > 0.0 && out[0][0] < 100.0);
    assert!(out[0].iter().all(|v| *v == out[0][0]));
}

pub fn batched_sync_nodes_match_reference(device: &Arc<dyn Device>) {
    let n = 96;
    let mut rng = StdRng::seed_from_u64(3);
    let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut ctx = ComputeContext::new(Arc::clone(device));
    ctx.initiate_calculation(n, 0, 0, Settings::default().with_regression_order(3))
        .unwrap();
    let x = ctx.create_input_vector(&xs).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let z = ctx.create_input_variates(2, 1).unwrap();
    let square = ctx.apply_operation(OpCode::Mult, &[x, x]).unwrap();
    let noisy = ctx.apply_operation(OpCode::Add, &[square, z[0][0]]).unwrap();
    // nothing reads these until after all four are recorded: one shared stage
    let mean = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[noisy, one])
        .unwrap();
    let second = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[z[1][0], one])
        .unwrap();
    let fit_a = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[noisy, one, x])
        .unwrap();
    let fit_b = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[square, one, z[1][0]])
        .unwrap();
    let combined = ctx.apply_operation(OpCode::Add, &[fit_a, fit_b, mean]).unwrap();
    let scaled = ctx.apply_operation(OpCode::Mult, &[combined, second]).unwrap();
    ctx.declare_output_variable(scaled).unwrap();
    ctx.declare_output_variable(noisy).unwrap();
    ctx.declare_output_variable(mean).unwrap();

    assert_matches_reference(&mut ctx, 1e-9);
}

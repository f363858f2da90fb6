use std::sync::Arc;

use approx::assert_relative_eq;
use mcgraph::device::Device;
use mcgraph::graph::Step;
use mcgraph::rng::normal_variates;
use mcgraph::{ComputeContext, ComputeFramework, ComputeState, OpCode, Settings, VariableId};

use crate::recording_device::RecordingDevice;
use crate::smoke::record_bermudan_put;

fn record_scaled_mean(ctx: &mut ComputeContext, scale: f64, xs: &[f64]) -> [VariableId; 2] {
    let a = ctx.create_input_variable(scale).unwrap();
    let x = ctx.create_input_vector(xs).unwrap();
    let one = ctx.create_input_variable(1.0).unwrap();
    let y = ctx.apply_operation(OpCode::Mult, &[a, x]).unwrap();
    let mean = ctx
        .apply_operation(OpCode::ConditionalExpectation, &[y, one])
        .unwrap();
    ctx.declare_output_variable(y).unwrap();
    ctx.declare_output_variable(mean).unwrap();
    [y, mean]
}

fn resupply_scaled_mean(ctx: &mut ComputeContext, scale: f64, xs: &[f64]) {
    ctx.create_input_variable(scale).unwrap();
    ctx.create_input_vector(xs).unwrap();
    ctx.create_input_variable(1.0).unwrap();
}

pub fn cached_chain_is_reused(device: &Arc<dyn Device>) {
    let settings = Settings::default().with_debug(true);
    let mut ctx = ComputeContext::new(Arc::clone(device));
    let (slot, is_new) = ctx.initiate_calculation(4, 0, 0, settings).unwrap();
    assert!(is_new);
    record_scaled_mean(&mut ctx, 2.0, &[1.0, 2.0, 3.0, 4.0]);
    let first = ctx.finalize_to_vec().unwrap();
    assert_eq!(first[1], vec![5.0; 4]);
    let after_build = ctx.debug_info();
    assert_eq!(after_build.number_of_program_builds, 1);

    let (again, is_new) = ctx.initiate_calculation(4, slot, 0, settings).unwrap();
    assert_eq!(again, slot);
    assert!(!is_new);
    let err = ctx.apply_operation(OpCode::Add, &[0, 1]).unwrap_err();
    assert!(err.is_usage());
    resupply_scaled_mean(&mut ctx, 3.0, &[2.0, 2.0, 2.0, 2.0]);
    let second = ctx.finalize_to_vec().unwrap();
    assert_eq!(second[0], vec![6.0; 4]);
    assert_eq!(second[1], vec![6.0; 4]);

    let info = ctx.debug_info();
    assert_eq!(info.number_of_program_builds, 1);
    assert_eq!(
        info.nano_seconds_program_build,
        after_build.nano_seconds_program_build
    );
}

pub fn cached_chain_checks_input_layout(device: &Arc<dyn Device>) {
    let mut ctx = ComputeContext::new(Arc::clone(device));
    let (slot, _) = ctx
        .initiate_calculation(4, 0, 0, Settings::default())
        .unwrap();
    record_scaled_mean(&mut ctx, 2.0, &[1.0; 4]);
    ctx.finalize_to_vec().unwrap();

    ctx.initiate_calculation(4, slot, 0, Settings::default())
        .unwrap();
    let err = ctx.create_input_vector(&[1.0; 4]).unwrap_err();
    assert!(err.is_usage());
    ctx.create_input_variable(2.0).unwrap();
    let err = ctx.finalize_to_vec().unwrap_err();
    assert!(err.is_usage());
    assert_eq!(ctx.state(), ComputeState::Idle);
}

pub fn version_change_rebuilds(device: &Arc<dyn Device>) {
    let recording = Arc::new(RecordingDevice::new(Arc::clone(device)));
    let mut ctx = ComputeContext::new(Arc::clone(&recording) as Arc<dyn Device>);
    let settings = Settings::default().with_debug(true);

    let (first, _) = ctx.initiate_calculation(4, 0, 0, settings).unwrap();
    record_scaled_mean(&mut ctx, 2.0, &[1.0, 2.0, 3.0, 4.0]);
    ctx.finalize_to_vec().unwrap();

    let (second, _) = ctx.initiate_calculation(4, 0, 0, settings).unwrap();
    assert_ne!(first, second);
    record_scaled_mean(&mut ctx, 1.0, &[1.0; 4]);
    ctx.finalize_to_vec().unwrap();
    let buffers_before = ctx.allocated_buffers(first);
    assert!(buffers_before > 0);

    let (same, is_new) = ctx.initiate_calculation(4, first, 1, settings).unwrap();
    assert_eq!(same, first);
    assert!(is_new);
    let x = ctx.create_input_vector(&[1.0, 1.0, 2.0, 2.0]).unwrap();
    let y = ctx.apply_operation(OpCode::Exp, &[x]).unwrap();
    ctx.declare_output_variable(y).unwrap();
    let out = ctx.finalize_to_vec().unwrap();
    assert_relative_eq!(out[0][3], 2.0f64.exp(), max_relative = 1e-15);
    assert_eq!(ctx.debug_info().number_of_program_builds, 3);
    assert_eq!(recording.built_programs().len(), 3);

    // the other slot still runs from its own chain
    let (_, is_new) = ctx.initiate_calculation(4, second, 0, settings).unwrap();
    assert!(!is_new);
    resupply_scaled_mean(&mut ctx, 1.0, &[4.0; 4]);
    let out = ctx.finalize_to_vec().unwrap();
    assert_eq!(out[1], vec![4.0; 4]);
    assert_eq!(ctx.debug_info().number_of_program_builds, 3);
}

pub fn variate_prefix_is_stable(device: &Arc<dyn Device>) {
    let settings = Settings::default();
    let n = 8;
    let mut ctx = ComputeContext::new(Arc::clone(device));
    let (slot, _) = ctx.initiate_calculation(n, 0, 0, settings).unwrap();
    let z = ctx.create_input_variates(1, 2).unwrap();
    for id in &z[0] {
        ctx.declare_output_variable(*id).unwrap();
    }
    let first = ctx.finalize_to_vec().unwrap();

    let draws = normal_variates(settings.rng_seed, 2 * n);
    assert_eq!(first[0], draws[..n].to_vec());
    assert_eq!(first[1], draws[n..].to_vec());
    let capacity = ctx.variate_capacity();

    // a larger graph grows the shared pool
    ctx.initiate_calculation(n, 0, 0, settings).unwrap();
    let wide = ctx.create_input_variates(3, 300).unwrap();
    assert_eq!(wide.len(), 3);
    assert_eq!(wide[1][0], wide[0][299] + 1);
    ctx.declare_output_variable(wide[2][299]).unwrap();
    let tail = ctx.finalize_to_vec().unwrap();
    assert!(ctx.variate_capacity() > capacity);
    let grown = normal_variates(settings.rng_seed, 900 * n);
    assert_eq!(tail[0], grown[899 * n..].to_vec());

    ctx.initiate_calculation(n, slot, 0, settings).unwrap();
    let again = ctx.finalize_to_vec().unwrap();
    assert_eq!(again, first);
}

pub fn disposed_slot_rejects_reuse(device: &Arc<dyn Device>) {
    let mut ctx = ComputeContext::new(Arc::clone(device));
    let (slot, _) = ctx
        .initiate_calculation(4, 0, 0, Settings::default())
        .unwrap();
    record_scaled_mean(&mut ctx, 2.0, &[1.0; 4]);
    ctx.finalize_to_vec().unwrap();
    assert!(ctx.allocated_buffers(slot) > 0);

    ctx.dispose_calculation(slot).unwrap();
    assert_eq!(ctx.allocated_buffers(slot), 0);

    let err = ctx
        .initiate_calculation(4, slot, 0, Settings::default())
        .unwrap_err();
    assert!(err.is_usage());
    assert!(err.to_string().contains("disposed"));

    let err = ctx.dispose_calculation(slot).unwrap_err();
    assert!(err.to_string().contains("already disposed"));

    let err = ctx
        .initiate_calculation(4, slot + 1, 0, Settings::default())
        .unwrap_err();
    assert!(err.to_string().contains("out of range"));
}

pub fn failed_finalize_returns_to_idle(device: &Arc<dyn Device>) {
    let mut ctx = ComputeContext::new(Arc::clone(device));
    let (slot, _) = ctx
        .initiate_calculation(4, 0, 0, Settings::default())
        .unwrap();
    record_scaled_mean(&mut ctx, 2.0, &[1.0; 4]);

    let mut only = [0.0; 4];
    let err = ctx.finalize_calculation(&mut [&mut only[..]]).unwrap_err();
    assert!(err.is_usage());
    assert_eq!(ctx.state(), ComputeState::Idle);

    // nothing was compiled, so the slot records again from scratch
    let (_, is_new) = ctx
        .initiate_calculation(4, slot, 0, Settings::default())
        .unwrap();
    assert!(is_new);
    record_scaled_mean(&mut ctx, 1.0, &[3.0; 4]);
    let out = ctx.finalize_to_vec().unwrap();
    assert_eq!(out[1], vec![3.0; 4]);
}

pub fn state_machine_rejects_out_of_order_calls(device: &Arc<dyn Device>) {
    let mut ctx = ComputeContext::new(Arc::clone(device));
    assert!(ctx.create_input_variable(1.0).unwrap_err().is_usage());
    assert!(ctx.finalize_to_vec().unwrap_err().is_usage());
    assert!(ctx
        .initiate_calculation(0, 0, 0, Settings::default())
        .unwrap_err()
        .is_usage());

    let (slot, _) = ctx
        .initiate_calculation(4, 0, 0, Settings::default())
        .unwrap();
    assert!(ctx
        .initiate_calculation(4, 0, 0, Settings::default())
        .unwrap_err()
        .is_usage());
    let x = ctx.create_input_variable(1.0).unwrap();
    ctx.create_input_variates(1, 1).unwrap();
    assert!(ctx.create_input_variable(2.0).unwrap_err().is_usage());
    assert!(ctx.free_variable(x).unwrap_err().is_usage());
    let y = ctx.apply_operation(OpCode::Negative, &[x]).unwrap();
    assert!(ctx.create_input_variates(1, 1).unwrap_err().is_usage());
    let err = ctx.apply_operation_code(99, &[y]).unwrap_err();
    assert!(matches!(err, mcgraph::ComputeError::Internal { .. }));
    ctx.declare_output_variable(y).unwrap();
    ctx.finalize_to_vec().unwrap();

    let err = ctx
        .initiate_calculation(8, slot, 0, Settings::default())
        .unwrap_err();
    assert!(err.to_string().contains("paths"));
}

pub fn schedule_launches_in_order(device: &Arc<dyn Device>) {
    let recording = Arc::new(RecordingDevice::new(Arc::clone(device)));
    let mut ctx = ComputeContext::new(Arc::clone(&recording) as Arc<dyn Device>);
    let settings = Settings::default().with_regression_order(2);
    let (slot, _) = ctx.initiate_calculation(256, 0, 0, settings).unwrap();
    let price = record_bermudan_put(&mut ctx, 100.0, 100.0, 3).unwrap();
    ctx.declare_output_variable(price).unwrap();
    ctx.finalize_to_vec().unwrap();

    let program = recording.last_program_or_panic();
    let expected: Vec<usize> = program
        .schedule
        .iter()
        .filter_map(|step| match step {
            Step::Launch(kernel) => Some(*kernel),
            Step::Solve(_) => None,
        })
        .collect();
    assert_eq!(recording.launched_kernels(), expected);
    assert!(program
        .schedule
        .iter()
        .any(|step| matches!(step, Step::Solve(_))));

    recording.clear_launches();
    ctx.initiate_calculation(256, slot, 0, settings).unwrap();
    record_bermudan_inputs(&mut ctx, 95.0, 100.0);
    ctx.finalize_to_vec().unwrap();
    assert_eq!(recording.launched_kernels(), expected);
    assert_eq!(recording.built_programs().len(), 1);
}

fn record_bermudan_inputs(ctx: &mut ComputeContext, spot: f64, strike: f64) {
    let sigma: f64 = 0.2;
    let dt: f64 = 0.25;
    for value in [
        spot,
        strike,
        -0.5 * sigma * sigma * dt,
        sigma * dt.sqrt(),
        0.0,
        1.0,
    ] {
        ctx.create_input_variable(value).unwrap();
    }
}

pub fn framework_resolves_device_names(device: &Arc<dyn Device>) {
    let name = device.info().identifier();
    let framework = ComputeFramework::with_devices(vec![Arc::clone(device)]);
    assert_eq!(framework.available_devices(), vec![name.clone()]);

    let ctx = framework.context(&name).unwrap();
    let again = framework.context(&name).unwrap();
    assert!(Arc::ptr_eq(&ctx, &again));

    let err = framework.context("Missing/0/Nothing").err().unwrap();
    let message = err.to_string();
    assert!(message.contains("Missing/0/Nothing"));
    assert!(message.contains(&name));
}

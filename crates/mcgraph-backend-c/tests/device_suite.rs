use std::sync::Arc;

use approx::assert_relative_eq;
use mcgraph::device::{Device, KernelBindings};
use mcgraph::graph::{lower, GraphRecorder, KernelProgram};
use mcgraph::ir::OpCode;
use mcgraph::settings::Precision;
use mcgraph_backend_c::CJitDevice;

mcgraph_backend_tests::define_device_tests!(
    c_jit,
    || { Arc::new(CJitDevice::new()) as Arc<dyn Device> },
    available = CJitDevice::is_available()
);

fn device_or_skip() -> Option<(tempfile::TempDir, CJitDevice)> {
    if !CJitDevice::is_available() {
        eprintln!("skipping C device test: no C compiler");
        return None;
    }
    let dir = tempfile::tempdir().expect("create cache dir");
    let device = CJitDevice::with_cache_dir(dir.path());
    Some((dir, device))
}

fn scaled_sum(paths: usize) -> (GraphRecorder, Arc<KernelProgram>) {
    let mut graph = GraphRecorder::new(paths, 4);
    let scale = graph.add_scalar_input(3.0);
    let xs: Vec<f64> = (0..paths).map(|i| i as f64).collect();
    let x = graph.add_vector_input(&xs).unwrap();
    let y = graph.record(OpCode::Mult, &[scale, x]).unwrap();
    let z = graph.record(OpCode::Add, &[y, x, scale]).unwrap();
    graph.declare_output(z).unwrap();
    let program = Arc::new(lower(&graph, Precision::Double).unwrap());
    (graph, program)
}

fn library_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.starts_with("libmcgraph_c_") && !name.contains(".tmp")
        })
        .count()
}

#[test]
fn identical_programs_share_one_library() {
    let Some((dir, device)) = device_or_skip() else {
        return;
    };
    let (_, program) = scaled_sum(8);
    let first = device.build(&program).unwrap();
    let second = device.build(&Arc::new((*program).clone())).unwrap();
    assert_ne!(first, second);
    assert_eq!(library_count(dir.path()), 1);
    assert_eq!(device.live_modules(), 2);

    device.release_module(first).unwrap();
    device.release_module(second).unwrap();
    assert_eq!(device.live_modules(), 0);
}

#[test]
fn compiled_kernel_writes_outputs() {
    let Some((_dir, device)) = device_or_skip() else {
        return;
    };
    let (graph, program) = scaled_sum(8);
    let module = device.build(&program).unwrap();
    let input = device.allocate(program.layout.input).unwrap();
    device.upload(input, 0, graph.staging()).unwrap();
    let output = device.allocate(program.layout.output).unwrap();
    let bindings = KernelBindings {
        input: Some(input),
        output: Some(output),
        ..KernelBindings::default()
    };
    device.launch(module, 0, &bindings).unwrap();

    let mut out = vec![0.0; 8];
    device.download(output, 0, &mut out).unwrap();
    for (i, got) in out.iter().enumerate() {
        assert_relative_eq!(*got, 4.0 * i as f64 + 3.0);
    }
}

#[test]
fn short_bindings_are_rejected_before_the_call() {
    let Some((_dir, device)) = device_or_skip() else {
        return;
    };
    let (_, program) = scaled_sum(8);
    let module = device.build(&program).unwrap();
    let input = device.allocate(program.layout.input).unwrap();
    let output = device.allocate(4).unwrap();
    let bindings = KernelBindings {
        input: Some(input),
        output: Some(output),
        ..KernelBindings::default()
    };
    let err = device.launch(module, 0, &bindings).unwrap_err();
    assert!(err.to_string().contains("access needs 8"), "{err}");
    assert_eq!(device.live_buffers(), 2);
}

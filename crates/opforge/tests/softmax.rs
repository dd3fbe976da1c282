use opforge::{GeneratorOptions, HostExecutor, KernelError, Operator};
use opforge_api::{DataType, SoftmaxAttributes};

fn executor() -> HostExecutor {
    HostExecutor::with_options(GeneratorOptions::default())
}

fn last_axis() -> Operator {
    Operator::Softmax(SoftmaxAttributes::new(-1))
}

fn cpu_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

#[test]
fn small_row_matches_reference_values() {
    let mut exec = executor();
    let x = exec.upload(&[1, 3], DataType::Float32, &[1.0, 2.0, 3.0]).unwrap();
    let outputs = exec.run(&last_axis(), &[x]).expect("softmax");
    assert_eq!(outputs[0].dims, vec![1, 3]);
    let got = exec.download(&outputs[0]).unwrap();
    let want = [0.0900, 0.2447, 0.6652];
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!((g - w).abs() < 1e-4, "col {i}: got={g} want={w}");
    }
}

#[test]
fn wide_rows_are_normalized() {
    let rows = 5;
    let cols = 200;
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| ((i * 31) % 97) as f32 * 0.125 - 6.0)
        .collect();
    let mut exec = executor();
    let x = exec.upload(&[rows, cols], DataType::Float32, &data).unwrap();
    let outputs = exec.run(&last_axis(), &[x]).unwrap();
    let got = exec.download(&outputs[0]).unwrap();
    for r in 0..rows {
        let row = &got[r * cols..(r + 1) * cols];
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "row {r} sums to {sum}");
        assert!(row.iter().all(|v| (0.0..=1.0).contains(v)));
        let want = cpu_softmax(&data[r * cols..(r + 1) * cols]);
        for (c, (g, w)) in row.iter().zip(want.iter()).enumerate() {
            assert!((g - w).abs() < 1e-5, "({r},{c}): got={g} want={w}");
        }
    }
    let record = &exec.dispatches()[0];
    assert_eq!(record.dispatch.x, rows as u32);
    assert_eq!(record.workgroup_size.total(), 64);
}

#[test]
fn higher_rank_input_uses_last_axis_rows() {
    let mut exec = executor();
    let data: Vec<f32> = (0..24).map(|i| i as f32 * 0.1).collect();
    let x = exec.upload(&[2, 3, 4], DataType::Float32, &data).unwrap();
    let outputs = exec
        .run(&Operator::Softmax(SoftmaxAttributes::new(2)), &[x])
        .unwrap();
    assert_eq!(outputs[0].dims, vec![2, 3, 4]);
    assert_eq!(exec.dispatches()[0].dispatch.x, 6);
    let got = exec.download(&outputs[0]).unwrap();
    for r in 0..6 {
        let want = cpu_softmax(&data[r * 4..(r + 1) * 4]);
        for c in 0..4 {
            assert!((got[r * 4 + c] - want[c]).abs() < 1e-6);
        }
    }
}

#[test]
fn huge_magnitudes_stay_finite() {
    let mut exec = executor();
    let x = exec
        .upload(&[2, 2], DataType::Float32, &[1e30, 0.0, -1e30, 1e30])
        .unwrap();
    let outputs = exec.run(&last_axis(), &[x]).unwrap();
    let got = exec.download(&outputs[0]).unwrap();
    assert!(got.iter().all(|v| v.is_finite()), "{got:?}");
    assert_eq!(got, vec![1.0, 0.0, 0.0, 1.0]);
}

#[test]
fn rejected_inputs_never_dispatch() {
    let mut exec = executor();
    let x = exec.upload(&[2, 3], DataType::Float32, &[0.0; 6]).unwrap();

    let err = exec
        .run(&Operator::Softmax(SoftmaxAttributes::new(0)), &[x.clone()])
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidArgument(_)), "{err}");
    assert!(err.to_string().contains("last axis"), "{err}");

    let err = exec.run(&last_axis(), &[x.clone(), x.clone()]).unwrap_err();
    assert!(err.is_invalid_argument(), "{err}");

    let ints = exec.upload(&[2, 3], DataType::Int32, &[0.0; 6]).unwrap();
    let err = exec.run(&last_axis(), &[ints]).unwrap_err();
    assert!(
        matches!(err, KernelError::InvalidArgument(_) | KernelError::UnsupportedDataType(_)),
        "{err}"
    );

    assert!(exec.dispatches().is_empty());
}

#[test]
fn half_precision_generates_f16_shader() {
    let mut exec = executor();
    let x = exec
        .upload(&[2, 3], DataType::Float16, &[1.0, 2.0, 3.0, 0.0, 0.0, 0.0])
        .unwrap();
    let outputs = exec.run(&last_axis(), &[x]).unwrap();
    assert_eq!(outputs[0].data_type, DataType::Float16);
    let got = exec.download(&outputs[0]).unwrap();
    assert!((got[2] - 0.6652).abs() < 1e-3);
    assert!((got[3] - 1.0 / 3.0).abs() < 1e-3);
    let src = &exec.dispatches()[0].program.shader_source;
    assert!(src.starts_with("enable f16;"), "{src}");
    assert!(src.contains("array<f16, 64>"));
}

#[test]
fn empty_rows_dispatch_nothing() {
    let mut exec = executor();
    let x = exec.upload(&[0, 8], DataType::Float32, &[]).unwrap();
    let outputs = exec.run(&last_axis(), &[x]).unwrap();
    assert_eq!(outputs[0].dims, vec![0, 8]);
    assert!(exec.download(&outputs[0]).unwrap().is_empty());
    assert_eq!(exec.dispatches()[0].dispatch.total(), 0);
}

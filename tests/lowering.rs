mod common;

use std::collections::HashMap;

use common::{Interpreter, Value};
use pretty_assertions::assert_eq;
use tensor_lowering::{
    expand_loop, flatten_function, lower_source, parse, ComputeGraph, Expr, FunctionKind,
    LowerError, ReduceOp, ScalarType,
};

#[test]
fn test_grid_writes_every_coordinate_once() {
    let func = lower_source(
        "input x: i32[1];
         let G = grid[i: 3, j: 4] => i * 4 + j + x[0];",
        "iota",
        FunctionKind::Host,
    )
    .unwrap();

    let (results, interp) = Interpreter::run(
        &func,
        vec![Value::tensor(&[1], vec![10.0]), Value::zeros(&[3, 4])],
    );
    let expected: Vec<f64> = (0..12).map(|v| v as f64 + 10.0).collect();
    assert_eq!(results[1].data(), expected.as_slice());

    let out = func.params[1].id;
    for flat in 0..12 {
        assert_eq!(interp.stores.get(&(out, flat)), Some(&1), "coordinate {}", flat);
    }
    assert_eq!(interp.stores.len(), 12);
}

#[test]
fn test_matmul_matches_reference() {
    let source = "
        input A: f32[2, 3];
        input B: f32[3, 2];
        let C = grid[i: 2, j: 2] => sum[k: 3] => A[i, k] * B[k, j];
    ";
    let func = lower_source(source, "matmul", FunctionKind::Host).unwrap();
    let a = Value::tensor(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = Value::tensor(&[3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);

    let (results, _) = Interpreter::run(&func, vec![a.clone(), b.clone(), Value::zeros(&[2, 2])]);
    assert_eq!(results[2].data(), &[58.0, 64.0, 139.0, 154.0]);

    // flattening preserves the result
    let flat = flatten_function(&func).unwrap();
    let (results, _) = Interpreter::run(&flat, vec![a, b, Value::zeros(&[2, 2])]);
    assert_eq!(results[2].data(), &[58.0, 64.0, 139.0, 154.0]);
}

#[test]
fn test_sum_and_mean() {
    let source = "
        input x: f32[4];
        let total = sum[k: 4] => x[k];
        let avg = mean[k: 4] => x[k];
        output total, avg;
    ";
    let func = lower_source(source, "stats", FunctionKind::Host).unwrap();
    let x = Value::tensor(&[4], vec![1.0, 2.0, 3.0, 6.0]);
    let (results, _) = Interpreter::run(&func, vec![x, Value::Scalar(0.0), Value::Scalar(0.0)]);
    assert_eq!(results[1].scalar(), 12.0);
    assert_eq!(results[2].scalar(), 3.0);
}

#[test]
fn test_max_prod_and_row_reduction() {
    let source = "
        input x: f32[2, 3];
        let rowmax = grid[r: 2] => max[c: 3] => x[r, c];
        let p = prod[r: 2, c: 3] => x[r, c];
        output rowmax, p;
    ";
    let func = lower_source(source, "rows", FunctionKind::Host).unwrap();
    let x = Value::tensor(&[2, 3], vec![1.0, -2.0, 3.0, -4.0, -5.0, -0.5]);
    let (results, _) = Interpreter::run(&func, vec![x, Value::zeros(&[2]), Value::Scalar(0.0)]);
    assert_eq!(results[1].data(), &[3.0, -0.5]);
    assert_eq!(results[2].scalar(), 60.0);
}

#[test]
fn test_argmax_reports_first_maximum() {
    let source = "
        input x: f32[4];
        let best = argmax<i64>[k: 4] => x[k];
    ";
    let func = lower_source(source, "best", FunctionKind::Host).unwrap();
    let x = Value::tensor(&[4], vec![3.0, 5.0, 5.0, 2.0]);
    let (results, _) = Interpreter::run(&func, vec![x, Value::Scalar(-1.0)]);
    assert_eq!(results[1].scalar(), 1.0);
}

#[test]
fn test_argmin_reports_first_minimum() {
    let source = "
        input x: f32[5];
        let worst = argmin[k: 5] => x[k];
    ";
    let func = lower_source(source, "worst", FunctionKind::Host).unwrap();
    let x = Value::tensor(&[5], vec![3.0, 1.0, 4.0, 1.0, 5.0]);
    let (results, _) = Interpreter::run(&func, vec![x, Value::Scalar(-1.0)]);
    assert_eq!(results[1].scalar(), 1.0);
}

#[test]
fn test_argmax_per_row() {
    let source = "
        input x: f32[2, 3];
        let idx = grid[r: 2] => argmax[c: 3] => x[r, c];
    ";
    let func = lower_source(source, "rows", FunctionKind::Host).unwrap();
    let x = Value::tensor(&[2, 3], vec![0.0, 9.0, 9.0, 7.0, -1.0, 8.0]);
    let (results, _) = Interpreter::run(&func, vec![x, Value::zeros(&[2])]);
    assert_eq!(results[1].data(), &[1.0, 2.0]);
}

#[test]
fn test_lowering_is_deterministic() {
    let source = "
        input A: f32[4, 8];
        input B: f32[8, 4];
        let C = grid[i: 4, j: 4] => sum[k: 8] => A[i, k] * B[k, j];
        let m = max[i: 4, j: 4] => C[i, j];
        output C, m;
    ";
    let first = lower_source(source, "k", FunctionKind::CudaKernel).unwrap();
    let second = lower_source(source, "k", FunctionKind::CudaKernel).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_string(), second.to_string());
}

#[test]
fn test_unmapped_input_is_unsupported() {
    let program = parse(
        "input x: f32[4];
         let s = sum[k: 4] => x[k];",
    )
    .unwrap();
    let s = program.lookup("s").unwrap();
    let err = expand_loop(&program.graph, &Expr::Node(s), &Default::default()).unwrap_err();
    assert!(matches!(err, LowerError::UnsupportedPattern { .. }));
}

#[test]
fn test_builder_api_matches_frontend() {
    let mut g = ComputeGraph::new();
    let x = g.tensor_input("x", ScalarType::F32, &[4]);
    let s = g
        .reduce("s", &[4], &["k"], ReduceOp::Sum, |_, ax| {
            Ok(Expr::element(Expr::Node(x), vec![ax[0].clone().into()]))
        })
        .unwrap();
    let task = tensor_lowering::Task {
        name: "sum".to_string(),
        inputs: vec![x],
        outputs: vec![s],
    };
    let func = tensor_lowering::lower_task(&mut g, &task, FunctionKind::Host).unwrap();
    let (results, _) = Interpreter::run(
        &func,
        vec![Value::tensor(&[4], vec![1.0, 1.0, 2.0, 3.0]), Value::Scalar(0.0)],
    );
    assert_eq!(results[1].scalar(), 7.0);
}

#[test]
fn test_arg_reduce_then_grid_output() {
    let source = "
        input x: f32[4];
        input y: f32[2, 3];
        let best = argmax[k: 4] => x[k];
        let C = grid[i: 2] => sum[k: 3] => y[i, k];
        output best, C;
    ";
    let func = lower_source(source, "pair", FunctionKind::Host).unwrap();

    let mut hints: HashMap<u32, &str> = HashMap::new();
    for var in func.vars() {
        let hint = *hints.entry(var.id).or_insert(&var.hint);
        assert_eq!(hint, var.hint, "id {} names two variables", var.id);
    }

    let x = Value::tensor(&[4], vec![0.5, 4.0, -1.0, 4.0]);
    let y = Value::tensor(&[2, 3], vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    let (results, _) = Interpreter::run(&func, vec![x, y, Value::Scalar(-1.0), Value::zeros(&[2])]);
    assert_eq!(results[2].scalar(), 1.0);
    assert_eq!(results[3].data(), &[6.0, 60.0]);
}

#[test]
fn test_shared_arg_reduce_renders_distinct_declarations() {
    let source = "
        input x: f32[4];
        let am = argmax[k: 4] => x[k];
        let twice = grid[i: 1] => am + am;
    ";
    let func = lower_source(source, "twice", FunctionKind::Host).unwrap();
    let x = Value::tensor(&[4], vec![1.0, 0.0, 7.0, 2.0]);
    let (results, _) = Interpreter::run(&func, vec![x, Value::zeros(&[1])]);
    assert_eq!(results[1].data(), &[4.0]);

    let text = func.to_string();
    let decls: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("float am_val"))
        .collect();
    assert_eq!(decls.len(), 2);
    assert_ne!(decls[0], decls[1]);
    assert!(decls.iter().all(|d| !d.starts_with("float am_val ")));
}

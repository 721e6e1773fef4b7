//! End-to-end engine tests against a real device.
//!
//! Every test degrades to a skip when no compute-capable adapter is
//! present, so the suite passes on CI boxes without a GPU.

use std::sync::Arc;

use molten::kernels::KERNELS_WGSL;
use molten::linalg::{self, LinalgKernels, Matrix, MatrixDescriptor, Vector, VectorDescriptor};
use molten::prelude::*;
use molten_backend::{CommandQueue, GpuContext};

fn setup() -> Option<Engine> {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = match GpuContext::discover_blocking() {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            eprintln!("skipping: no compute device available ({e})");
            return None;
        }
    };
    Some(Engine::new(ctx).expect("kernel compilation should succeed"))
}

fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {i}: got {a}, expected {e} (tol {tol})"
        );
    }
}

#[test]
fn add_known_values() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3., 4.], &[2, 2]).unwrap();
    let b = engine.tensor_from_slice(&[10., 20., 30., 40.], &[2, 2]).unwrap();

    let c = engine.add(&a, &b, &[]).unwrap();
    assert_eq!(engine.to_vec(&c).unwrap(), vec![11., 22., 33., 44.]);
}

#[test]
fn add_copy_out_leaves_inputs_untouched() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();
    let b = engine.tensor_from_slice(&[4., 5., 6.], &[3]).unwrap();

    let c = engine.add(&a, &b, &[]).unwrap();
    assert!(!c.same_buffer(&a));
    assert!(!c.same_buffer(&b));
    assert_eq!(engine.to_vec(&a).unwrap(), vec![1., 2., 3.]);
    assert_eq!(engine.to_vec(&b).unwrap(), vec![4., 5., 6.]);
}

#[test]
fn add_in_place_overwrites_left_input() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();
    let b = engine.tensor_from_slice(&[4., 5., 6.], &[3]).unwrap();

    let c = engine
        .add(&a, &b, &[FuncOpt::Alias(AliasMode::InPlace)])
        .unwrap();
    assert!(c.same_buffer(&a));
    assert_eq!(engine.to_vec(&a).unwrap(), vec![5., 7., 9.]);
}

#[test]
fn add_writes_into_reuse_tensor() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2.], &[2]).unwrap();
    let b = engine.tensor_from_slice(&[3., 4.], &[2]).unwrap();
    let reuse = engine.tensor_from_slice(&[0., 0.], &[2]).unwrap();

    let c = engine
        .add(&a, &b, &[FuncOpt::Reuse(reuse.clone())])
        .unwrap();
    assert!(c.same_buffer(&reuse));
    assert_eq!(engine.to_vec(&reuse).unwrap(), vec![4., 6.]);
}

#[test]
fn add_incr_accumulates_into_reuse() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2.], &[2]).unwrap();
    let b = engine.tensor_from_slice(&[3., 4.], &[2]).unwrap();
    let reuse = engine.tensor_from_slice(&[100., 200.], &[2]).unwrap();

    let c = engine
        .add(&a, &b, &[FuncOpt::Reuse(reuse.clone()), FuncOpt::Incr])
        .unwrap();
    assert!(c.same_buffer(&reuse));
    assert_eq!(engine.to_vec(&reuse).unwrap(), vec![104., 206.]);
}

#[test]
fn add_reuse_aliasing_an_input_still_works() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2.], &[2]).unwrap();
    let b = engine.tensor_from_slice(&[3., 4.], &[2]).unwrap();

    let c = engine.add(&a, &b, &[FuncOpt::Reuse(a.clone())]).unwrap();
    assert!(c.same_buffer(&a));
    assert_eq!(engine.to_vec(&a).unwrap(), vec![4., 6.]);
}

#[test]
fn add_in_place_with_identical_operands_doubles() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();

    let c = engine
        .add(&a, &a.clone(), &[FuncOpt::Alias(AliasMode::InPlace)])
        .unwrap();
    assert!(c.same_buffer(&a));
    assert_eq!(engine.to_vec(&a).unwrap(), vec![2., 4., 6.]);
}

#[test]
fn add_copy_out_with_identical_operands() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();

    let c = engine.add(&a, &a.clone(), &[]).unwrap();
    assert!(!c.same_buffer(&a));
    assert_eq!(engine.to_vec(&c).unwrap(), vec![2., 4., 6.]);
    assert_eq!(engine.to_vec(&a).unwrap(), vec![1., 2., 3.]);
}

#[test]
fn add_reuse_aliasing_identical_operands() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();

    let c = engine
        .add(&a, &a.clone(), &[FuncOpt::Reuse(a.clone())])
        .unwrap();
    assert!(c.same_buffer(&a));
    assert_eq!(engine.to_vec(&a).unwrap(), vec![2., 4., 6.]);
}

#[test]
fn add_rejects_mismatched_element_counts() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();
    let b = engine.tensor_from_slice(&[1., 2.], &[2]).unwrap();

    let err = engine.add(&a, &b, &[]).unwrap_err();
    assert!(matches!(err, EngineError::Shape(_)));
    assert!(err.is_validation());
}

#[test]
fn add_rejects_f16_operands() {
    let Some(engine) = setup() else { return };
    let a = engine.empty_with_dtype(&[4], Dtype::F16).unwrap();
    let b = engine.empty_with_dtype(&[4], Dtype::F16).unwrap();

    assert!(matches!(
        engine.add(&a, &b, &[]),
        Err(EngineError::Type(_))
    ));
}

#[test]
fn add_rejects_wrong_sized_reuse() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2.], &[2]).unwrap();
    let b = engine.tensor_from_slice(&[3., 4.], &[2]).unwrap();
    let reuse = engine.tensor_from_slice(&[0., 0., 0.], &[3]).unwrap();

    assert!(matches!(
        engine.add(&a, &b, &[FuncOpt::Reuse(reuse)]),
        Err(EngineError::Shape(_))
    ));
}

#[test]
fn add_scalar_known_values() {
    let Some(engine) = setup() else { return };
    let a = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();

    let c = engine.add_scalar(&a, 10., &[]).unwrap();
    assert_eq!(engine.to_vec(&c).unwrap(), vec![11., 12., 13.]);
    assert_eq!(engine.to_vec(&a).unwrap(), vec![1., 2., 3.]);

    let d = engine
        .add_scalar(&a, 0.5, &[FuncOpt::Alias(AliasMode::InPlace)])
        .unwrap();
    assert!(d.same_buffer(&a));
    assert_eq!(engine.to_vec(&a).unwrap(), vec![1.5, 2.5, 3.5]);
}

#[test]
fn matmul_known_values() {
    let Some(engine) = setup() else { return };
    let a = engine
        .tensor_from_slice(&[1., 2., 3., 4., 5., 6.], &[2, 3])
        .unwrap();
    let b = engine
        .tensor_from_slice(&[1., 2., 3., 4., 5., 6., 7., 8., 9.], &[3, 3])
        .unwrap();
    let c = engine.empty(&[2, 3]).unwrap();

    engine.matmul(&a, &b, &c).unwrap();
    assert_eq!(
        engine.to_vec(&c).unwrap(),
        vec![30., 36., 42., 66., 81., 96.]
    );
}

#[test]
fn matmul_matches_cpu_reference() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let Some(engine) = setup() else { return };
    // Odd sizes so the 16x16 tiling has ragged edges.
    let (m, k, n) = (17, 23, 9);
    let mut rng = StdRng::seed_from_u64(42);
    let a_host: Vec<f32> = (0..m * k).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let b_host: Vec<f32> = (0..k * n).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut expected = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut s = 0.0;
            for p in 0..k {
                s += a_host[i * k + p] * b_host[p * n + j];
            }
            expected[i * n + j] = s;
        }
    }

    let a = engine.tensor_from_slice(&a_host, &[m, k]).unwrap();
    let b = engine.tensor_from_slice(&b_host, &[k, n]).unwrap();
    let c = engine.empty(&[m, n]).unwrap();
    engine.matmul(&a, &b, &c).unwrap();

    assert_close(&engine.to_vec(&c).unwrap(), &expected, 1e-4);
}

#[test]
fn matmul_rejects_bad_shapes() {
    let Some(engine) = setup() else { return };
    let a = engine.empty(&[2, 3]).unwrap();
    let b = engine.empty(&[4, 5]).unwrap();
    let c = engine.empty(&[2, 5]).unwrap();
    assert!(matches!(
        engine.matmul(&a, &b, &c),
        Err(EngineError::Shape(_))
    ));

    let b = engine.empty(&[3, 5]).unwrap();
    let c_bad = engine.empty(&[3, 5]).unwrap();
    assert!(matches!(
        engine.matmul(&a, &b, &c_bad),
        Err(EngineError::Shape(_))
    ));
}

#[test]
fn matvecmul_known_values() {
    let Some(engine) = setup() else { return };
    let m = engine
        .tensor_from_slice(&[1., 2., 3., 4., 5., 6.], &[2, 3])
        .unwrap();
    let v = engine.tensor_from_slice(&[1., 1., 1.], &[3]).unwrap();
    let out = engine.empty(&[2]).unwrap();

    engine.matvecmul(&m, &v, &out).unwrap();
    assert_eq!(engine.to_vec(&out).unwrap(), vec![6., 15.]);
}

#[test]
fn matvecmul_accepts_column_shaped_vectors() {
    let Some(engine) = setup() else { return };
    let m = engine
        .tensor_from_slice(&[1., 0., 0., 1.], &[2, 2])
        .unwrap();
    let v = engine.tensor_from_slice(&[3., 7.], &[2, 1]).unwrap();
    let out = engine.empty(&[1, 2]).unwrap();

    engine.matvecmul(&m, &v, &out).unwrap();
    assert_eq!(engine.to_vec(&out).unwrap(), vec![3., 7.]);
}

fn linalg_setup(engine: &Engine) -> (LinalgKernels, CommandQueue) {
    let ctx = engine.context();
    let library = ctx.compile_library(KERNELS_WGSL).unwrap();
    let kernels = LinalgKernels::new(ctx, &library).unwrap();
    (kernels, CommandQueue::new(ctx))
}

#[test]
fn transposed_matmul_matches_cpu_reference() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let Some(engine) = setup() else { return };
    let (kernels, queue) = linalg_setup(&engine);

    // A stored [k, m], read transposed as an m x k operand.
    let (m, k, n) = (5, 7, 3);
    let mut rng = StdRng::seed_from_u64(7);
    let a_host: Vec<f32> = (0..k * m).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let b_host: Vec<f32> = (0..k * n).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut expected = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut s = 0.0;
            for p in 0..k {
                s += a_host[p * m + i] * b_host[p * n + j];
            }
            expected[i * n + j] = s;
        }
    }

    let a = engine.tensor_from_slice(&a_host, &[k, m]).unwrap();
    let b = engine.tensor_from_slice(&b_host, &[k, n]).unwrap();
    let c = engine.empty(&[m, n]).unwrap();

    let mut a_view = Matrix::new(a.buffer(), MatrixDescriptor::from_tensor(&a).unwrap());
    a_view.toggle_transpose();
    let b_view = Matrix::new(b.buffer(), MatrixDescriptor::from_tensor(&b).unwrap());
    let c_view = Matrix::new(c.buffer(), MatrixDescriptor::from_tensor(&c).unwrap());

    let mut cmd = queue.command_buffer("matmul left transposed");
    cmd.enqueue();
    linalg::matmul(&kernels, &mut cmd, &a_view, &b_view, &c_view);
    cmd.commit_and_wait().unwrap();

    assert_close(&engine.to_vec(&c).unwrap(), &expected, 1e-4);
}

#[test]
fn fully_transposed_matmul_matches_cpu_reference() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let Some(engine) = setup() else { return };
    let (kernels, queue) = linalg_setup(&engine);

    // A stored [k, m] and B stored [n, k], both read transposed.
    let (m, k, n) = (4, 6, 5);
    let mut rng = StdRng::seed_from_u64(11);
    let a_host: Vec<f32> = (0..k * m).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let b_host: Vec<f32> = (0..n * k).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut expected = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut s = 0.0;
            for p in 0..k {
                s += a_host[p * m + i] * b_host[j * k + p];
            }
            expected[i * n + j] = s;
        }
    }

    let a = engine.tensor_from_slice(&a_host, &[k, m]).unwrap();
    let b = engine.tensor_from_slice(&b_host, &[n, k]).unwrap();
    let c = engine.empty(&[m, n]).unwrap();

    let mut a_view = Matrix::new(a.buffer(), MatrixDescriptor::from_tensor(&a).unwrap());
    a_view.toggle_transpose();
    let mut b_view = Matrix::new(b.buffer(), MatrixDescriptor::from_tensor(&b).unwrap());
    b_view.toggle_transpose();
    let c_view = Matrix::new(c.buffer(), MatrixDescriptor::from_tensor(&c).unwrap());

    let mut cmd = queue.command_buffer("matmul both transposed");
    cmd.enqueue();
    linalg::matmul(&kernels, &mut cmd, &a_view, &b_view, &c_view);
    cmd.commit_and_wait().unwrap();

    assert_close(&engine.to_vec(&c).unwrap(), &expected, 1e-4);
}

#[test]
fn transposed_matvecmul_known_values() {
    let Some(engine) = setup() else { return };
    let (kernels, queue) = linalg_setup(&engine);

    // M stored [2, 3]; transposed multiply computes M^T * v.
    let m = engine
        .tensor_from_slice(&[1., 2., 3., 4., 5., 6.], &[2, 3])
        .unwrap();
    let v = engine.tensor_from_slice(&[1., 1.], &[2]).unwrap();
    let out = engine.empty(&[3]).unwrap();

    let mut m_view = Matrix::new(m.buffer(), MatrixDescriptor::from_tensor(&m).unwrap());
    m_view.toggle_transpose();
    let v_view = Vector::new(v.buffer(), VectorDescriptor::from_tensor(&v).unwrap());
    let out_view = Vector::new(out.buffer(), VectorDescriptor::from_tensor(&out).unwrap());

    let mut cmd = queue.command_buffer("matvecmul transposed");
    cmd.enqueue();
    linalg::matvecmul(&kernels, &mut cmd, &m_view, &v_view, &out_view);
    cmd.commit_and_wait().unwrap();

    assert_eq!(engine.to_vec(&out).unwrap(), vec![5., 7., 9.]);
}

#[test]
fn matvecmul_rejects_matrix_valued_operand() {
    let Some(engine) = setup() else { return };
    let m = engine.empty(&[2, 4]).unwrap();
    let v = engine.empty(&[2, 2]).unwrap();
    let out = engine.empty(&[2]).unwrap();

    assert!(matches!(
        engine.matvecmul(&m, &v, &out),
        Err(EngineError::Shape(_))
    ));
}

fn cpu_softmax_rows(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        let row = &x[r * cols..(r + 1) * cols];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        for c in 0..cols {
            out[r * cols + c] = exps[c] / sum;
        }
    }
    out
}

#[test]
fn softmax_rows_match_cpu_reference() {
    let Some(engine) = setup() else { return };
    let host = [1., 2., 3., 1., 1., 1., -5., 0., 5.];
    let x = engine.tensor_from_slice(&host, &[3, 3]).unwrap();

    let y = engine.softmax(&x, 1, &[]).unwrap();
    let got = engine.to_vec(&y).unwrap();
    assert_close(&got, &cpu_softmax_rows(&host, 3, 3), 1e-6);

    for r in 0..3 {
        let sum: f32 = got[r * 3..(r + 1) * 3].iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}

#[test]
fn softmax_axis_zero_normalizes_columns() {
    let Some(engine) = setup() else { return };
    let x = engine
        .tensor_from_slice(&[1., 10., 2., 20., 3., 30.], &[3, 2])
        .unwrap();

    let y = engine.softmax(&x, 0, &[]).unwrap();
    let got = engine.to_vec(&y).unwrap();
    for c in 0..2 {
        let sum: f32 = (0..3).map(|r| got[r * 2 + c]).sum();
        assert!((sum - 1.0).abs() < 1e-6, "column {c} sums to {sum}");
    }
}

#[test]
fn softmax_in_place_shares_the_input_buffer() {
    let Some(engine) = setup() else { return };
    let x = engine.tensor_from_slice(&[0., 0., 0., 0.], &[2, 2]).unwrap();

    let y = engine
        .softmax(&x, 1, &[FuncOpt::Alias(AliasMode::InPlace)])
        .unwrap();
    assert!(y.same_buffer(&x));
    assert_close(&engine.to_vec(&x).unwrap(), &[0.5, 0.5, 0.5, 0.5], 1e-6);
}

#[test]
fn softmax_of_a_vector_normalizes_it() {
    let Some(engine) = setup() else { return };
    let x = engine.tensor_from_slice(&[1., 2., 3., 4.], &[4]).unwrap();

    let y = engine.softmax(&x, 0, &[]).unwrap();
    let got = engine.to_vec(&y).unwrap();
    let sum: f32 = got.iter().sum();
    assert!((sum - 1.0).abs() < 1e-6);
    assert!(got.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn softmax_rejects_higher_rank_input() {
    let Some(engine) = setup() else { return };
    let x = engine.empty(&[2, 2, 2]).unwrap();
    assert!(matches!(
        engine.softmax(&x, 1, &[]),
        Err(EngineError::Shape(_))
    ));

    let x = engine.empty(&[2, 2]).unwrap();
    assert!(matches!(
        engine.softmax(&x, 2, &[]),
        Err(EngineError::Shape(_))
    ));
}

#[test]
fn unsupported_ops_are_queryable_and_fail_cleanly() {
    let Some(engine) = setup() else { return };
    assert!(engine.supports(Op::Add));
    assert!(engine.supports(Op::MatMul));
    assert!(engine.supports(Op::SoftMax));
    assert!(!engine.supports(Op::LogSoftMax));
    assert!(!engine.supports(Op::SoftMaxB));
    assert!(!engine.supports(Op::LogSoftMaxB));

    let x = engine.empty(&[2, 2]).unwrap();
    assert!(matches!(
        engine.log_softmax(&x, 1, &[]),
        Err(EngineError::Unsupported(Op::LogSoftMax))
    ));
    assert!(matches!(
        engine.softmax_b(&x, &x, 1),
        Err(EngineError::Unsupported(Op::SoftMaxB))
    ));
}

#[test]
fn memset_memclr_memcpy_roundtrip() {
    let Some(engine) = setup() else { return };
    let t = engine.empty(&[4]).unwrap();

    engine.memset(&t, 7.5).unwrap();
    assert_eq!(engine.to_vec(&t).unwrap(), vec![7.5; 4]);

    let copy = engine.empty(&[4]).unwrap();
    engine.memcpy(&copy, &t).unwrap();
    assert_eq!(engine.to_vec(&copy).unwrap(), vec![7.5; 4]);

    engine.memclr(&t).unwrap();
    assert_eq!(engine.to_vec(&t).unwrap(), vec![0.0; 4]);
    assert_eq!(engine.to_vec(&copy).unwrap(), vec![7.5; 4]);
}

#[test]
fn memcpy_rejects_size_mismatch() {
    let Some(engine) = setup() else { return };
    let a = engine.empty(&[4]).unwrap();
    let b = engine.empty(&[5]).unwrap();
    assert!(engine.memcpy(&a, &b).is_err());
}

#[test]
fn released_tensor_fails_instead_of_returning_stale_data() {
    let Some(engine) = setup() else { return };
    let t = engine.tensor_from_slice(&[1., 2., 3.], &[3]).unwrap();
    let survivor = t.clone();

    engine.release(t);
    assert!(engine.to_vec(&survivor).is_err());
}

#[test]
fn to_vec_rejects_f16() {
    let Some(engine) = setup() else { return };
    let t = engine.empty_with_dtype(&[4], Dtype::F16).unwrap();
    assert!(matches!(engine.to_vec(&t), Err(EngineError::Type(_))));
}

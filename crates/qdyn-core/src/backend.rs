//! Dense complex linear algebra used by the engine.
//!
//! The evaluator and the integrator never call `ndarray` products directly;
//! they go through an [`ArrayBackend`] handed to them by the caller. The CPU
//! implementation is the default, other backends (accelerators, threaded
//! BLAS) plug in behind the same trait.

use ndarray::Array2;
use num_complex::Complex64;

/// Dense-matrix capability consumed by the engine.
pub trait ArrayBackend: Send + Sync {
    /// Short backend identifier used in logs.
    fn name(&self) -> &'static str;

    /// Matrix product `a · b`.
    fn matmul(&self, a: &Array2<Complex64>, b: &Array2<Complex64>) -> Array2<Complex64>;

    /// Matrix exponential `exp(a)` of a square matrix.
    fn expm(&self, a: &Array2<Complex64>) -> Array2<Complex64>;

    /// Kronecker product `a ⊗ b`.
    fn kron(&self, a: &Array2<Complex64>, b: &Array2<Complex64>) -> Array2<Complex64>;
}

/// Single-threaded `ndarray` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl ArrayBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn matmul(&self, a: &Array2<Complex64>, b: &Array2<Complex64>) -> Array2<Complex64> {
        a.dot(b)
    }

    fn expm(&self, a: &Array2<Complex64>) -> Array2<Complex64> {
        matrix_exp(a)
    }

    fn kron(&self, a: &Array2<Complex64>, b: &Array2<Complex64>) -> Array2<Complex64> {
        let (ar, ac) = a.dim();
        let (br, bc) = b.dim();
        let mut out = Array2::zeros((ar * br, ac * bc));
        for ((i, j), &x) in a.indexed_iter() {
            if x == Complex64::new(0.0, 0.0) {
                continue;
            }
            out.slice_mut(ndarray::s![i * br..(i + 1) * br, j * bc..(j + 1) * bc])
                .assign(&b.mapv(|y| x * y));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Matrix exponential: scaling and squaring with a Padé(13) approximant
// (Higham 2005).
// ---------------------------------------------------------------------------

const PADE_13: [f64; 14] = [
    64_764_752_532_480_000.0,
    32_382_376_266_240_000.0,
    7_771_770_303_897_600.0,
    1_187_353_796_428_800.0,
    129_060_195_264_000.0,
    10_559_470_521_600.0,
    670_442_572_800.0,
    33_522_128_640.0,
    1_323_241_920.0,
    40_840_800.0,
    960_960.0,
    16_380.0,
    182.0,
    1.0,
];

const THETA_13: f64 = 5.371_920_351_148_152;

fn matrix_exp(a: &Array2<Complex64>) -> Array2<Complex64> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols(), "expm needs a square matrix");
    if n == 0 {
        return Array2::zeros((0, 0));
    }

    let norm = one_norm(a);
    let squarings = if norm > THETA_13 {
        (norm / THETA_13).log2().ceil().max(0.0) as u32
    } else {
        0
    };
    let scaled = a.mapv(|z| z / 2f64.powi(squarings as i32));

    let eye = Array2::<Complex64>::eye(n);
    let a2 = scaled.dot(&scaled);
    let a4 = a2.dot(&a2);
    let a6 = a4.dot(&a2);
    let b = |k: usize| Complex64::new(PADE_13[k], 0.0);

    let u_inner = &a6 * b(13) + &a4 * b(11) + &a2 * b(9);
    let u_tail = &a6 * b(7) + &a4 * b(5) + &a2 * b(3) + &eye * b(1);
    let u = scaled.dot(&(a6.dot(&u_inner) + u_tail));

    let v_inner = &a6 * b(12) + &a4 * b(10) + &a2 * b(8);
    let v_tail = &a6 * b(6) + &a4 * b(4) + &a2 * b(2) + &eye * b(0);
    let v = a6.dot(&v_inner) + v_tail;

    let mut result = solve_linear(&v - &u, &v + &u);
    for _ in 0..squarings {
        result = result.dot(&result);
    }
    result
}

fn one_norm(a: &Array2<Complex64>) -> f64 {
    a.columns()
        .into_iter()
        .map(|col| col.iter().map(|z| z.norm()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting.
fn solve_linear(mut a: Array2<Complex64>, mut b: Array2<Complex64>) -> Array2<Complex64> {
    let n = a.nrows();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[[i, col]].norm().total_cmp(&a[[j, col]].norm()))
            .unwrap_or(col);
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            for k in 0..b.ncols() {
                b.swap([col, k], [pivot, k]);
            }
        }
        let diag = a[[col, col]];
        if diag.norm() == 0.0 {
            continue;
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / diag;
            if factor.norm() == 0.0 {
                continue;
            }
            for k in col..n {
                let v = a[[col, k]];
                a[[row, k]] -= factor * v;
            }
            for k in 0..b.ncols() {
                let v = b[[col, k]];
                b[[row, k]] -= factor * v;
            }
        }
    }
    for col in (0..n).rev() {
        let diag = a[[col, col]];
        for k in 0..b.ncols() {
            let mut acc = b[[col, k]];
            for j in col + 1..n {
                acc -= a[[col, j]] * b[[j, k]];
            }
            b[[col, k]] = acc / diag;
        }
    }
    b
}

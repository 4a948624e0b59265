//! Cholesky factorization and solver for complex Hermitian matrices.
//!
//! Matrices are stored flattened in row-major order. Only the lower triangle
//! is ever read: the normal-equation accumulators in this crate populate the
//! lower triangle alone and rely on Hermitian symmetry for the rest.

use num_complex::Complex64;

/// Returned when a pivot is not strictly positive, i.e. the matrix is not
/// positive definite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotPositiveDefinite {
    /// Index of the failing pivot.
    pub pivot: usize,
}

impl std::fmt::Display for NotPositiveDefinite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "matrix is not positive definite at pivot {}", self.pivot)
    }
}

impl std::error::Error for NotPositiveDefinite {}

/// Factor a Hermitian positive-definite matrix in place as `A = L·Lᴴ`.
///
/// Reads only the lower triangle of `a` and overwrites it with `L`; the
/// diagonal of `L` is real and positive. The upper triangle is left
/// untouched.
pub fn decompose(a: &mut [Complex64], n: usize) -> Result<(), NotPositiveDefinite> {
    for i in 0..n {
        for j in 0..=i {
            let mut sum = Complex64::new(0.0, 0.0);
            for k in 0..j {
                sum += a[i * n + k] * a[j * n + k].conj();
            }
            if i == j {
                let pivot = a[i * n + i].re - sum.re;
                if pivot <= 0.0 {
                    return Err(NotPositiveDefinite { pivot: i });
                }
                a[i * n + i] = Complex64::new(pivot.sqrt(), 0.0);
            } else {
                a[i * n + j] = (a[i * n + j] - sum) / a[j * n + j].re;
            }
        }
    }
    Ok(())
}

/// Solve `L·Lᴴ·x = b` given the factor produced by [`decompose`].
pub fn solve(l: &[Complex64], b: &[Complex64], x: &mut [Complex64], n: usize) {
    // Forward substitution: L y = b.
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i * n + k] * x[k];
        }
        x[i] = sum / l[i * n + i].re;
    }
    // Backward substitution: L^H x = y.
    for i in (0..n).rev() {
        let mut sum = x[i];
        for k in (i + 1)..n {
            sum -= l[k * n + i].conj() * x[k];
        }
        x[i] = sum / l[i * n + i].re;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mat_vec(a: &[Complex64], v: &[Complex64], n: usize) -> Vec<Complex64> {
        let mut out = vec![Complex64::new(0.0, 0.0); n];
        for i in 0..n {
            for j in 0..n {
                // Reconstruct the upper triangle from Hermitian symmetry.
                let entry = if j <= i {
                    a[i * n + j]
                } else {
                    a[j * n + i].conj()
                };
                out[i] += entry * v[j];
            }
        }
        out
    }

    fn random_complex(seed: &mut u64) -> Complex64 {
        *seed ^= *seed << 13;
        *seed ^= *seed >> 7;
        *seed ^= *seed << 17;
        let re = (*seed as f64 / u64::MAX as f64) * 2.0 - 1.0;
        *seed ^= *seed << 13;
        *seed ^= *seed >> 7;
        *seed ^= *seed << 17;
        let im = (*seed as f64 / u64::MAX as f64) * 2.0 - 1.0;
        Complex64::new(re, im)
    }

    #[test]
    fn test_identity_factors_to_identity() {
        let n = 3;
        let mut a = vec![Complex64::new(0.0, 0.0); n * n];
        for i in 0..n {
            a[i * n + i] = Complex64::new(1.0, 0.0);
        }
        decompose(&mut a, n).unwrap();
        for i in 0..n {
            for j in 0..=i {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((a[i * n + j].re - expected).abs() < 1e-12);
                assert!(a[i * n + j].im.abs() < 1e-12);
            }
        }

        let b = vec![
            Complex64::new(1.0, 2.0),
            Complex64::new(-3.0, 0.5),
            Complex64::new(0.0, -1.0),
        ];
        let mut x = vec![Complex64::new(0.0, 0.0); n];
        solve(&a, &b, &mut x, n);
        for (xi, bi) in x.iter().zip(b.iter()) {
            assert!((xi - bi).norm() < 1e-12);
        }
    }

    #[test]
    fn test_solve_two_by_two_hermitian() {
        let n = 2;
        // Hermitian PD: [[4, 1-i], [1+i, 3]]; only the lower triangle matters.
        let a = vec![
            Complex64::new(4.0, 0.0),
            Complex64::new(0.0, 0.0),
            Complex64::new(1.0, 1.0),
            Complex64::new(3.0, 0.0),
        ];
        let b = vec![Complex64::new(1.0, 0.0), Complex64::new(0.0, 1.0)];

        let mut l = a.clone();
        decompose(&mut l, n).unwrap();
        let mut x = vec![Complex64::new(0.0, 0.0); n];
        solve(&l, &b, &mut x, n);

        let back = mat_vec(&a, &x, n);
        for (bi, ri) in b.iter().zip(back.iter()) {
            assert!((bi - ri).norm() < 1e-12, "residual {:?} vs {:?}", ri, bi);
        }
    }

    #[test]
    fn test_rejects_indefinite_matrix() {
        let n = 2;
        // Second pivot is 1 - |2|^2 = -3.
        let mut a = vec![
            Complex64::new(1.0, 0.0),
            Complex64::new(0.0, 0.0),
            Complex64::new(2.0, 0.0),
            Complex64::new(1.0, 0.0),
        ];
        assert_eq!(decompose(&mut a, n), Err(NotPositiveDefinite { pivot: 1 }));
    }

    #[test]
    fn test_solve_random_positive_definite_system() {
        let n = 4;
        let mut seed = 0x1357_9bdf_2468_aceu64;
        let m: Vec<Complex64> = (0..n * n).map(|_| random_complex(&mut seed)).collect();

        // A = M M^H + I is Hermitian positive definite.
        let mut a = vec![Complex64::new(0.0, 0.0); n * n];
        for i in 0..n {
            for j in 0..=i {
                let mut sum = Complex64::new(0.0, 0.0);
                for k in 0..n {
                    sum += m[i * n + k] * m[j * n + k].conj();
                }
                if i == j {
                    sum += Complex64::new(1.0, 0.0);
                }
                a[i * n + j] = sum;
            }
        }
        let b: Vec<Complex64> = (0..n).map(|_| random_complex(&mut seed)).collect();

        let mut l = a.clone();
        decompose(&mut l, n).unwrap();
        let mut x = vec![Complex64::new(0.0, 0.0); n];
        solve(&l, &b, &mut x, n);

        let back = mat_vec(&a, &x, n);
        for (bi, ri) in b.iter().zip(back.iter()) {
            assert!((bi - ri).norm() < 1e-9, "residual {:?} vs {:?}", ri, bi);
        }
    }
}

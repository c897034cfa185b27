//! Elementwise and normalization kernels over row-major `[rows, hidden]`
//! buffers.

use rayon::prelude::*;

/// Tanh approximation of GELU.
#[must_use]
pub fn gelu_approx(x: f32) -> f32 {
    let coeff = 0.797_884_6; // sqrt(2/π)
    let inner = coeff * x.mul_add(0.044_715 * x * x, x);
    0.5 * x * (1.0 + inner.tanh())
}

pub fn gelu_inplace(data: &mut [f32]) {
    data.par_iter_mut().for_each(|x| *x = gelu_approx(*x));
}

/// `out[r] = (x[r] - mean) / sqrt(var + eps) * gamma + beta` per row.
pub fn layer_norm(input: &[f32], gamma: &[f32], beta: &[f32], eps: f32, out: &mut [f32]) {
    let hidden = gamma.len();
    out.par_chunks_mut(hidden)
        .zip(input.par_chunks(hidden))
        .for_each(|(row_out, row)| {
            let mean = row.iter().sum::<f32>() / hidden as f32;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / hidden as f32;
            let inv = 1.0 / (var + eps).sqrt();
            for (((o, &x), &g), &b) in row_out.iter_mut().zip(row).zip(gamma).zip(beta) {
                *o = (x - mean) * inv * g + b;
            }
        });
}

/// Add `bias` to every row.
pub fn add_bias(data: &mut [f32], bias: &[f32]) {
    if bias.is_empty() {
        return;
    }
    data.par_chunks_mut(bias.len()).for_each(|row| {
        for (x, b) in row.iter_mut().zip(bias) {
            *x += b;
        }
    });
}

/// `acc += x` elementwise.
pub fn add_inplace(acc: &mut [f32], x: &[f32]) {
    acc.par_iter_mut().zip(x).for_each(|(a, b)| *a += b);
}

/// Sequential dot product.
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0, |acc, (x, y)| x.mul_add(*y, acc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gelu_values() {
        assert!(gelu_approx(0.0).abs() < 1e-7);
        assert!((gelu_approx(1.0) - 0.841_192).abs() < 1e-4);
        assert!((gelu_approx(-1.0) + 0.158_808).abs() < 1e-4);
    }

    #[test]
    fn test_layer_norm_unit() {
        let input = [1.0, 2.0, 3.0, 4.0, -1.0, -1.0, -1.0, -1.0];
        let mut out = [0.0; 8];
        layer_norm(&input, &[1.0; 4], &[0.0; 4], 1e-5, &mut out);
        let mean: f32 = out[..4].iter().sum::<f32>() / 4.0;
        let var: f32 = out[..4].iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
        // Constant row normalizes to beta.
        assert!(out[4..].iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn test_layer_norm_affine() {
        let mut out = [0.0; 2];
        layer_norm(&[0.0, 2.0], &[2.0, 2.0], &[1.0, 1.0], 0.0, &mut out);
        assert!((out[0] + 1.0).abs() < 1e-6);
        assert!((out[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_bias_and_residual() {
        let mut x = vec![1.0, 2.0, 3.0, 4.0];
        add_bias(&mut x, &[10.0, 20.0]);
        assert_eq!(x, vec![11.0, 22.0, 13.0, 24.0]);
        add_inplace(&mut x, &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(x, vec![12.0, 23.0, 14.0, 25.0]);
    }

    #[test]
    fn test_dot() {
        assert_eq!(dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }
}

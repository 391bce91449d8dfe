use itertools::izip;
use multiversion::multiversion;

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    let mut result = 0f64;
    for (&val1, &val2) in a.iter().zip(b) {
        result += val1 * val2;
    }
    result
}

/// `y += a * x`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());

    for (&x, y) in x.iter().zip(y.iter_mut()) {
        *y = x.mul_add(a, *y);
    }
}

/// `out = x + a * y`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(x.len() == out.len());

    for (&x, &y, out) in izip!(x, y, out) {
        *out = y.mul_add(a, x);
    }
}

/// `out = x * y` elementwise
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(x.len() == out.len());

    for (&x, &y, out) in izip!(x, y, out) {
        *out = x * y;
    }
}

pub(crate) fn norm(x: &[f64]) -> f64 {
    vector_dot(x, x).sqrt()
}

#[cfg(test)]
mod tests {
    use approx::assert_ulps_eq;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn check_kernels() {
        let x = [1., 2., 3., 4., 5.];
        let mut y = [1., -1., 0.5, 0., 2.];

        assert_ulps_eq!(vector_dot(&x, &y), 1. - 2. + 1.5 + 10.);

        let mut out = [0.; 5];
        axpy_out(&x, &y, 2., &mut out);
        assert_eq!(out, [3., 0., 4., 4., 9.]);

        multiply(&x, &y, &mut out);
        assert_eq!(out, [1., -2., 1.5, 0., 10.]);

        axpy(&x, &mut y, -1.);
        assert_eq!(y, [0., -3., -2.5, -4., -3.]);

        assert_ulps_eq!(norm(&[3., 4.]), 5.);
    }
}

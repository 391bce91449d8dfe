//! Exact Pólya-Gamma draws via Devroye's alternating-series method
//! (Polson, Scott & Windle 2013).

use std::f64::consts::{FRAC_2_PI, PI};

use rand::Rng;
use rand_distr::{Exp1, StandardNormal};
use statrs::function::erf::erfc;

/// Truncation point between the two envelope pieces.
const TRUNC: f64 = 0.64;
const PI_SQ: f64 = PI * PI;

/// Draw from `PG(b, tilt)` for a positive integer `b` by summing `b` draws of `PG(1, tilt)`.
pub fn sample_polya_gamma<R: Rng + ?Sized>(rng: &mut R, b: u32, tilt: f64) -> f64 {
    (0..b).map(|_| sample_pg_one(rng, tilt)).sum()
}

/// Draw from `PG(1, tilt)`.
pub fn sample_pg_one<R: Rng + ?Sized>(rng: &mut R, tilt: f64) -> f64 {
    // PG(1, c) = J*(1, c/2) / 4
    let z = 0.5 * tilt.abs();
    let k = PI_SQ / 8. + 0.5 * z * z;

    let p = PI / (2. * k) * (-k * TRUNC).exp();
    let q = 2. * mass_below_trunc(z);
    let left_prob = q / (p + q);

    loop {
        let x = if rng.random::<f64>() < left_prob {
            truncated_inverse_gaussian(rng, z)
        } else {
            TRUNC + rng.sample::<f64, _>(Exp1) / k
        };

        let mut s = series_coefficient(0, x);
        let y = rng.random::<f64>() * s;
        let mut n = 0;
        loop {
            n += 1;
            if n % 2 == 1 {
                s -= series_coefficient(n, x);
                if y <= s {
                    return 0.25 * x;
                }
            } else {
                s += series_coefficient(n, x);
                if y > s {
                    break;
                }
            }
        }
    }
}

/// Piecewise coefficients of the alternating series for the `J*(1)` density.
fn series_coefficient(n: u32, x: f64) -> f64 {
    let m = n as f64 + 0.5;
    if x > TRUNC {
        PI * m * (-0.5 * m * m * PI_SQ * x).exp()
    } else {
        PI * m * (FRAC_2_PI / x).powf(1.5) * (-2. * m * m / x).exp()
    }
}

fn std_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// `exp(-z) · P(IG(1/z, 1) < TRUNC)`, assembled in log space for large `z`.
fn mass_below_trunc(z: f64) -> f64 {
    if z == 0. {
        // Limit of the inverse-Gaussian with infinite mean: a Lévy law.
        return erfc(1. / (2. * TRUNC).sqrt());
    }
    let root = (1. / TRUNC).sqrt();
    let first = (-z).exp() * std_normal_cdf(root * (TRUNC * z - 1.));
    let tail = std_normal_cdf(-root * (TRUNC * z + 1.));
    let second = if tail > 0. { (z + tail.ln()).exp() } else { 0. };
    first + second
}

/// Inverse-Gaussian with mean `1/z` and shape 1, truncated to `(0, TRUNC)`.
fn truncated_inverse_gaussian<R: Rng + ?Sized>(rng: &mut R, z: f64) -> f64 {
    let mu = if z > 0. { 1. / z } else { f64::INFINITY };
    if mu > TRUNC {
        loop {
            let x = loop {
                let e1: f64 = rng.sample(Exp1);
                let e2: f64 = rng.sample(Exp1);
                if e1 * e1 <= 2. * e2 / TRUNC {
                    break TRUNC / (1. + TRUNC * e1).powi(2);
                }
            };
            let alpha = (-0.5 * z * z * x).exp();
            if rng.random::<f64>() <= alpha {
                return x;
            }
        }
    }
    loop {
        let y: f64 = rng.sample(StandardNormal);
        let y = y * y;
        let x = mu + 0.5 * mu * mu * y - 0.5 * mu * (4. * mu * y + (mu * y).powi(2)).sqrt();
        let x = if rng.random::<f64>() > mu / (mu + x) {
            mu * mu / x
        } else {
            x
        };
        if x < TRUNC {
            return x;
        }
    }
}

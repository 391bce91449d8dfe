//! Positive stable laws and the two tilted families the Bridge local scales need.
//!
//! `f_a` denotes the positive `a`-stable density with Laplace transform
//! `E[exp(-s X)] = exp(-s^a)`, `0 < a < 1`. The exponentially tilted law
//! `TS(a, t)` has density `∝ exp(-t x) f_a(x)`.

use std::f64::consts::PI;

use rand::{distr::Open01, Rng};
use rand_distr::{Exp1, StandardNormal};

use crate::error::{check_finite, NumericalError};

/// Kanter's representation of a positive `a`-stable draw.
pub fn sample_positive_stable<R: Rng + ?Sized>(
    rng: &mut R,
    char_exponent: f64,
) -> Result<f64, NumericalError> {
    debug_assert!(char_exponent > 0. && char_exponent < 1.);
    let a = char_exponent;
    let u: f64 = PI * rng.sample::<f64, _>(Open01);
    let e: f64 = rng.sample(Exp1);
    let ratio = zolotarev(a, u) / e;
    check_finite("positive stable draw", ratio.powf((1. - a) / a))
}

/// `A(u) = [sin(a u)^a sin((1-a) u)^(1-a) / sin(u)]^(1/(1-a))`
fn zolotarev(a: f64, u: f64) -> f64 {
    let log_value =
        a * (a * u).sin().ln() + (1. - a) * ((1. - a) * u).sin().ln() - u.sin().ln();
    (log_value / (1. - a)).exp()
}

/// Exact draw from `TS(a, t)`.
///
/// The tilt is split into `m = ⌈t^a⌉` pieces so that each piece is accepted by
/// naive rejection with probability at least `e^-1` (Hofert 2011).
pub fn sample_tilted_stable<R: Rng + ?Sized>(
    rng: &mut R,
    char_exponent: f64,
    tilt: f64,
) -> Result<f64, NumericalError> {
    debug_assert!(tilt >= 0.);
    let a = char_exponent;
    if tilt == 0. {
        return sample_positive_stable(rng, a);
    }
    let pieces = tilt.powf(a).ceil().max(1.);
    let scale = pieces.powf(-1. / a);
    let piece_tilt = tilt * scale;

    let mut total = 0f64;
    for _ in 0..(pieces as u64) {
        total += loop {
            let draw = sample_positive_stable(rng, a)?;
            if rng.random::<f64>() <= (-piece_tilt * draw).exp() {
                break draw;
            }
        };
    }
    check_finite("tilted stable draw", scale * total)
}

/// Inverse-Gaussian draw with the given mean and shape (Michael, Schucany & Haas 1976).
pub fn sample_inverse_gaussian<R: Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    shape: f64,
) -> Result<f64, NumericalError> {
    let nu: f64 = rng.sample(StandardNormal);
    let y = nu * nu;
    // The smaller root `mean + mean^2 y/(2 shape) - mean/(2 shape) sqrt(4 mean shape y + mean^2 y^2)`,
    // rewritten free of cancellation and scaled by `mean` against overflow.
    let x = if y > 0. {
        let c = 4. * shape * y / mean;
        let root = (y * y + c).sqrt();
        mean * (c / (root + y).powi(2))
    } else {
        mean
    };
    let draw = if rng.random::<f64>() <= mean / (mean + x) {
        x
    } else {
        mean * mean / x
    };
    check_finite("inverse Gaussian draw", draw)
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn empirical_laplace(draws: &[f64], s: f64) -> f64 {
        draws.iter().map(|&x| (-s * x).exp()).sum::<f64>() / draws.len() as f64
    }

    #[test]
    fn stable_laplace_transform() {
        let mut rng = StdRng::seed_from_u64(42);
        for &a in &[0.25, 0.5, 0.75] {
            let draws: Vec<f64> = (0..40_000)
                .map(|_| sample_positive_stable(&mut rng, a).unwrap())
                .collect();
            for &s in &[0.5, 1., 3.] {
                let expected = (-f64::powf(s, a)).exp();
                let observed = empirical_laplace(&draws, s);
                assert!(
                    (observed - expected).abs() < 0.01,
                    "a = {a}, s = {s}: {observed} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn tilted_stable_laplace_transform() {
        let mut rng = StdRng::seed_from_u64(3);
        for &(a, t) in &[(0.3, 0.5), (0.5, 4.), (0.8, 9.)] {
            let draws: Vec<f64> = (0..40_000)
                .map(|_| sample_tilted_stable(&mut rng, a, t).unwrap())
                .collect();
            for &s in &[0.5, 2.] {
                let expected = (f64::powf(t, a) - f64::powf(t + s, a)).exp();
                let observed = empirical_laplace(&draws, s);
                assert!(
                    (observed - expected).abs() < 0.01,
                    "a = {a}, t = {t}, s = {s}: {observed} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn inverse_gaussian_moments() {
        let mut rng = StdRng::seed_from_u64(11);
        let (mean, shape) = (2.5, 0.5);
        let n = 100_000;
        let draws: Vec<f64> = (0..n)
            .map(|_| sample_inverse_gaussian(&mut rng, mean, shape).unwrap())
            .collect();
        let m = draws.iter().sum::<f64>() / n as f64;
        let inv = draws.iter().map(|x| 1. / x).sum::<f64>() / n as f64;
        // E[1/X] = 1/mean + 1/shape
        assert!((inv - (1. / mean + 1. / shape)).abs() < 0.05);
        // var = mean^3 / shape = 31.25, so the standard error is about 0.018
        assert!((m - mean).abs() < 0.1);
    }

    #[test]
    fn inverse_gaussian_huge_mean_stays_finite() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..1000 {
            let x = sample_inverse_gaussian(&mut rng, 1e12, 0.5).unwrap();
            assert!(x > 0. && x.is_finite());
        }
    }

    #[test]
    fn inverse_gaussian_huge_mean_keeps_levy_limit() {
        // As the mean grows the law tends to a Lévy law with 1/X ~ Gamma(1/2, shape/2).
        let mut rng = StdRng::seed_from_u64(8);
        let (shape, n) = (0.5, 100_000);
        let inverse = (0..n)
            .map(|_| 1. / sample_inverse_gaussian(&mut rng, 1e14, shape).unwrap())
            .collect::<Vec<_>>();
        let mean = inverse.iter().sum::<f64>() / n as f64;
        assert!((mean - 1. / shape).abs() < 0.05, "E[1/X] = {mean}");
        // 1/X = 2 Z² for a standard normal Z, so P(1/X < 2) = P(|Z| < 1)
        let below = inverse.iter().filter(|&&v| v < 2.).count() as f64 / n as f64;
        assert!((below - 0.6827).abs() < 0.01, "P(1/X < 2) = {below}");
    }
}

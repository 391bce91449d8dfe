use std::{io::Cursor, sync::Arc};

use anyhow::Result;
use bridge_mcmc::{
    sample_parallel, BirthProposal, BridgeChain, BridgeSettings, DesignMatrix, GaussianLikelihood,
    GlobalScalePrior, LogisticLikelihood, NoiseVariance, PosteriorSamples, SolveMethod,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

const SIGNAL: [(usize, f64); 4] = [(0, 2.), (3, -1.5), (7, 1.), (12, -2.)];

fn gaussian_rows(n: usize, p: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| (0..p).map(|_| rng.sample(StandardNormal)).collect())
        .collect()
}

fn linear_response(rows: &[Vec<f64>], signal: &[(usize, f64)], rng: &mut StdRng) -> Vec<f64> {
    rows.iter()
        .map(|row| {
            signal.iter().map(|&(j, beta)| beta * row[j]).sum::<f64>()
                + rng.sample::<f64, _>(StandardNormal)
        })
        .collect()
}

fn recovery_settings() -> BridgeSettings {
    BridgeSettings {
        prior_exponent: 1.,
        inclusion_probability: 0.2,
        max_active_predictors: Some(20),
        burn_in_iterations: 1000,
        num_iterations: 4000,
        random_seed: 42,
        log_interval: None,
        ..Default::default()
    }
}

fn check_recovery(samples: &PosteriorSamples, p: usize) {
    let pip = samples.inclusion_probabilities();
    let means = samples.posterior_means();
    let signal = SIGNAL.iter().map(|&(j, _)| j).collect::<Vec<_>>();

    for &(j, beta) in &SIGNAL {
        assert!(pip[j] > 0.9, "predictor {j} has inclusion probability {}", pip[j]);
        assert!(
            (means[j] - beta).abs() < 0.3,
            "predictor {j} has posterior mean {} instead of {beta}",
            means[j]
        );
    }
    let null_pip = (0..p)
        .filter(|j| !signal.contains(j))
        .map(|j| pip[j])
        .sum::<f64>()
        / (p - signal.len()) as f64;
    assert!(null_pip < 0.1, "mean null inclusion probability {null_pip}");

    let size = samples.mean_active_size();
    assert!((3.5..7.).contains(&size), "mean active size {size}");
}

#[test]
fn recovers_sparse_linear_signal() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let rows = gaussian_rows(100, 20, &mut rng);
    let y = linear_response(&rows, &SIGNAL, &mut rng);
    let design = Arc::new(DesignMatrix::from_rows(&rows)?);
    let likelihood = GaussianLikelihood::new(y, NoiseVariance::default())?;

    let settings = recovery_settings();
    let mut chain = BridgeChain::new(design, likelihood, &settings, 0)?;
    let (result, samples) = chain.run();
    result?;

    assert_eq!(samples.len(), 4000);
    check_recovery(&samples, 20);

    let noise: f64 = samples
        .snapshots()
        .iter()
        .map(|s| s.dispersion.unwrap_or(f64::NAN))
        .sum::<f64>()
        / samples.len() as f64;
    assert!((0.6..1.6).contains(&noise), "noise variance {noise}");
    Ok(())
}

#[test]
fn conjugate_gradient_path_on_sparse_design() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let (n, p) = (150, 40);
    let mut triplets = vec![];
    let mut rows = vec![vec![0f64; p]; n];
    for (i, row) in rows.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            if rng.random::<f64>() < 0.3 || SIGNAL.iter().any(|&(s, _)| s == j) {
                *value = rng.sample(StandardNormal);
                triplets.push((i, j, *value));
            }
        }
    }
    let y = linear_response(&rows, &SIGNAL, &mut rng);
    let design = Arc::new(DesignMatrix::sparse_from_triplets(n, p, &triplets)?);
    let likelihood = GaussianLikelihood::new(y, NoiseVariance::default())?;

    let settings = BridgeSettings {
        cg_threshold: 0,
        swap_probability: 0.2,
        birth_proposal: BirthProposal::Gaussian {
            scale: 1.,
            adapt: true,
        },
        ..recovery_settings()
    };
    let mut chain = BridgeChain::new(design, likelihood, &settings, 0)?;
    let (result, samples) = chain.run();
    result?;

    let cg_sweeps = samples
        .sweeps()
        .iter()
        .filter(|s| matches!(s.solve_method, SolveMethod::ConjugateGradient { .. }))
        .count();
    assert!(cg_sweeps > samples.sweeps().len() / 2);
    check_recovery(&samples, p);
    Ok(())
}

#[test]
fn logistic_regression_finds_signal() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    let rows = gaussian_rows(300, 10, &mut rng);
    let outcomes = rows
        .iter()
        .map(|row| {
            let eta = 2. * row[1] - 2. * row[5];
            rng.random::<f64>() < 1. / (1. + (-eta).exp())
        })
        .collect::<Vec<_>>();
    let design = Arc::new(DesignMatrix::from_rows(&rows)?);
    let likelihood = LogisticLikelihood::bernoulli(&outcomes);

    let settings = BridgeSettings {
        prior_exponent: 0.5,
        inclusion_probability: 0.2,
        burn_in_iterations: 500,
        num_iterations: 1500,
        log_interval: None,
        ..Default::default()
    };
    let mut chain = BridgeChain::new(design, likelihood, &settings, 0)?;
    let (result, samples) = chain.run();
    result?;

    let pip = samples.inclusion_probabilities();
    let means = samples.posterior_means();
    assert!(pip[1] > 0.9 && pip[5] > 0.9, "{pip:?}");
    assert!(means[1] > 1. && means[5] < -1., "{means:?}");
    assert!(samples.snapshots().iter().all(|s| s.dispersion.is_none()));
    Ok(())
}

#[test]
fn multiple_chains_with_constraints_persist_losslessly() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let rows = gaussian_rows(80, 15, &mut rng);
    let y = linear_response(&rows, &SIGNAL, &mut rng);
    let design = Arc::new(DesignMatrix::from_rows(&rows)?);
    let likelihood = GaussianLikelihood::new(y, NoiseVariance::Known(1.))?;

    let settings = BridgeSettings {
        regularization_strength_prior: GlobalScalePrior::Fixed(1.),
        required_predictors: vec![14],
        excluded_predictors: vec![5],
        num_chains: 3,
        burn_in_iterations: 200,
        num_iterations: 400,
        thinning_interval: 4,
        log_interval: None,
        ..Default::default()
    };
    let (result, trace) = sample_parallel(design, &likelihood, &settings);
    result?;
    assert_eq!(trace.chains.len(), 3);

    let pip = trace.inclusion_probabilities();
    assert_eq!(pip[14], 1.);
    assert_eq!(pip[5], 0.);
    assert!(pip[0] > 0.9);

    for chain in &trace.chains {
        assert_eq!(chain.len(), 100);
        assert!(chain
            .snapshots()
            .iter()
            .all(|s| s.state.global_scale == 1. && s.dispersion == Some(1.)));

        let buffer = chain.write_ipc(Cursor::new(Vec::new()))?;
        let restored = PosteriorSamples::read_ipc(Cursor::new(buffer.into_inner()))?;
        assert_eq!(restored.chain(), chain.chain());
        assert_eq!(restored.snapshots(), chain.snapshots());

        let table = chain.coefficient_table()?;
        assert_eq!(table.num_rows(), 100);
        assert_eq!(table.num_columns(), 16);
        let stats = chain.stats_table()?;
        assert_eq!(stats.num_rows(), 600);
    }
    Ok(())
}

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    chain::{Chain, NutsChain},
    hamiltonian::LogpFunc,
    mass_matrix::MassMatrix,
    mass_matrix_adapt::MassMatrixAdaptOptions,
    nuts::NutsError,
    sampler_stats::SampleStats,
    stepsize::DualAverageOptions,
};

/// The kind of mass matrix that is used and adapted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricKind {
    #[default]
    Diagonal,
    Dense,
}

/// Settings for the NUTS sampler
#[derive(Debug, Clone)]
pub struct NutsSettings {
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    pub num_chains: usize,
    pub seed: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// The maximum tree depth during the first `num_early_draws` draws of tuning.
    pub early_maxdepth: u64,
    pub num_early_draws: u64,
    /// The mean acceptance rate that step size adaptation aims for.
    pub target_accept: f64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    /// Scale of the default initial step size `step_scale / dim^(1/4)`.
    pub step_scale: f64,
    pub initial_step: Option<f64>,
    pub metric: MetricKind,
    /// The initial posterior variance (length `dim`) or row-major
    /// covariance (length `dim * dim`, dense metric only).
    pub initial_scaling: Option<Vec<f64>>,
    pub step_size_adapt: DualAverageOptions,
    pub mass_matrix_adapt: MassMatrixAdaptOptions,
}

impl Default for NutsSettings {
    fn default() -> Self {
        Self {
            num_tune: 1000,
            num_draws: 1000,
            num_chains: 4,
            seed: 0,
            maxdepth: 10,
            early_maxdepth: 8,
            num_early_draws: 200,
            target_accept: 0.8,
            max_energy_error: 1000f64,
            step_scale: 0.25,
            initial_step: None,
            metric: MetricKind::Diagonal,
            initial_scaling: None,
            step_size_adapt: DualAverageOptions::default(),
            mass_matrix_adapt: MassMatrixAdaptOptions::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> NutsError {
    NutsError::InvalidSettings(msg.into())
}

impl NutsSettings {
    /// Check the settings for a posterior of dimension `dim`.
    pub fn validate(&self, dim: usize) -> Result<(), NutsError> {
        if dim == 0 {
            return Err(invalid("The posterior needs at least one dimension"));
        }
        if (self.maxdepth == 0) | (self.early_maxdepth == 0) {
            return Err(invalid("maxdepth and early_maxdepth must be positive"));
        }
        if !((self.target_accept > 0.) & (self.target_accept < 1.)) {
            return Err(invalid(format!(
                "target_accept must be in (0, 1), but is {}",
                self.target_accept
            )));
        }
        if !(self.max_energy_error > 0.) {
            return Err(invalid("max_energy_error must be positive"));
        }
        if let Some(step) = self.initial_step {
            if !(step.is_finite() & (step > 0.)) {
                return Err(invalid(format!(
                    "The initial step size must be positive and finite, but is {step}"
                )));
            }
        } else if !(self.step_scale.is_finite() & (self.step_scale > 0.)) {
            return Err(invalid("step_scale must be positive and finite"));
        }

        let DualAverageOptions { k, t0, gamma } = self.step_size_adapt;
        if !((k > 0.) & (k <= 1.) & (t0 >= 0.) & (gamma > 0.)) {
            return Err(invalid("Invalid dual averaging parameters"));
        }

        let adapt = &self.mass_matrix_adapt;
        if !(adapt.regularization_weight >= 0.) | !adapt.regularization_weight.is_finite() {
            return Err(invalid("regularization_weight must be non-negative"));
        }
        if !(adapt.regularization_scale.is_finite() & (adapt.regularization_scale > 0.)) {
            return Err(invalid("regularization_scale must be positive"));
        }

        if let Some(scaling) = self.initial_scaling.as_ref() {
            let valid_len = match self.metric {
                MetricKind::Diagonal => scaling.len() == dim,
                MetricKind::Dense => (scaling.len() == dim) | (scaling.len() == dim * dim),
            };
            if !valid_len {
                return Err(NutsError::DimensionMismatch {
                    expected: dim,
                    found: scaling.len(),
                });
            }
        }
        Ok(())
    }

    /// The step size of the first draw.
    pub fn initial_step_size(&self, dim: usize) -> f64 {
        self.initial_step
            .unwrap_or_else(|| self.step_scale / (dim as f64).powf(0.25))
    }

    pub(crate) fn initial_mass_matrix(&self, dim: usize) -> Result<MassMatrix, NutsError> {
        match (self.metric, self.initial_scaling.as_ref()) {
            (MetricKind::Diagonal, None) => Ok(MassMatrix::identity_diag(dim)),
            (MetricKind::Dense, None) => Ok(MassMatrix::identity_dense(dim)),
            (MetricKind::Diagonal, Some(variance)) => MassMatrix::from_variance(variance),
            (MetricKind::Dense, Some(scaling)) if scaling.len() == dim => {
                if !scaling.iter().all(|&x| x.is_finite() & (x > 0.)) {
                    return Err(invalid(
                        "Variance of the mass matrix must be positive and finite",
                    ));
                }
                let covariance: Vec<f64> = (0..dim * dim)
                    .map(|k| {
                        if k / dim == k % dim {
                            scaling[k / dim]
                        } else {
                            0f64
                        }
                    })
                    .collect();
                MassMatrix::from_covariance(dim, &covariance)
            }
            (MetricKind::Dense, Some(covariance)) => MassMatrix::from_covariance(dim, covariance),
        }
    }
}

/// Generates starting points for new chains.
pub trait InitPointFunc {
    fn new_init_point<R: Rng + ?Sized>(&mut self, rng: &mut R, out: &mut [f64]);
}

/// Initialize chains with uniform jitter.
#[derive(Debug, Clone, Default)]
pub struct JitterInitFunc {
    mu: Option<Box<[f64]>>,
}

impl JitterInitFunc {
    /// Initialize new chains with jitter in [-1, 1] around zero
    pub fn new() -> JitterInitFunc {
        JitterInitFunc { mu: None }
    }

    /// Initialize new chains with jitter in [mu - 1, mu + 1].
    pub fn new_with_mean(mu: Box<[f64]>) -> Self {
        Self { mu: Some(mu) }
    }
}

impl InitPointFunc for JitterInitFunc {
    fn new_init_point<R: Rng + ?Sized>(&mut self, rng: &mut R, out: &mut [f64]) {
        out.iter_mut().for_each(|val| {
            let uniform: f64 = rng.random();
            *val = 2. * uniform - 1.;
        });
        if let Some(mu) = self.mu.as_ref() {
            out.iter_mut().zip(mu.iter()).for_each(|(val, &mu)| *val += mu);
        }
    }
}

/// The draws and sampler stats of one chain.
#[derive(Debug)]
pub struct ChainOutput {
    pub chain: u64,
    pub draws: Vec<Box<[f64]>>,
    pub stats: Vec<SampleStats>,
    /// Number of divergences after tuning
    pub divergences: u64,
    /// The chain was stopped before all draws were finished
    pub cancelled: bool,
}

/// Iterate over the draws of a single chain, tuning included.
pub fn sample_sequentially<F: LogpFunc, R: Rng>(
    logp: F,
    settings: &NutsSettings,
    start: &[f64],
    draws: u64,
    chain: u64,
    rng: R,
) -> Result<impl Iterator<Item = Result<(Box<[f64]>, SampleStats), NutsError>>, NutsError> {
    let dim = logp.dim();
    let mut sampler = NutsChain::new(logp, dim, settings, chain, rng)?;
    sampler.set_position(start)?;
    Ok((0..draws).map(move |_| sampler.draw()))
}

const MAX_INIT_TRIES: usize = 500;

fn find_init_point<F, R, I>(
    sampler: &mut NutsChain<F, R>,
    init: &mut I,
    rng: &mut ChaCha8Rng,
) -> Result<()>
where
    F: LogpFunc,
    R: Rng,
    I: InitPointFunc,
{
    let mut position = vec![0f64; sampler.dim()];
    let mut error = None;
    for _ in 0..MAX_INIT_TRIES {
        init.new_init_point(rng, &mut position);
        match sampler.set_position(&position) {
            Ok(()) => return Ok(()),
            Err(err) => error = Some(err),
        }
    }
    match error {
        Some(err) => Err(err).context("All initialization points failed"),
        None => bail!("No initialization point was tried"),
    }
}

fn run_chain<F, I>(
    logp: F,
    mut init: I,
    settings: &NutsSettings,
    chain: u64,
    cancel: Option<&AtomicBool>,
) -> Result<ChainOutput>
where
    F: LogpFunc,
    I: InitPointFunc,
{
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain);
    let chain_rng = ChaCha8Rng::from_rng(&mut rng);

    let dim = logp.dim();
    let mut sampler = NutsChain::new(logp, dim, settings, chain, chain_rng)
        .context("Could not create chain")?;
    find_init_point(&mut sampler, &mut init, &mut rng)?;

    let total = settings.num_tune + settings.num_draws;
    let mut output = ChainOutput {
        chain,
        draws: Vec::with_capacity(total as usize),
        stats: Vec::with_capacity(total as usize),
        divergences: 0,
        cancelled: false,
    };

    let mut sample = || -> Result<(), NutsError> {
        for _ in 0..total {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(NutsError::Cancelled);
            }
            let (draw, stats) = sampler.draw()?;
            output.draws.push(draw);
            output.stats.push(stats);
        }
        Ok(())
    };

    match sample() {
        Ok(()) => {}
        Err(NutsError::Cancelled) => {
            debug!("Chain {chain} was cancelled after {} draws", output.draws.len());
            output.cancelled = true;
        }
        Err(err) => return Err(err).with_context(|| format!("Sampling failed in chain {chain}")),
    }

    output.divergences = sampler.divergences();
    if output.divergences > 0 {
        warn!(
            "Chain {chain} had {} divergences after tuning",
            output.divergences
        );
    }
    Ok(output)
}

/// Sample `settings.num_chains` independent chains in parallel.
///
/// Every chain uses its own random stream derived from `settings.seed`, so
/// the results do not depend on thread scheduling. If `cancel` is set,
/// chains stop between draws and keep the draws they finished.
pub fn sample_parallel<F, I>(
    logp: F,
    init: I,
    settings: &NutsSettings,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<Vec<ChainOutput>>
where
    F: LogpFunc + Clone + Send + Sync,
    I: InitPointFunc + Clone + Send + Sync,
{
    settings
        .validate(logp.dim())
        .context("Invalid sampler settings")?;

    (0..settings.num_chains)
        .into_par_iter()
        .map(|chain| {
            run_chain(
                logp.clone(),
                init.clone(),
                settings,
                chain as u64,
                cancel.as_deref(),
            )
        })
        .collect()
}

#[cfg(test)]
pub mod test_logps {
    use crate::hamiltonian::{LogpError, LogpFunc};
    use thiserror::Error;

    /// Independent normal distributions with mean `mu` and unit variance.
    #[derive(Clone, Debug)]
    pub struct NormalLogp {
        pub dim: usize,
        pub mu: f64,
    }

    #[derive(Error, Debug)]
    pub enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    impl LogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let n = position.len();
            assert!(gradient.len() == n);

            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = *p - self.mu;
                logp -= val * val / 2.;
                *g = -val;
            }
            Ok(logp)
        }
    }

    #[derive(Error, Debug)]
    #[error("Position is outside of the support")]
    pub struct OutOfSupport {
        recoverable: bool,
    }

    impl LogpError for OutOfSupport {
        fn is_recoverable(&self) -> bool {
            self.recoverable
        }
    }

    /// A standard normal restricted to `|x_i| <= bound`.
    ///
    /// Outside of the bound it either returns a logp of `-inf` with an
    /// infinite gradient, or fails with an error.
    #[derive(Clone, Debug)]
    pub struct FailingLogp {
        dim: usize,
        bound: f64,
        error: Option<bool>,
    }

    impl FailingLogp {
        pub fn bounded(dim: usize, bound: f64) -> Self {
            Self {
                dim,
                bound,
                error: None,
            }
        }

        pub fn erroring(dim: usize, bound: f64, recoverable: bool) -> Self {
            Self {
                dim,
                bound,
                error: Some(recoverable),
            }
        }
    }

    impl LogpFunc for FailingLogp {
        type LogpError = OutOfSupport;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, OutOfSupport> {
            if position.iter().all(|x| x.abs() <= self.bound) {
                let mut logp = 0f64;
                for (&x, g) in position.iter().zip(gradient.iter_mut()) {
                    logp -= x * x / 2.;
                    *g = -x;
                }
                return Ok(logp);
            }
            if let Some(recoverable) = self.error {
                return Err(OutOfSupport { recoverable });
            }
            for (&x, g) in position.iter().zip(gradient.iter_mut()) {
                *g = if x > 0. {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                };
            }
            Ok(f64::NEG_INFINITY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_logps::{FailingLogp, NormalLogp};
    use super::*;
    use itertools::Itertools;
    use pretty_assertions::assert_eq;
    use rand::rngs::SmallRng;

    #[test]
    fn default_settings_are_valid() {
        let settings = NutsSettings::default();
        settings.validate(10).unwrap();
        approx::assert_relative_eq!(settings.initial_step_size(16), 0.125);
        assert!(matches!(
            settings.validate(0),
            Err(NutsError::InvalidSettings(_))
        ));
    }

    #[test]
    fn initial_scaling() {
        let settings = NutsSettings {
            initial_scaling: Some(vec![2., 3.]),
            ..Default::default()
        };
        settings.validate(2).unwrap();
        let mass_matrix = settings.initial_mass_matrix(2).unwrap();
        assert_eq!(&*mass_matrix.variance(), &[2., 3.]);

        let settings = NutsSettings {
            metric: MetricKind::Dense,
            initial_scaling: Some(vec![2., 3.]),
            ..Default::default()
        };
        let mass_matrix = settings.initial_mass_matrix(2).unwrap();
        assert!(matches!(mass_matrix, MassMatrix::Dense(_)));
        let variance = mass_matrix.variance();
        approx::assert_relative_eq!(variance[0], 2., epsilon = 1e-10);
        approx::assert_relative_eq!(variance[1], 3., epsilon = 1e-10);

        let settings = NutsSettings {
            metric: MetricKind::Dense,
            initial_scaling: Some(vec![2., 0.5, 0.5, 1.]),
            ..Default::default()
        };
        settings.validate(2).unwrap();
        settings.initial_mass_matrix(2).unwrap();

        let settings = NutsSettings {
            initial_scaling: Some(vec![2., -3.]),
            ..Default::default()
        };
        assert!(settings.initial_mass_matrix(2).is_err());
    }

    #[test]
    fn jitter_init() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut out = [0f64; 100];
        JitterInitFunc::new().new_init_point(&mut rng, &mut out);
        assert!(out.iter().all(|&x| (-1. ..=1.).contains(&x)));

        let mut init = JitterInitFunc::new_with_mean(vec![10.; 100].into());
        init.new_init_point(&mut rng, &mut out);
        assert!(out.iter().all(|&x| (9. ..=11.).contains(&x)));
    }

    #[test]
    fn sample_seq() {
        let logp = NormalLogp { dim: 10, mu: 0.1 };
        let settings = NutsSettings {
            num_tune: 100,
            num_draws: 100,
            ..Default::default()
        };
        let start = vec![0.2; 10];
        let rng = SmallRng::seed_from_u64(42);

        let chain = sample_sequentially(logp, &settings, &start, 200, 1, rng).unwrap();
        let mut draws = chain.collect_vec();
        assert_eq!(draws.len(), 200);

        let (vals, stats) = draws.remove(100).unwrap();
        assert_eq!(vals.len(), 10);
        assert_eq!(stats.chain, 1);
        assert_eq!(stats.draw, 100);
        assert!(!stats.tuning);
    }

    #[test]
    fn sample_parallel_chains() -> Result<()> {
        let logp = NormalLogp { dim: 20, mu: 0.1 };
        let settings = NutsSettings {
            num_tune: 100,
            num_draws: 50,
            num_chains: 3,
            seed: 10,
            ..Default::default()
        };
        let chains = sample_parallel(logp.clone(), JitterInitFunc::new(), &settings, None)?;
        assert_eq!(chains.len(), 3);
        for (i, chain) in chains.iter().enumerate() {
            assert_eq!(chain.chain, i as u64);
            assert_eq!(chain.draws.len(), 150);
            assert!(!chain.cancelled);
        }
        assert_ne!(chains[0].draws[149], chains[1].draws[149]);

        let again = sample_parallel(logp, JitterInitFunc::new(), &settings, None)?;
        for (a, b) in chains.iter().zip(again.iter()) {
            assert_eq!(a.draws, b.draws);
        }
        Ok(())
    }

    #[test]
    fn cancelled_before_start() -> Result<()> {
        let settings = NutsSettings {
            num_tune: 10,
            num_draws: 10,
            num_chains: 2,
            ..Default::default()
        };
        let cancel = Arc::new(AtomicBool::new(true));
        let chains = sample_parallel(
            NormalLogp { dim: 2, mu: 0. },
            JitterInitFunc::new(),
            &settings,
            Some(cancel),
        )?;
        assert_eq!(chains.len(), 2);
        assert!(chains.iter().all(|c| c.cancelled & c.draws.is_empty()));
        Ok(())
    }

    #[test]
    fn failing_init_points() {
        let settings = NutsSettings {
            num_tune: 10,
            num_draws: 10,
            num_chains: 1,
            ..Default::default()
        };
        let init = JitterInitFunc::new_with_mean(vec![100.].into());
        let result = sample_parallel(FailingLogp::bounded(1, 1.), init, &settings, None);
        assert!(result.is_err());
    }
}

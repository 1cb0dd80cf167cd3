use log::debug;
use rand::Rng;

use crate::{
    adapt_strategy::GlobalStrategy,
    chain::Chain,
    hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LogpFunc},
    nuts::{Collector, NutsError, Result},
    sampler::NutsSettings,
    sampler_stats::SampleStats,
    state::State,
};

/// Trajectory settings of static HMC.
#[derive(Debug, Clone, Copy)]
pub struct HmcOptions {
    /// Integration time of a trajectory. It is split into
    /// `path_length / step_size` leapfrog steps.
    pub path_length: f64,
    /// Upper limit for the number of leapfrog steps in a trajectory.
    pub max_steps: u64,
    /// Each trajectory draws its step size uniformly from
    /// `step_size * (1 ± step_jitter)`.
    pub step_jitter: f64,
}

impl Default for HmcOptions {
    fn default() -> Self {
        HmcOptions {
            path_length: 2.,
            max_steps: 1024,
            step_jitter: 0.15,
        }
    }
}

impl HmcOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.path_length.is_finite() & (self.path_length > 0.)) {
            return Err(NutsError::InvalidSettings(format!(
                "path_length must be positive, got {}",
                self.path_length
            )));
        }
        if self.max_steps == 0 {
            return Err(NutsError::InvalidSettings(
                "max_steps must be positive".into(),
            ));
        }
        if !(0. ..1.).contains(&self.step_jitter) {
            return Err(NutsError::InvalidSettings(format!(
                "step_jitter must be in [0, 1), got {}",
                self.step_jitter
            )));
        }
        Ok(())
    }

    fn num_steps(&self, step_size: f64) -> u64 {
        let steps = (self.path_length / step_size) as u64;
        if steps > self.max_steps {
            debug!(
                "Trajectory needs {steps} leapfrog steps, limited to {}",
                self.max_steps
            );
        }
        steps.clamp(1, self.max_steps)
    }
}

/// Summary of one static HMC trajectory.
#[derive(Debug)]
pub struct HmcInfo {
    /// Leapfrog steps done, fewer than planned if the trajectory diverged.
    pub n_steps: u64,
    /// Metropolis acceptance probability of the proposal, zero on divergence.
    pub accept_stat: f64,
    pub accepted: bool,
    /// The energy error with the largest magnitude along the trajectory.
    pub max_energy_error: f64,
    pub divergence_info: Option<DivergenceInfo>,
}

struct NoCollector;

impl Collector for NoCollector {}

fn larger_error(current: f64, energy_error: f64) -> f64 {
    if energy_error.abs() > current.abs() {
        energy_error
    } else {
        current
    }
}

/// Integrate a trajectory of `n_steps` leapfrog steps from `init` and
/// accept or reject its end point.
///
/// `init` must not be shared, its momentum is resampled. A divergent
/// trajectory stops at the divergence and is rejected.
pub fn draw_static<F, R>(
    init: &mut State,
    rng: &mut R,
    hamiltonian: &mut EuclideanHamiltonian<F>,
    n_steps: u64,
) -> Result<(State, HmcInfo)>
where
    F: LogpFunc,
    R: Rng + ?Sized,
{
    hamiltonian.initialize_trajectory(init, rng);
    let initial_energy = init.energy();

    let mut max_energy_error = 0f64;

    let mut current = init.clone();
    for step in 0..n_steps {
        current = match hamiltonian.leapfrog(
            &current,
            Direction::Forward,
            initial_energy,
            &mut NoCollector,
        )? {
            Ok(next) => next,
            Err(info) => {
                if let Some(energy_error) = info.energy_error {
                    max_energy_error = larger_error(max_energy_error, energy_error);
                }
                let info = HmcInfo {
                    n_steps: step + 1,
                    accept_stat: 0.,
                    accepted: false,
                    max_energy_error,
                    divergence_info: Some(info),
                };
                return Ok((init.clone(), info));
            }
        };
        max_energy_error = larger_error(max_energy_error, current.energy() - initial_energy);
    }

    // Finite, otherwise the last step would have diverged
    let energy_error = current.energy() - initial_energy;
    let accept_stat = (-energy_error).min(0.).exp();
    let accepted = rng.random_bool(accept_stat);
    let info = HmcInfo {
        n_steps,
        accept_stat,
        accepted,
        max_energy_error,
        divergence_info: None,
    };
    if accepted {
        Ok((current, info))
    } else {
        Ok((init.clone(), info))
    }
}

/// A chain of static HMC with a fixed integration time per trajectory.
///
/// Step size and mass matrix are tuned in the same way as for
/// [`NutsChain`](crate::NutsChain). The tree depth settings are not used.
/// Static HMC is usually tuned to a lower `target_accept` than NUTS,
/// around 0.65.
pub struct HmcChain<F, R>
where
    F: LogpFunc,
    R: Rng,
{
    hamiltonian: EuclideanHamiltonian<F>,
    options: HmcOptions,
    rng: R,
    state: Option<State>,
    strategy: GlobalStrategy,
    chain: u64,
    draw_count: u64,
    num_tune: u64,
    divergences: u64,
}

impl<F, R> HmcChain<F, R>
where
    F: LogpFunc,
    R: Rng,
{
    pub fn new(
        logp: F,
        dim: usize,
        settings: &NutsSettings,
        options: HmcOptions,
        chain: u64,
        rng: R,
    ) -> Result<Self> {
        settings.validate(dim)?;
        options.validate()?;
        if logp.dim() != dim {
            return Err(NutsError::DimensionMismatch {
                expected: logp.dim(),
                found: dim,
            });
        }

        let mass_matrix = settings.initial_mass_matrix(dim)?;
        let initial_step = settings.initial_step_size(dim);
        let strategy = GlobalStrategy::new(settings, initial_step, &mass_matrix);
        let mut hamiltonian = EuclideanHamiltonian::new(
            logp,
            mass_matrix,
            settings.max_energy_error,
            initial_step,
        );
        strategy.init_step_size(&mut hamiltonian);

        Ok(HmcChain {
            hamiltonian,
            options,
            rng,
            state: None,
            strategy,
            chain,
            draw_count: 0,
            num_tune: settings.num_tune,
            divergences: 0,
        })
    }

    /// The number of divergences after tuning.
    pub fn divergences(&self) -> u64 {
        self.divergences
    }

    pub fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }

    pub fn hamiltonian_mut(&mut self) -> &mut EuclideanHamiltonian<F> {
        &mut self.hamiltonian
    }

    fn draw_from_state(&mut self, tuning: bool) -> Result<(Box<[f64]>, SampleStats)> {
        let tuning =
            self.strategy
                .start_draw(tuning, self.draw_count, self.chain, &mut self.hamiltonian);

        let Some(init) = self.state.as_mut() else {
            return Err(NutsError::InvalidSettings(
                "The chain position was not initialized".into(),
            ));
        };

        let step_size = self.hamiltonian.step_size();
        let jitter = self.options.step_jitter;
        let trajectory_step_size = if jitter > 0. {
            step_size * self.rng.random_range(1. - jitter..1. + jitter)
        } else {
            step_size
        };
        let n_steps = self.options.num_steps(trajectory_step_size);

        *self.hamiltonian.step_size_mut() = trajectory_step_size;
        let result = draw_static(init, &mut self.rng, &mut self.hamiltonian, n_steps);
        *self.hamiltonian.step_size_mut() = step_size;
        let (state, info) = result?;
        let energy_error = state.energy() - init.energy();

        let mut position: Box<[f64]> = vec![0f64; self.hamiltonian.dim()].into();
        state.write_position(&mut position);

        if tuning {
            self.strategy.adapt(
                &mut self.hamiltonian,
                self.draw_count,
                info.accept_stat,
                &position,
            );
        }

        let divergent = info.divergence_info.is_some();
        if divergent {
            debug!(
                "Divergence in chain {} at draw {} (tuning: {})",
                self.chain, self.draw_count, tuning
            );
            if !tuning {
                self.divergences += 1;
            }
        }

        let stats = SampleStats {
            step_size,
            step_size_bar: self.strategy.step_size_bar(),
            n_steps: info.n_steps,
            depth: 0,
            reached_maxdepth: false,
            divergent,
            energy: state.energy(),
            energy_error,
            max_energy_error: info.max_energy_error,
            mean_tree_accept: info.accept_stat,
            logp: state.logp(),
            index_in_trajectory: state.index_in_trajectory(),
            tuning,
            chain: self.chain,
            draw: self.draw_count,
            divergence_info: info.divergence_info,
        };

        self.draw_count += 1;
        self.state = Some(state);
        Ok((position, stats))
    }
}

impl<F, R> Chain for HmcChain<F, R>
where
    F: LogpFunc,
    R: Rng,
{
    fn set_position(&mut self, position: &[f64]) -> Result<()> {
        self.state = Some(self.hamiltonian.init_state(position)?);
        Ok(())
    }

    fn step(&mut self, tuning: bool, position: &[f64]) -> Result<(Box<[f64]>, SampleStats)> {
        let is_current = self
            .state
            .as_ref()
            .is_some_and(|state| state.position() == position);
        if !is_current {
            self.set_position(position)?;
        }
        self.draw_from_state(tuning)
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, SampleStats)> {
        let tuning = self.draw_count < self.num_tune;
        self.draw_from_state(tuning)
    }

    fn dim(&self) -> usize {
        self.hamiltonian.dim()
    }

    fn is_tuning(&self) -> bool {
        self.strategy.is_tuning()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix::MassMatrix,
        sampler::test_logps::{FailingLogp, NormalLogp},
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn num_steps() {
        let options = HmcOptions::default();
        assert_eq!(options.num_steps(0.5), 4);
        assert_eq!(options.num_steps(0.3), 6);
        assert_eq!(options.num_steps(10.), 1);
        assert_eq!(options.num_steps(1e-6), 1024);
    }

    #[test]
    fn invalid_options() {
        let valid = HmcOptions::default();
        assert!(valid.validate().is_ok());
        for options in [
            HmcOptions {
                path_length: 0.,
                ..valid
            },
            HmcOptions {
                path_length: f64::NAN,
                ..valid
            },
            HmcOptions {
                max_steps: 0,
                ..valid
            },
            HmcOptions {
                step_jitter: 1.,
                ..valid
            },
        ] {
            assert!(matches!(
                options.validate(),
                Err(NutsError::InvalidSettings(_))
            ));
        }
    }

    #[test]
    fn small_steps_are_accepted() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            NormalLogp { dim: 3, mu: 1. },
            MassMatrix::identity_diag(3),
            1000.,
            0.01,
        );
        let mut rng = SmallRng::seed_from_u64(3);
        let mut init = hamiltonian.init_state(&[0., 0.5, 2.]).unwrap();

        let (state, info) = draw_static(&mut init, &mut rng, &mut hamiltonian, 100).unwrap();
        assert_eq!(info.n_steps, 100);
        assert!(info.divergence_info.is_none());
        assert!(info.accept_stat > 0.99);
        assert!(info.max_energy_error.abs() < 1e-3);
        if info.accepted {
            assert_eq!(state.index_in_trajectory(), 100);
        } else {
            assert_eq!(state.position(), init.position());
        }
    }

    #[test]
    fn divergent_trajectory_is_rejected() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            FailingLogp::bounded(1, 1.),
            MassMatrix::identity_diag(1),
            1000.,
            100.,
        );
        let mut rng = SmallRng::seed_from_u64(7);
        let mut init = hamiltonian.init_state(&[0.9]).unwrap();

        let (state, info) = draw_static(&mut init, &mut rng, &mut hamiltonian, 10).unwrap();
        assert!(info.divergence_info.is_some());
        assert_eq!(info.n_steps, 1);
        assert_eq!(info.accept_stat, 0.);
        assert!(!info.accepted);
        assert_eq!(state.position(), &[0.9]);
    }

    #[test]
    fn unrecoverable_error() {
        let mut hamiltonian = EuclideanHamiltonian::new(
            FailingLogp::erroring(1, 1., false),
            MassMatrix::identity_diag(1),
            1000.,
            100.,
        );
        let mut rng = SmallRng::seed_from_u64(7);
        let mut init = hamiltonian.init_state(&[0.9]).unwrap();

        let result = draw_static(&mut init, &mut rng, &mut hamiltonian, 10);
        assert!(matches!(result, Err(NutsError::LogpFailure(_))));
    }

    fn chain(settings: &NutsSettings) -> HmcChain<NormalLogp, SmallRng> {
        HmcChain::new(
            NormalLogp { dim: 4, mu: 2. },
            4,
            settings,
            HmcOptions::default(),
            1,
            SmallRng::seed_from_u64(42),
        )
        .unwrap()
    }

    #[test]
    fn tune_and_freeze() {
        let settings = NutsSettings {
            num_tune: 200,
            target_accept: 0.65,
            ..Default::default()
        };
        let mut chain = chain(&settings);
        chain.set_position(&[0.; 4]).unwrap();

        let mut accept = 0.;
        for i in 0..200 {
            let (position, stats) = chain.draw().unwrap();
            assert!(stats.tuning);
            assert_eq!(stats.draw, i);
            assert_eq!(stats.chain, 1);
            assert!(position.iter().all(|x| x.is_finite()));
            if i >= 100 {
                accept += stats.mean_tree_accept;
            }
        }
        assert!(accept / 100. > 0.3);

        let mut frozen = None;
        let mut sum = 0.;
        for _ in 0..500 {
            let (position, stats) = chain.draw().unwrap();
            assert!(!stats.tuning);
            let step_size = *frozen.get_or_insert(stats.step_size);
            assert_eq!(stats.step_size, step_size);
            assert_eq!(stats.step_size, stats.step_size_bar);
            assert_eq!(stats.depth, 0);
            sum += position.iter().sum::<f64>() / 4.;
        }
        assert!(!chain.is_tuning());
        assert_eq!(chain.divergences(), 0);
        assert_relative_eq!(sum / 500., 2., epsilon = 0.3);
        assert_eq!(Some(chain.step_size()), frozen);

        // Tuning can not be requested again
        let (position, _) = chain.draw().unwrap();
        let (_, stats) = chain.step(true, &position).unwrap();
        assert!(!stats.tuning);
        assert_eq!(Some(stats.step_size), frozen);
    }

    #[test]
    fn divergences_are_counted() {
        let settings = NutsSettings {
            num_tune: 0,
            initial_step: Some(50.),
            ..Default::default()
        };
        let options = HmcOptions {
            step_jitter: 0.,
            ..Default::default()
        };
        let mut chain = HmcChain::new(
            FailingLogp::bounded(1, 1.),
            1,
            &settings,
            options,
            0,
            SmallRng::seed_from_u64(1),
        )
        .unwrap();
        chain.set_position(&[0.5]).unwrap();
        for _ in 0..10 {
            let (position, stats) = chain.draw().unwrap();
            assert!(stats.divergent);
            assert_eq!(stats.n_steps, 1);
            assert_eq!(&*position, &[0.5]);
        }
        assert_eq!(chain.divergences(), 10);
    }

    #[test]
    fn invalid_chain() {
        let result = HmcChain::new(
            NormalLogp { dim: 4, mu: 2. },
            3,
            &NutsSettings::default(),
            HmcOptions::default(),
            0,
            SmallRng::seed_from_u64(0),
        );
        assert!(matches!(
            result,
            Err(NutsError::DimensionMismatch { expected: 4, found: 3 })
        ));

        let result = HmcChain::new(
            NormalLogp { dim: 4, mu: 2. },
            4,
            &NutsSettings::default(),
            HmcOptions {
                path_length: -1.,
                ..Default::default()
            },
            0,
            SmallRng::seed_from_u64(0),
        );
        assert!(matches!(result, Err(NutsError::InvalidSettings(_))));
    }
}

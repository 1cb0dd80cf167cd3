use log::debug;

use crate::{
    adapt_strategy::GlobalStrategy,
    hamiltonian::{EuclideanHamiltonian, LogpFunc},
    nuts::{draw, NutsError, NutsOptions},
    sampler::NutsSettings,
    sampler_stats::SampleStats,
    state::State,
    stepsize::AcceptanceRateCollector,
};

/// Draw samples from the posterior distribution using Hamiltonian MCMC.
pub trait Chain {
    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error or a non-finite
    /// value at `position`.
    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError>;

    /// Draw a new sample starting at `position`.
    ///
    /// Adaptation only happens while `tuning` is true. Once a step was done
    /// without tuning, the chain never tunes again.
    fn step(
        &mut self,
        tuning: bool,
        position: &[f64],
    ) -> Result<(Box<[f64]>, SampleStats), NutsError>;

    /// Draw a new sample from the current position. The first `num_tune`
    /// draws are tuning draws.
    fn draw(&mut self) -> Result<(Box<[f64]>, SampleStats), NutsError>;

    /// The dimensionality of the posterior.
    fn dim(&self) -> usize;

    fn is_tuning(&self) -> bool;
}

pub struct NutsChain<F, R>
where
    F: LogpFunc,
    R: rand::Rng,
{
    hamiltonian: EuclideanHamiltonian<F>,
    collector: AcceptanceRateCollector,
    options: NutsOptions,
    rng: R,
    state: Option<State>,
    strategy: GlobalStrategy,
    chain: u64,
    draw_count: u64,
    num_tune: u64,
    divergences: u64,
}

impl<F, R> NutsChain<F, R>
where
    F: LogpFunc,
    R: rand::Rng,
{
    pub fn new(
        logp: F,
        dim: usize,
        settings: &NutsSettings,
        chain: u64,
        rng: R,
    ) -> Result<Self, NutsError> {
        settings.validate(dim)?;
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
        let mut options = NutsOptions {
            maxdepth: settings.maxdepth,
        };
        strategy.init(&mut options, &mut hamiltonian);

        Ok(NutsChain {
            hamiltonian,
            collector: AcceptanceRateCollector::new(),
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

    /// The number of draws so far.
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn step_size(&self) -> f64 {
        self.hamiltonian.step_size()
    }

    pub fn hamiltonian(&self) -> &EuclideanHamiltonian<F> {
        &self.hamiltonian
    }

    fn draw_from_state(&mut self, tuning: bool) -> Result<(Box<[f64]>, SampleStats), NutsError> {
        let tuning =
            self.strategy
                .start_draw(tuning, self.draw_count, self.chain, &mut self.hamiltonian);
        self.strategy.set_maxdepth(&mut self.options, self.draw_count);

        let Some(init) = self.state.as_mut() else {
            return Err(NutsError::InvalidSettings(
                "The chain position was not initialized".into(),
            ));
        };
        let step_size = self.hamiltonian.step_size();
        let (state, info) = draw(
            init,
            &mut self.rng,
            &mut self.hamiltonian,
            &self.options,
            &mut self.collector,
        )?;
        let energy_error = state.energy() - init.energy();

        let mut position: Box<[f64]> = vec![0f64; self.hamiltonian.dim()].into();
        state.write_position(&mut position);

        if tuning {
            self.strategy.adapt(
                &mut self.hamiltonian,
                self.draw_count,
                self.collector.mean_acceptance(),
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
            n_steps: self.collector.n_steps(),
            depth: info.depth,
            reached_maxdepth: info.reached_maxdepth,
            divergent,
            energy: state.energy(),
            energy_error,
            max_energy_error: self.collector.max_energy_error(),
            mean_tree_accept: self.collector.mean_acceptance(),
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

impl<F, R> Chain for NutsChain<F, R>
where
    F: LogpFunc,
    R: rand::Rng,
{
    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError> {
        self.state = Some(self.hamiltonian.init_state(position)?);
        Ok(())
    }

    fn step(
        &mut self,
        tuning: bool,
        position: &[f64],
    ) -> Result<(Box<[f64]>, SampleStats), NutsError> {
        let is_current = self
            .state
            .as_ref()
            .is_some_and(|state| state.position() == position);
        if !is_current {
            self.set_position(position)?;
        }
        self.draw_from_state(tuning)
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, SampleStats), NutsError> {
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

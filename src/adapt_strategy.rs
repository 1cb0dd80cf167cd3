use log::{debug, info};

use crate::{
    hamiltonian::{EuclideanHamiltonian, LogpFunc},
    mass_matrix::MassMatrix,
    mass_matrix_adapt::MassMatrixAdapt,
    nuts::NutsOptions,
    sampler::NutsSettings,
    stepsize::DualAverage,
};

/// Joint adaptation of the step size and the mass matrix during tuning.
pub(crate) struct GlobalStrategy {
    step_size_adapt: DualAverage,
    mass_matrix_adapt: MassMatrixAdapt,
    target_accept: f64,
    maxdepth: u64,
    early_maxdepth: u64,
    num_early_draws: u64,
    restart_step_size: bool,
    num_tune: u64,
    tuning: bool,
}

impl GlobalStrategy {
    pub(crate) fn new(settings: &NutsSettings, initial_step: f64, mass_matrix: &MassMatrix) -> Self {
        Self {
            step_size_adapt: DualAverage::new(settings.step_size_adapt, initial_step),
            mass_matrix_adapt: MassMatrixAdapt::new(
                settings.mass_matrix_adapt,
                settings.num_tune,
                mass_matrix,
            ),
            target_accept: settings.target_accept,
            maxdepth: settings.maxdepth,
            early_maxdepth: settings.early_maxdepth,
            num_early_draws: settings.num_early_draws,
            restart_step_size: settings.mass_matrix_adapt.restart_step_size,
            num_tune: settings.num_tune,
            tuning: true,
        }
    }

    pub(crate) fn init<F: LogpFunc>(
        &self,
        options: &mut NutsOptions,
        hamiltonian: &mut EuclideanHamiltonian<F>,
    ) {
        self.init_step_size(hamiltonian);
        self.set_maxdepth(options, 0);
    }

    pub(crate) fn init_step_size<F: LogpFunc>(&self, hamiltonian: &mut EuclideanHamiltonian<F>) {
        *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size(self.tuning);
    }

    pub(crate) fn is_tuning(&self) -> bool {
        self.tuning
    }

    pub(crate) fn step_size_bar(&self) -> f64 {
        self.step_size_adapt.current_step_size_adapted()
    }

    pub(crate) fn num_mass_matrix_updates(&self) -> u64 {
        self.mass_matrix_adapt.num_updates()
    }

    /// Leave the tuning phase and freeze the averaged step size.
    ///
    /// Tuning can not be resumed afterwards.
    pub(crate) fn finish_tuning<F: LogpFunc>(&mut self, hamiltonian: &mut EuclideanHamiltonian<F>) {
        self.tuning = false;
        *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size(false);
    }

    /// Decide whether draw number `draw` is a tuning draw.
    ///
    /// A draw tunes only if tuning is requested, the draw is one of the
    /// first `num_tune` and tuning never ended before. The first draw that
    /// does not tune ends the tuning phase for good.
    pub(crate) fn start_draw<F: LogpFunc>(
        &mut self,
        requested: bool,
        draw: u64,
        chain: u64,
        hamiltonian: &mut EuclideanHamiltonian<F>,
    ) -> bool {
        let tuning = requested & (draw < self.num_tune) & self.tuning;
        if !tuning & self.tuning {
            self.finish_tuning(hamiltonian);
            info!(
                "Chain {chain} finished tuning after {draw} draws with step size {}",
                hamiltonian.step_size()
            );
        }
        tuning
    }

    pub(crate) fn set_maxdepth(&self, options: &mut NutsOptions, draw: u64) {
        options.maxdepth = if self.tuning & (draw < self.num_early_draws) {
            self.early_maxdepth
        } else {
            self.maxdepth
        };
    }

    /// Update the step size and mass matrix after a tuning draw.
    ///
    /// `accept_stat` is the acceptance statistic of the draw, the mean
    /// tree acceptance for NUTS or the Metropolis probability for HMC.
    pub(crate) fn adapt<F: LogpFunc>(
        &mut self,
        hamiltonian: &mut EuclideanHamiltonian<F>,
        draw: u64,
        accept_stat: f64,
        position: &[f64],
    ) {
        assert!(self.tuning);
        self.step_size_adapt.advance(accept_stat, self.target_accept);

        let updated = self
            .mass_matrix_adapt
            .adapt(hamiltonian.mass_matrix_mut(), draw, position);
        if updated & self.restart_step_size {
            let step_size = self.step_size_adapt.current_step_size_adapted();
            debug!("Restarting step size adaptation at {step_size} after draw {draw}");
            self.step_size_adapt.reset(step_size, 10.);
        }

        *hamiltonian.step_size_mut() = self.step_size_adapt.current_step_size(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mass_matrix_adapt::MassMatrixAdaptOptions,
        nuts::{draw, Collector},
        sampler::test_logps::NormalLogp,
        stepsize::AcceptanceRateCollector,
    };
    use pretty_assertions::assert_eq;
    use rand::{rngs::SmallRng, SeedableRng};

    fn setup(settings: &NutsSettings) -> (GlobalStrategy, EuclideanHamiltonian<NormalLogp>) {
        let mass_matrix = MassMatrix::identity_diag(4);
        let strategy = GlobalStrategy::new(settings, 0.5, &mass_matrix);
        let hamiltonian =
            EuclideanHamiltonian::new(NormalLogp { dim: 4, mu: 2. }, mass_matrix, 1000., 0.5);
        (strategy, hamiltonian)
    }

    #[test]
    fn early_maxdepth() {
        let settings = NutsSettings {
            num_early_draws: 10,
            early_maxdepth: 4,
            maxdepth: 9,
            ..Default::default()
        };
        let (mut strategy, mut hamiltonian) = setup(&settings);
        let mut options = NutsOptions { maxdepth: 1 };
        strategy.init(&mut options, &mut hamiltonian);
        assert_eq!(options.maxdepth, 4);

        strategy.set_maxdepth(&mut options, 10);
        assert_eq!(options.maxdepth, 9);

        strategy.finish_tuning(&mut hamiltonian);
        strategy.set_maxdepth(&mut options, 3);
        assert_eq!(options.maxdepth, 9);
    }

    #[test]
    fn adapt_and_freeze() {
        let settings = NutsSettings {
            num_tune: 150,
            mass_matrix_adapt: MassMatrixAdaptOptions {
                init_buffer: 20,
                term_buffer: 20,
                base_window: 20,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut strategy, mut hamiltonian) = setup(&settings);
        let mut options = NutsOptions { maxdepth: 10 };
        strategy.init(&mut options, &mut hamiltonian);

        let mut rng = SmallRng::seed_from_u64(11);
        let mut state = hamiltonian.init_state(&[0.; 4]).unwrap();
        let mut collector = AcceptanceRateCollector::new();
        for i in 0..150 {
            strategy.set_maxdepth(&mut options, i);
            let (next, _) = draw(
                &mut state,
                &mut rng,
                &mut hamiltonian,
                &options,
                &mut collector,
            )
            .unwrap();
            let position = next.position().to_vec();
            strategy.adapt(&mut hamiltonian, i, collector.mean_acceptance(), &position);
            state = next;
        }
        assert!(strategy.num_mass_matrix_updates() >= 2);
        assert!(hamiltonian.step_size().is_finite() & (hamiltonian.step_size() > 0.));
        assert!(hamiltonian
            .mass_matrix()
            .variance()
            .iter()
            .all(|&v| (v > 0.1) & (v < 10.)));

        strategy.finish_tuning(&mut hamiltonian);
        assert!(!strategy.is_tuning());
        assert_eq!(hamiltonian.step_size(), strategy.step_size_bar());
    }

    #[test]
    fn collector_is_reset_per_draw() {
        let settings = NutsSettings::default();
        let (strategy, mut hamiltonian) = setup(&settings);
        let mut options = NutsOptions { maxdepth: 10 };
        strategy.init(&mut options, &mut hamiltonian);

        let mut rng = SmallRng::seed_from_u64(3);
        let mut state = hamiltonian.init_state(&[1.; 4]).unwrap();
        let mut collector = AcceptanceRateCollector::new();
        let (_, info) = draw(
            &mut state,
            &mut rng,
            &mut hamiltonian,
            &options,
            &mut collector,
        )
        .unwrap();
        assert!(collector.n_steps() >= 2u64.pow(info.depth as u32) - 1);

        collector.register_init(&state, &options);
        assert_eq!(collector.n_steps(), 0);
    }

    #[test]
    fn tuning_stops_after_num_tune() {
        let settings = NutsSettings {
            num_tune: 3,
            ..Default::default()
        };
        let (mut strategy, mut hamiltonian) = setup(&settings);
        strategy.init_step_size(&mut hamiltonian);

        for draw in 0..3 {
            assert!(strategy.start_draw(true, draw, 0, &mut hamiltonian));
            strategy.adapt(&mut hamiltonian, draw, 0.2, &[0.; 4]);
        }
        assert!(strategy.is_tuning());

        assert!(!strategy.start_draw(true, 3, 0, &mut hamiltonian));
        assert!(!strategy.is_tuning());
        assert_eq!(hamiltonian.step_size(), strategy.step_size_bar());

        // Once over, tuning can not be requested again.
        assert!(!strategy.start_draw(true, 1, 0, &mut hamiltonian));
    }
}

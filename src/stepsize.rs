use crate::{
    hamiltonian::DivergenceInfo,
    nuts::{Collector, NutsOptions},
    state::State,
};

/// Settings for step size adaptation
#[derive(Debug, Clone, Copy)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Nesterov dual averaging of the log step size.
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_step: f64,
    log_step_adapted: f64,
    hbar: f64,
    mu: f64,
    count: u64,
    settings: DualAverageOptions,
}

impl DualAverage {
    pub fn new(settings: DualAverageOptions, initial_step: f64) -> DualAverage {
        DualAverage {
            log_step: initial_step.ln(),
            log_step_adapted: initial_step.ln(),
            hbar: 0.,
            mu: (10. * initial_step).ln(),
            count: 1,
            settings,
        }
    }

    /// Move the step size towards one that produces an acceptance
    /// statistic of `target`.
    pub fn advance(&mut self, accept_stat: f64, target: f64) {
        let w = 1. / (self.count as f64 + self.settings.t0);
        self.hbar = (1. - w) * self.hbar + w * (target - accept_stat);
        self.log_step = self.mu - self.hbar * (self.count as f64).sqrt() / self.settings.gamma;
        let mk = (self.count as f64).powf(-self.settings.k);
        self.log_step_adapted = mk * self.log_step + (1. - mk) * self.log_step_adapted;
        self.count += 1;
    }

    /// The step size for the next draw.
    ///
    /// After tuning this is the averaged step size, which no longer changes.
    pub fn current_step_size(&self, tuning: bool) -> f64 {
        if tuning {
            self.log_step.exp()
        } else {
            self.current_step_size_adapted()
        }
    }

    pub fn current_step_size_adapted(&self) -> f64 {
        self.log_step_adapted.exp()
    }

    pub fn reset(&mut self, initial_step: f64, bias_factor: f64) {
        self.log_step = initial_step.ln();
        self.log_step_adapted = initial_step.ln();
        self.hbar = 0f64;
        self.mu = (bias_factor * initial_step).ln();
        self.count = 1;
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    fn new() -> RunningMean {
        RunningMean { sum: 0., count: 0 }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub(crate) fn current(&self) -> f64 {
        if self.count == 0 {
            return 0.;
        }
        self.sum / self.count as f64
    }

    pub(crate) fn reset(&mut self) {
        self.sum = 0f64;
        self.count = 0;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Mean Metropolis acceptance probability over all leapfrog steps of
/// a trajectory. Divergent steps count as rejected.
#[derive(Debug, Clone)]
pub struct AcceptanceRateCollector {
    initial_energy: f64,
    pub(crate) mean: RunningMean,
    max_energy_error: f64,
}

impl AcceptanceRateCollector {
    pub fn new() -> AcceptanceRateCollector {
        AcceptanceRateCollector {
            initial_energy: 0.,
            mean: RunningMean::new(),
            max_energy_error: 0.,
        }
    }

    pub fn mean_acceptance(&self) -> f64 {
        self.mean.current()
    }

    /// The number of leapfrog steps in the last trajectory.
    pub fn n_steps(&self) -> u64 {
        self.mean.count()
    }

    /// The energy error with the largest magnitude in the last trajectory.
    pub fn max_energy_error(&self) -> f64 {
        self.max_energy_error
    }

    fn record_energy_error(&mut self, energy_error: f64) {
        if !(energy_error.abs() <= self.max_energy_error.abs()) {
            self.max_energy_error = energy_error;
        }
    }
}

impl Default for AcceptanceRateCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for AcceptanceRateCollector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        match divergence_info {
            Some(info) => {
                self.mean.add(0.);
                if let Some(energy_error) = info.energy_error {
                    self.record_energy_error(energy_error);
                }
            }
            None => {
                let diff = self.initial_energy - end.energy();
                self.mean.add(diff.min(0.).exp());
                self.record_energy_error(-diff);
            }
        };
    }

    fn register_init(&mut self, state: &State, _options: &NutsOptions) {
        self.initial_energy = state.energy();
        self.mean.reset();
        self.max_energy_error = 0.;
    }
}

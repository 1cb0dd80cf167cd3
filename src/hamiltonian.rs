use std::sync::Arc;

use rand::distr::{Distribution, StandardUniform};

use crate::{
    mass_matrix::MassMatrix,
    nuts::{Collector, NutsError},
    state::{State, StatePool},
};

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// The log density of the target distribution and its gradient.
pub trait LogpFunc {
    type LogpError: LogpError;

    /// The dimension of the parameter space.
    fn dim(&self) -> usize;

    /// Compute the log density at `position` and write its gradient.
    ///
    /// Non-finite values are allowed and are treated as divergences.
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

/// Where and why a leapfrog step diverged.
///
/// A step diverges if its energy error is above `max_energy_error` or not
/// finite, or if the logp function failed with a recoverable error. In the
/// latter case `logp_function_error` holds that error.
#[derive(Debug, Clone)]
pub struct DivergenceInfo {
    pub start_momentum: Option<Box<[f64]>>,
    pub start_location: Option<Box<[f64]>>,
    pub start_gradient: Option<Box<[f64]>>,
    pub end_location: Option<Box<[f64]>>,
    pub energy_error: Option<f64>,
    pub end_idx_in_trajectory: Option<i64>,
    pub start_idx_in_trajectory: Option<i64>,
    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// The hamiltonian `H(q, p) = -logp(q) + p^T M^-1 p / 2`.
pub struct EuclideanHamiltonian<F: LogpFunc> {
    logp: F,
    pub(crate) mass_matrix: MassMatrix,
    max_energy_error: f64,
    step_size: f64,
    pool: StatePool,
}

impl<F: LogpFunc> EuclideanHamiltonian<F> {
    pub fn new(logp: F, mass_matrix: MassMatrix, max_energy_error: f64, step_size: f64) -> Self {
        let pool = StatePool::new(logp.dim(), 10);
        EuclideanHamiltonian {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
            pool,
        }
    }

    pub fn dim(&self) -> usize {
        self.logp.dim()
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    pub fn mass_matrix(&self) -> &MassMatrix {
        &self.mass_matrix
    }

    pub fn mass_matrix_mut(&mut self) -> &mut MassMatrix {
        &mut self.mass_matrix
    }

    fn check_dim(&self, len: usize) -> Result<(), NutsError> {
        if len != self.dim() {
            return Err(NutsError::DimensionMismatch {
                expected: self.dim(),
                found: len,
            });
        }
        Ok(())
    }

    fn update_potential_gradient(&mut self, state: &mut State) -> Result<(), F::LogpError> {
        let inner = state.try_mut_inner().expect("State already in use");
        let logp = self.logp.logp(&inner.q, &mut inner.grad)?;
        inner.potential_energy = -logp;
        Ok(())
    }

    /// One velocity verlet step from `start` into `out`.
    fn integrate(
        &mut self,
        start: &State,
        out: &mut State,
        epsilon: f64,
    ) -> Result<(), F::LogpError> {
        start.first_momentum_halfstep(out, epsilon);
        {
            let inner = out.try_mut_inner().expect("New state has other references");
            self.mass_matrix.update_velocity(&inner.p, &mut inner.v);
        }

        start.position_step(out, epsilon);
        self.update_potential_gradient(out)?;

        out.second_momentum_halfstep(epsilon);
        let inner = out.try_mut_inner().expect("New state has other references");
        self.mass_matrix.update_state(inner);
        Ok(())
    }

    /// Integrate the hamiltonian system for one step of signed size `epsilon`.
    ///
    /// A non-finite log density is not an error, it shows up as a
    /// non-finite energy of the returned state.
    pub fn step(&mut self, state: &State, epsilon: f64) -> Result<State, F::LogpError> {
        let mut out = self.pool.new_state();
        self.integrate(state, &mut out, epsilon)?;
        *out.index_in_trajectory_mut() = state.index_in_trajectory();
        Ok(out)
    }

    /// Perform one leapfrog step along the trajectory.
    ///
    /// Return either an unrecoverable error, a new state or a divergence.
    pub fn leapfrog<C: Collector>(
        &mut self,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<Result<State, DivergenceInfo>, NutsError> {
        let mut out = self.pool.new_state();

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        if let Err(logp_error) = self.integrate(start, &mut out, epsilon) {
            if !logp_error.is_recoverable() {
                return Err(NutsError::LogpFailure(Box::new(logp_error)));
            }
            let div_info = DivergenceInfo {
                logp_function_error: Some(Arc::new(logp_error)),
                start_location: Some(start.q.clone()),
                start_gradient: Some(start.grad.clone()),
                start_momentum: Some(start.p.clone()),
                end_location: None,
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: None,
                energy_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return Ok(Err(div_info));
        }

        *out.index_in_trajectory_mut() = start.index_in_trajectory() + sign;

        start.set_psum(&mut out);

        let energy_error = out.energy() - initial_energy;
        if (energy_error > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                logp_function_error: None,
                start_location: Some(start.q.clone()),
                start_gradient: Some(start.grad.clone()),
                end_location: Some(out.q.clone()),
                start_momentum: Some(start.p.clone()),
                start_idx_in_trajectory: Some(start.index_in_trajectory()),
                end_idx_in_trajectory: Some(out.index_in_trajectory()),
                energy_error: Some(energy_error),
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return Ok(Err(divergence_info));
        }

        collector.register_leapfrog(start, &out, None);

        Ok(Ok(out))
    }

    /// Build the phase space point `(q, p)` as the start of a trajectory.
    pub fn compute_state(&mut self, q: &[f64], p: &[f64]) -> Result<State, NutsError> {
        self.check_dim(q.len())?;
        self.check_dim(p.len())?;

        let mut state = self.pool.new_state();
        {
            let inner = state.try_mut_inner().expect("State already in use");
            inner.q.copy_from_slice(q);
            inner.p.copy_from_slice(p);
        }
        self.update_potential_gradient(&mut state)
            .map_err(|e| NutsError::LogpFailure(Box::new(e)))?;
        self.mass_matrix
            .update_state(state.try_mut_inner().expect("State already in use"));
        state.make_init_point();
        Ok(state)
    }

    /// Initialize a state at a new location.
    ///
    /// The momentum is set to zero, it will later be set using
    /// `initialize_trajectory`.
    pub fn init_state(&mut self, init: &[f64]) -> Result<State, NutsError> {
        self.check_dim(init.len())?;

        let mut state = self.pool.new_state();
        {
            let inner = state.try_mut_inner().expect("State already in use");
            inner.q.copy_from_slice(init);
            inner.p.fill(0.);
            inner.v.fill(0.);
            inner.p_sum.fill(0.);
            inner.kinetic_energy = 0.;
            inner.idx_in_trajectory = 0;
        }

        self.update_potential_gradient(&mut state)
            .map_err(|e| NutsError::LogpFailure(Box::new(e)))?;
        if !state.potential_energy.is_finite() | !state.grad.iter().all(|x| x.is_finite()) {
            return Err(NutsError::BadInitPoint());
        }
        Ok(state)
    }

    /// Draw a new momentum and make `state` the initial point of a trajectory.
    pub fn initialize_trajectory<R: rand::Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let inner = state.try_mut_inner().expect("State has other references");
        self.mass_matrix.randomize_momentum(rng, &mut inner.p);
        self.mass_matrix.update_state(inner);
        inner.idx_in_trajectory = 0;
        inner.p_sum.copy_from_slice(&inner.p);
    }

    pub(crate) fn copy_state(&self, state: &State) -> State {
        self.pool.copy_state(state)
    }
}

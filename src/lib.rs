//! Sample from posterior distributions using the No U-turn Sampler (NUTS).
//! For details see the original [NUTS paper](https://arxiv.org/abs/1111.4246)
//! and the more recent [introduction](https://arxiv.org/abs/1701.02434).
//!
//! This crate contains the sampler core: the euclidean hamiltonian with a
//! diagonal or dense mass matrix, the trajectory tree of NUTS, and the
//! adaptation of step size and mass matrix during tuning. Static HMC with a
//! fixed integration time is available as [`HmcChain`]. A thin driver
//! samples independent NUTS chains in parallel.
//!
//! ## Usage
//!
//! ```
//! use nuts_engine::{Chain, LogpError, LogpFunc, NutsChain, NutsSettings};
//! use rand::SeedableRng;
//! use thiserror::Error;
//!
//! // Define a function that computes the unnormalized posterior density
//! // and its gradient.
//! #[derive(Debug)]
//! struct PosteriorDensity {}
//!
//! // The density might fail in a recoverable or non-recoverable manner...
//! #[derive(Debug, Error)]
//! enum PosteriorLogpError {}
//! impl LogpError for PosteriorLogpError {
//!     fn is_recoverable(&self) -> bool { false }
//! }
//!
//! impl LogpFunc for PosteriorDensity {
//!     type LogpError = PosteriorLogpError;
//!
//!     // We define a 10 dimensional normal distribution
//!     fn dim(&self) -> usize { 10 }
//!
//!     // The normal likelihood with mean 3 and its gradient.
//!     fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
//!         let mu = 3f64;
//!         let logp = position
//!             .iter()
//!             .copied()
//!             .zip(grad.iter_mut())
//!             .map(|(x, grad)| {
//!                 let diff = x - mu;
//!                 *grad = -diff;
//!                 -diff * diff / 2f64
//!             })
//!             .sum();
//!         return Ok(logp)
//!     }
//! }
//!
//! let settings = NutsSettings {
//!     num_tune: 500,
//!     ..Default::default()
//! };
//! let rng = rand::rngs::SmallRng::seed_from_u64(42);
//! let mut sampler = NutsChain::new(PosteriorDensity {}, 10, &settings, 0, rng)
//!     .expect("Invalid settings");
//!
//! // Set to some initial position and start drawing samples.
//! sampler.set_position(&vec![0f64; 10]).expect("Unrecoverable error during init");
//! let mut trace = vec![];  // Collection of all draws
//! for _ in 0..1000 {
//!     let (draw, info) = sampler.draw().expect("Unrecoverable error during sampling");
//!     trace.push(draw);
//! }
//! ```

mod adapt_strategy;
mod chain;
mod hamiltonian;
mod hmc;
mod mass_matrix;
mod mass_matrix_adapt;
mod math;
mod nuts;
mod sampler;
mod sampler_stats;
mod state;
mod stepsize;

pub use chain::{Chain, NutsChain};
pub use hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LogpError, LogpFunc};
pub use hmc::{draw_static, HmcChain, HmcInfo, HmcOptions};
pub use mass_matrix::{DenseMassMatrix, DiagMassMatrix, MassMatrix};
pub use mass_matrix_adapt::{
    AdaptationWindows, MassMatrixAdapt, MassMatrixAdaptOptions, RunningCovariance,
    RunningVariance,
};
pub use nuts::{draw, Collector, NutsError, NutsOptions, SampleInfo};
pub use sampler::{
    sample_parallel, sample_sequentially, ChainOutput, InitPointFunc, JitterInitFunc, MetricKind,
    NutsSettings,
};
pub use sampler_stats::{AsSampleStatMap, SampleStatValue, SampleStats};
pub use state::{InnerState, State, StatePool};
pub use stepsize::{AcceptanceRateCollector, DualAverage, DualAverageOptions};

use thiserror::Error;

use crate::{
    hamiltonian::{Direction, DivergenceInfo, EuclideanHamiltonian, LogpFunc},
    math::logaddexp,
    state::State,
};

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not initialize state because of a non-finite logp or gradient")]
    BadInitPoint(),

    #[error("Expected a vector of length {expected}, but got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Invalid sampler settings: {0}")]
    InvalidSettings(String),

    #[error("Sampling was cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Hooks into a trajectory, called on every leapfrog step, at the start of
/// a trajectory and once the draw is chosen.
pub trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State, _options: &NutsOptions) {}
}

/// Summary of one NUTS trajectory.
#[derive(Debug)]
pub struct SampleInfo {
    /// Number of doublings of the trajectory.
    pub depth: u64,

    /// Set if the trajectory stopped at a divergent leapfrog step.
    pub divergence_info: Option<DivergenceInfo>,

    /// The trajectory stopped at `maxdepth` without turning.
    pub reached_maxdepth: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct NutsOptions {
    pub maxdepth: u64,
}

/// A balanced span of `2^depth` leapfrog states.
struct NutsTree {
    /// Endpoint with the lower `index_in_trajectory`, moved by backward steps.
    left: State,
    /// Endpoint with the higher `index_in_trajectory`, moved by forward steps.
    right: State,

    /// The state currently selected from the span.
    draw: State,
    /// Log of the summed weights `exp(-energy_error)` of the span.
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// Only the tree that holds the starting point is main.
    is_main: bool,
}

/// Outcome of doubling a tree.
///
/// `Diverging` holds the tree from before the doubling. So does `Turning`
/// if the new half turned on its own. If only the joint span turned,
/// `Turning` holds the doubled tree.
enum ExtendResult {
    Ok(NutsTree),
    Turning(NutsTree),
    Diverging(NutsTree, DivergenceInfo),
    /// The logp function failed without recovery.
    Err(NutsError),
}

/// Probability that merging two trees keeps the draw of `other`.
///
/// Subtrees use plain multinomial sampling. The main tree uses biased
/// progressive sampling, which favours the newer half of the trajectory.
fn other_draw_probability(self_log_size: f64, other_log_size: f64, is_main: bool) -> f64 {
    let self_log_size = if is_main {
        self_log_size
    } else {
        logaddexp(self_log_size, other_log_size)
    };
    (other_log_size - self_log_size).exp().min(1.)
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        let initial_energy = state.energy();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    #[inline]
    fn extend<F, R, C>(
        mut self,
        rng: &mut R,
        hamiltonian: &mut EuclideanHamiltonian<F>,
        direction: Direction,
        collector: &mut C,
    ) -> ExtendResult
    where
        F: LogpFunc,
        R: rand::Rng + ?Sized,
        C: Collector,
    {
        let mut other = match self.single_step(hamiltonian, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        // Grow the new half until it matches our size. If it turns or
        // diverges on its own, none of it is used.
        while other.depth < self.depth {
            other = match other.extend(rng, hamiltonian, direction, collector) {
                ExtendResult::Ok(grown) => grown,
                ExtendResult::Turning(_) => return ExtendResult::Turning(self),
                ExtendResult::Diverging(_, info) => return ExtendResult::Diverging(self, info),
                ExtendResult::Err(err) => return ExtendResult::Err(err),
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        // Besides the full span, a merge of two subtrees checks the spans
        // that reach from one half into the other.
        let mut turning = first.is_turning(last);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right);
            }
            if !turning {
                turning = self.left.is_turning(&other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    #[inline]
    fn merge_into<R: rand::Rng + ?Sized>(
        &mut self,
        other: NutsTree,
        rng: &mut R,
        direction: Direction,
    ) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
        }

        let prob = other_draw_probability(self.log_size, other.log_size, self.is_main);
        if prob >= 1. {
            self.draw = other.draw;
        } else if rng.random_bool(prob) {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = logaddexp(self.log_size, other.log_size);
    }

    #[inline]
    fn single_step<F: LogpFunc, C: Collector>(
        &self,
        hamiltonian: &mut EuclideanHamiltonian<F>,
        direction: Direction,
        collector: &mut C,
    ) -> Result<std::result::Result<NutsTree, DivergenceInfo>> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match hamiltonian.leapfrog(start, direction, self.initial_energy, collector) {
            Ok(Ok(end)) => end,
            Ok(Err(info)) => return Ok(Err(info)),
            Err(error) => return Err(error),
        };

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
        }
    }
}

/// Draw a new point using one NUTS trajectory starting at `init`.
///
/// `init` must not be shared, its momentum is resampled.
pub fn draw<F, R, C>(
    init: &mut State,
    rng: &mut R,
    hamiltonian: &mut EuclideanHamiltonian<F>,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo)>
where
    F: LogpFunc,
    R: rand::Rng + ?Sized,
    C: Collector,
{
    hamiltonian.initialize_trajectory(init, rng);
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(rng, hamiltonian, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

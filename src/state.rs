use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};

struct StateStorage {
    free_states: RefCell<Vec<Rc<InnerStateReusable>>>,
}

impl StateStorage {
    fn with_capacity(capacity: usize) -> StateStorage {
        StateStorage {
            free_states: RefCell::new(Vec::with_capacity(capacity)),
        }
    }
}

/// Per-chain storage of phase space points.
///
/// States that are no longer referenced return their buffers to the pool,
/// so building a trajectory does not allocate once the pool is warm.
pub struct StatePool {
    storage: Rc<StateStorage>,
    dim: usize,
}

impl StatePool {
    pub fn new(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            storage: Rc::new(StateStorage::with_capacity(capacity)),
            dim,
        }
    }

    pub fn new_state(&self) -> State {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => {
                assert!(inner.inner.q.len() == self.dim, "dim mismatch in state pool");
                inner
            }
            None => Rc::new(InnerStateReusable::new(self.dim, self)),
        };
        State {
            inner: std::mem::ManuallyDrop::new(inner),
        }
    }

    pub fn copy_state(&self, state: &State) -> State {
        let mut new_state = self.new_state();
        new_state
            .try_mut_inner()
            .expect("New state should not have references")
            .clone_from(state);
        new_state
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[cfg(test)]
    fn num_free(&self) -> usize {
        self.storage.free_states.borrow().len()
    }
}

/// A point in phase space together with its location in the trajectory.
///
/// `p_sum` is the sum of all momenta between the initial point of the
/// trajectory and this point (inclusive), used by the U-turn criterion.
#[derive(Debug, Clone)]
pub struct InnerState {
    pub(crate) p: Box<[f64]>,
    pub(crate) q: Box<[f64]>,
    pub(crate) v: Box<[f64]>,
    pub(crate) p_sum: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
}

impl InnerState {
    fn new(dim: usize) -> InnerState {
        InnerState {
            p: vec![0.; dim].into(),
            q: vec![0.; dim].into(),
            v: vec![0.; dim].into(),
            p_sum: vec![0.; dim].into(),
            grad: vec![0.; dim].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
        }
    }

    pub(crate) fn clone_from(&mut self, other: &InnerState) {
        let InnerState {
            p,
            q,
            v,
            p_sum,
            grad,
            idx_in_trajectory,
            kinetic_energy,
            potential_energy,
        } = self;
        p.copy_from_slice(&other.p);
        q.copy_from_slice(&other.q);
        v.copy_from_slice(&other.v);
        p_sum.copy_from_slice(&other.p_sum);
        grad.copy_from_slice(&other.grad);
        *idx_in_trajectory = other.idx_in_trajectory;
        *kinetic_energy = other.kinetic_energy;
        *potential_energy = other.potential_energy;
    }

    pub fn position(&self) -> &[f64] {
        &self.q
    }

    pub fn momentum(&self) -> &[f64] {
        &self.p
    }

    pub fn velocity(&self) -> &[f64] {
        &self.v
    }

    pub fn gradient(&self) -> &[f64] {
        &self.grad
    }

    /// Total energy: potential plus kinetic.
    pub fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub fn potential_energy(&self) -> f64 {
        self.potential_energy
    }

    pub fn kinetic_energy(&self) -> f64 {
        self.kinetic_energy
    }

    pub fn logp(&self) -> f64 {
        -self.potential_energy
    }

    pub fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }
}

struct InnerStateReusable {
    inner: InnerState,
    reuser: Weak<StateStorage>,
}

impl InnerStateReusable {
    fn new(dim: usize, owner: &StatePool) -> InnerStateReusable {
        InnerStateReusable {
            inner: InnerState::new(dim),
            reuser: Rc::downgrade(&owner.storage),
        }
    }
}

/// Shared handle to a pooled phase space point.
///
/// Cloning a state is cheap, but a state can only be modified while
/// there is only one handle to it.
pub struct State {
    inner: std::mem::ManuallyDrop<Rc<InnerStateReusable>>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        &self.inner.inner
    }
}

#[derive(Debug)]
pub struct StateInUse {}

type Result<T> = std::result::Result<T, StateInUse>;

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState> {
        match Rc::get_mut(&mut self.inner) {
            Some(val) => Ok(&mut val.inner),
            None => Err(StateInUse {}),
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        // SAFETY: `inner` is never used again after this point.
        let rc = unsafe { std::mem::ManuallyDrop::take(&mut self.inner) };
        if (Rc::strong_count(&rc) == 1) & (Rc::weak_count(&rc) == 0) {
            if let Some(storage) = rc.reuser.upgrade() {
                storage.free_states.borrow_mut().push(rc);
            }
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
        }
    }
}

impl State {
    /// Generalized no-U-turn criterion between two points of one trajectory.
    ///
    /// The sum of the momenta from the left to the right point must have a
    /// positive scalar product with the velocities at both ends.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    pub(crate) fn write_position(&self, out: &mut [f64]) {
        out.copy_from_slice(&self.q)
    }

    /// Mark this point as the initial point of a new trajectory.
    pub(crate) fn make_init_point(&mut self) {
        let inner = self.try_mut_inner().expect("State already in use");
        inner.idx_in_trajectory = 0;
        inner.p_sum.copy_from_slice(&inner.p);
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(
            &self.grad,
            &self.p,
            epsilon / 2.,
            &mut out.try_mut_inner().expect("State already in use").p,
        );
    }

    pub(crate) fn position_step(&self, out: &mut Self, epsilon: f64) {
        let out = out.try_mut_inner().expect("State already in use");
        axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        let inner = self.try_mut_inner().expect("State already in use");
        axpy(&inner.grad, &mut inner.p, epsilon / 2.);
    }

    pub(crate) fn set_psum(&self, target: &mut Self) {
        let out = target.try_mut_inner().expect("State already in use");

        assert!(out.idx_in_trajectory != 0);

        if out.idx_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.p);
        } else {
            axpy_out(&out.p, &self.p_sum, 1., &mut out.p_sum);
        }
    }

    pub(crate) fn index_in_trajectory_mut(&mut self) -> &mut i64 {
        &mut self
            .try_mut_inner()
            .expect("State already in use")
            .idx_in_trajectory
    }
}

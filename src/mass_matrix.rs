use faer::Mat;
use itertools::izip;
use rand_distr::StandardNormal;

use crate::{
    math::{matvec, multiply, vector_dot},
    nuts::NutsError,
    state::InnerState,
};

pub(crate) const LOWER_LIMIT: f64 = 1e-10f64;
pub(crate) const UPPER_LIMIT: f64 = 1e10f64;

/// The metric of the euclidean hamiltonian.
///
/// We store the inverse mass matrix, which is the estimate of the
/// posterior covariance. Momentum is drawn from `N(0, M)`, the velocity
/// is `M^-1 p` and the kinetic energy is `p^T M^-1 p / 2`.
#[derive(Debug, Clone)]
pub enum MassMatrix {
    Diag(DiagMassMatrix),
    Dense(DenseMassMatrix),
}

impl MassMatrix {
    pub fn identity_diag(dim: usize) -> Self {
        MassMatrix::Diag(DiagMassMatrix::new(dim))
    }

    pub fn identity_dense(dim: usize) -> Self {
        MassMatrix::Dense(DenseMassMatrix::new(dim))
    }

    /// A diagonal metric with the given posterior variance estimate.
    pub fn from_variance(variance: &[f64]) -> Result<Self, NutsError> {
        let mut matrix = DiagMassMatrix::new(variance.len());
        if !variance.iter().all(|&x| x.is_finite() & (x > 0f64)) {
            return Err(NutsError::InvalidSettings(
                "Variance of the mass matrix must be positive and finite".into(),
            ));
        }
        matrix.update_diag(variance.iter().copied());
        Ok(MassMatrix::Diag(matrix))
    }

    /// A dense metric from a row-major `dim x dim` covariance estimate.
    pub fn from_covariance(dim: usize, covariance: &[f64]) -> Result<Self, NutsError> {
        if covariance.len() != dim * dim {
            return Err(NutsError::DimensionMismatch {
                expected: dim * dim,
                found: covariance.len(),
            });
        }
        if !covariance.iter().all(|x| x.is_finite()) {
            return Err(NutsError::InvalidSettings(
                "Covariance of the mass matrix must be finite".into(),
            ));
        }
        let mut matrix = DenseMassMatrix::new(dim);
        if !matrix.update_covariance(covariance) {
            return Err(NutsError::InvalidSettings(
                "Could not decompose covariance of the mass matrix".into(),
            ));
        }
        Ok(MassMatrix::Dense(matrix))
    }

    pub fn dim(&self) -> usize {
        match self {
            MassMatrix::Diag(inner) => inner.variance.len(),
            MassMatrix::Dense(inner) => inner.dim,
        }
    }

    /// Draw a new momentum vector.
    pub fn randomize_momentum<R: rand::Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        match self {
            MassMatrix::Diag(inner) => inner.randomize_momentum(rng, momentum),
            MassMatrix::Dense(inner) => inner.randomize_momentum(rng, momentum),
        }
    }

    /// Compute the velocity `M^-1 p`.
    pub fn update_velocity(&self, momentum: &[f64], velocity: &mut [f64]) {
        match self {
            MassMatrix::Diag(inner) => multiply(&inner.variance, momentum, velocity),
            MassMatrix::Dense(inner) => matvec(&inner.covariance, momentum, velocity),
        }
    }

    pub fn kinetic_energy(&self, momentum: &[f64], velocity: &[f64]) -> f64 {
        0.5 * vector_dot(momentum, velocity)
    }

    /// The diagonal of the inverse mass matrix.
    pub fn variance(&self) -> Box<[f64]> {
        match self {
            MassMatrix::Diag(inner) => inner.variance.clone(),
            MassMatrix::Dense(inner) => (0..inner.dim)
                .map(|i| inner.covariance[i * inner.dim + i])
                .collect(),
        }
    }

    pub(crate) fn update_state(&self, state: &mut InnerState) {
        self.update_velocity(&state.p, &mut state.v);
        state.kinetic_energy = self.kinetic_energy(&state.p, &state.v);
    }
}

#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; dim].into(),
            variance: vec![1f64; dim].into(),
        }
    }

    /// Replace the variance, clamping every entry into the valid range.
    ///
    /// Non-finite entries fall back to one.
    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        update_diag(&mut self.variance, &mut self.inv_stds, new_variance);
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        momentum
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }
}

fn update_diag(
    variance_out: &mut [f64],
    inv_std_out: &mut [f64],
    new_variance: impl Iterator<Item = f64>,
) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, x)| {
        let x = if x.is_finite() {
            x.clamp(LOWER_LIMIT, UPPER_LIMIT)
        } else {
            1f64
        };
        *var = x;
        *inv_std = x.sqrt().recip();
    });
}

/// Dense metric, stored through the eigendecomposition `U S U^T` of the
/// covariance.
#[derive(Debug, Clone)]
pub struct DenseMassMatrix {
    dim: usize,
    /// Row-major covariance, rebuilt from the clipped eigenvalues
    covariance: Box<[f64]>,
    /// Row-major `U S^-1/2`, maps standard normal draws to momenta
    momentum_factor: Box<[f64]>,
}

impl DenseMassMatrix {
    pub(crate) fn new(dim: usize) -> Self {
        let identity: Box<[f64]> = (0..dim * dim)
            .map(|k| if k / dim == k % dim { 1f64 } else { 0f64 })
            .collect();
        Self {
            dim,
            covariance: identity.clone(),
            momentum_factor: identity,
        }
    }

    pub fn covariance(&self) -> &[f64] {
        &self.covariance
    }

    /// Replace the covariance. Returns false and keeps the old matrix if the
    /// eigendecomposition fails.
    pub(crate) fn update_covariance(&mut self, covariance: &[f64]) -> bool {
        let Some((vals, vecs)) = decompose(self.dim, covariance) else {
            return false;
        };
        let n = self.dim;

        for i in 0..n {
            for k in 0..n {
                self.covariance[i * n + k] = izip!(&vals, &vecs)
                    .map(|(&s, u)| u[i] * s * u[k])
                    .sum();
            }
            for (j, (&s, u)) in izip!(&vals, &vecs).enumerate() {
                self.momentum_factor[i * n + j] = u[i] * s.sqrt().recip();
            }
        }
        true
    }

    fn randomize_momentum<R: rand::Rng + ?Sized>(&self, rng: &mut R, momentum: &mut [f64]) {
        let normal: Vec<f64> = (0..self.dim).map(|_| rng.sample(StandardNormal)).collect();
        matvec(&self.momentum_factor, &normal, momentum);
    }
}

/// Eigenvalues (clipped) and eigenvectors (as columns) of a symmetric matrix.
fn decompose(dim: usize, covariance: &[f64]) -> Option<(Vec<f64>, Vec<Vec<f64>>)> {
    let mat = Mat::from_fn(dim, dim, |i, j| {
        0.5 * (covariance[i * dim + j] + covariance[j * dim + i])
    });
    let eig = mat.self_adjoint_eigen(faer::Side::Lower).ok()?;

    let vals = eig.S().column_vector().to_owned();
    let vecs = eig.U().to_owned();

    let vals: Vec<f64> = vals.iter().map(|&x| x.clamp(LOWER_LIMIT, UPPER_LIMIT)).collect();
    if !vals.iter().all(|x| x.is_finite()) {
        return None;
    }
    let vecs: Vec<Vec<f64>> = vecs
        .col_iter()
        .map(|col| col.iter().copied().collect())
        .collect();
    if !vecs.iter().flatten().all(|x| x.is_finite()) {
        return None;
    }
    Some((vals, vecs))
}

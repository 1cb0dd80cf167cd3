use itertools::izip;
use log::{debug, warn};

use crate::mass_matrix::{MassMatrix, LOWER_LIMIT, UPPER_LIMIT};

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy)]
pub struct MassMatrixAdaptOptions {
    /// Adapt the mass matrix during tuning
    pub enabled: bool,
    /// Number of draws at the start of tuning that only adapt the step size
    pub init_buffer: u64,
    /// Number of draws at the end of tuning that only adapt the step size
    pub term_buffer: u64,
    /// Length of the first slow window. Each following window doubles.
    pub base_window: u64,
    /// Weight `w` of the shrinkage `n / (n + w)` towards the identity
    pub regularization_weight: f64,
    /// Scale of the identity the estimate is shrunk towards
    pub regularization_scale: f64,
    /// Restart step size adaptation after each mass matrix update
    pub restart_step_size: bool,
}

impl Default for MassMatrixAdaptOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            init_buffer: 75,
            term_buffer: 50,
            base_window: 25,
            regularization_weight: 5.,
            regularization_scale: 1e-3,
            restart_step_size: true,
        }
    }
}

/// Welford estimate of the variance of each coordinate.
#[derive(Debug, Clone)]
pub struct RunningVariance {
    mean: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.m2.iter_mut()).for_each(|(&x, mean, m2)| {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        });
    }

    /// The unbiased sample variance, if there are at least two samples.
    pub fn current(&self) -> Option<Box<[f64]>> {
        if self.count < 2 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        Some(self.m2.iter().map(|&m2| m2 * scale).collect())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

/// Welford estimate of the full covariance, stored row-major.
#[derive(Debug, Clone)]
pub struct RunningCovariance {
    dim: usize,
    mean: Box<[f64]>,
    delta: Box<[f64]>,
    m2: Box<[f64]>,
    count: u64,
}

impl RunningCovariance {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            mean: vec![0f64; dim].into(),
            delta: vec![0f64; dim].into(),
            m2: vec![0f64; dim * dim].into(),
            count: 0,
        }
    }

    pub fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        izip!(value, self.mean.iter_mut(), self.delta.iter_mut()).for_each(
            |(&x, mean, delta)| {
                *delta = x - *mean;
                *mean += *delta / n;
            },
        );
        for (row, &delta) in self.m2.chunks_exact_mut(self.dim.max(1)).zip(self.delta.iter()) {
            izip!(row, value, self.mean.iter()).for_each(|(m2, &x, &mean)| {
                *m2 += delta * (x - mean);
            });
        }
    }

    /// The unbiased sample covariance, if there are at least two samples.
    pub fn current(&self) -> Option<Box<[f64]>> {
        if self.count < 2 {
            return None;
        }
        let scale = ((self.count - 1) as f64).recip();
        Some(self.m2.iter().map(|&m2| m2 * scale).collect())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2.fill(0.);
        self.count = 0;
    }
}

/// The tuning schedule: a fast initial buffer, slow windows that double
/// in length and a fast terminal buffer.
#[derive(Debug, Clone)]
pub struct AdaptationWindows {
    /// Half open `[start, end)` draw ranges of the slow windows
    windows: Vec<(u64, u64)>,
}

impl AdaptationWindows {
    pub fn new(num_tune: u64, options: &MassMatrixAdaptOptions) -> Self {
        if !options.enabled | (num_tune < 20) {
            return Self { windows: vec![] };
        }

        let mut init_buffer = options.init_buffer;
        let mut term_buffer = options.term_buffer;
        let mut base_window = options.base_window.max(1);
        if init_buffer + term_buffer + base_window > num_tune {
            init_buffer = (0.15 * num_tune as f64) as u64;
            term_buffer = (0.1 * num_tune as f64) as u64;
            base_window = num_tune - (init_buffer + term_buffer);
        }

        let slow_end = num_tune - term_buffer;
        let mut windows = vec![];
        let mut start = init_buffer;
        let mut size = base_window;
        while start < slow_end {
            let mut end = start + size;
            // Stretch the window if the next one would not fit
            if end + 2 * size > slow_end {
                end = slow_end;
            }
            windows.push((start, end));
            start = end;
            size *= 2;
        }
        Self { windows }
    }

    pub fn windows(&self) -> &[(u64, u64)] {
        &self.windows
    }

    /// Whether the draw with index `draw` feeds the covariance estimate.
    pub fn in_slow_window(&self, draw: u64) -> bool {
        self.windows
            .iter()
            .any(|&(start, end)| (start <= draw) & (draw < end))
    }

    /// Whether the mass matrix is updated after the draw with index `draw`.
    pub fn is_window_end(&self, draw: u64) -> bool {
        self.windows.iter().any(|&(_, end)| draw + 1 == end)
    }
}

#[derive(Debug, Clone)]
enum Estimator {
    Variance(RunningVariance),
    Covariance(RunningCovariance),
}

/// Windowed estimation of the posterior covariance during tuning.
#[derive(Debug, Clone)]
pub struct MassMatrixAdapt {
    windows: AdaptationWindows,
    estimator: Estimator,
    options: MassMatrixAdaptOptions,
    dim: usize,
    num_updates: u64,
}

impl MassMatrixAdapt {
    /// The kind of estimate (diagonal or dense) follows the kind of `mass_matrix`.
    pub fn new(options: MassMatrixAdaptOptions, num_tune: u64, mass_matrix: &MassMatrix) -> Self {
        let dim = mass_matrix.dim();
        let estimator = match mass_matrix {
            MassMatrix::Diag(_) => Estimator::Variance(RunningVariance::new(dim)),
            MassMatrix::Dense(_) => Estimator::Covariance(RunningCovariance::new(dim)),
        };
        Self {
            windows: AdaptationWindows::new(num_tune, &options),
            estimator,
            options,
            dim,
            num_updates: 0,
        }
    }

    pub fn windows(&self) -> &AdaptationWindows {
        &self.windows
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    /// Register the position of draw `draw` and update the mass matrix at
    /// the end of a slow window.
    ///
    /// Returns true if the mass matrix changed.
    pub fn adapt(&mut self, mass_matrix: &mut MassMatrix, draw: u64, position: &[f64]) -> bool {
        if !self.windows.in_slow_window(draw) {
            return false;
        }

        match &mut self.estimator {
            Estimator::Variance(estimator) => estimator.add_sample(position),
            Estimator::Covariance(estimator) => estimator.add_sample(position),
        }

        if !self.windows.is_window_end(draw) {
            return false;
        }

        let updated = self.update_mass_matrix(mass_matrix);
        match &mut self.estimator {
            Estimator::Variance(estimator) => estimator.reset(),
            Estimator::Covariance(estimator) => estimator.reset(),
        }
        if updated {
            self.num_updates += 1;
        }
        updated
    }

    fn shrinkage(&self, count: u64) -> (f64, f64) {
        let n = count as f64;
        let w = self.options.regularization_weight;
        (n / (n + w), self.options.regularization_scale * w / (n + w))
    }

    fn update_mass_matrix(&self, mass_matrix: &mut MassMatrix) -> bool {
        match (&self.estimator, mass_matrix) {
            (Estimator::Variance(estimator), MassMatrix::Diag(inner)) => {
                let Some(variance) = estimator.current() else {
                    return false;
                };
                let (weight, shift) = self.shrinkage(estimator.count());
                let variance: Box<[f64]> = variance.iter().map(|&v| weight * v + shift).collect();
                if variance
                    .iter()
                    .any(|&v| !v.is_finite() | (v < LOWER_LIMIT) | (v > UPPER_LIMIT))
                {
                    warn!("Degenerate variance estimate, clipping the mass matrix");
                }
                inner.update_diag(variance.iter().copied());
                debug!(
                    "Updated diagonal mass matrix from {} draws",
                    estimator.count()
                );
                true
            }
            (Estimator::Covariance(estimator), MassMatrix::Dense(inner)) => {
                let Some(mut covariance) = estimator.current() else {
                    return false;
                };
                let (weight, shift) = self.shrinkage(estimator.count());
                covariance.iter_mut().for_each(|v| *v *= weight);
                for i in 0..self.dim {
                    covariance[i * self.dim + i] += shift;
                }
                if !covariance.iter().all(|v| v.is_finite()) {
                    warn!("Non-finite covariance estimate, keeping the previous mass matrix");
                    return false;
                }
                if !inner.update_covariance(&covariance) {
                    warn!("Degenerate covariance estimate, keeping the previous mass matrix");
                    return false;
                }
                debug!("Updated dense mass matrix from {} draws", estimator.count());
                true
            }
            _ => {
                warn!("Mass matrix kind changed during adaptation, skipping update");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn default_windows() {
        let windows = AdaptationWindows::new(1000, &MassMatrixAdaptOptions::default());
        assert_eq!(
            windows.windows(),
            &[(75, 100), (100, 150), (150, 250), (250, 450), (450, 950)]
        );
        assert!(!windows.in_slow_window(74));
        assert!(windows.in_slow_window(75));
        assert!(windows.in_slow_window(949));
        assert!(!windows.in_slow_window(950));
        assert!(windows.is_window_end(99));
        assert!(windows.is_window_end(949));
        assert!(!windows.is_window_end(100));
    }

    #[test]
    fn short_tuning() {
        let options = MassMatrixAdaptOptions::default();
        assert!(AdaptationWindows::new(19, &options).windows().is_empty());

        let windows = AdaptationWindows::new(100, &options);
        assert_eq!(windows.windows(), &[(15, 90)]);

        let disabled = MassMatrixAdaptOptions {
            enabled: false,
            ..Default::default()
        };
        assert!(AdaptationWindows::new(1000, &disabled).windows().is_empty());
    }

    proptest! {
        #[test]
        fn windows_are_contiguous(num_tune in 0u64..5000) {
            let windows = AdaptationWindows::new(num_tune, &MassMatrixAdaptOptions::default());
            let windows = windows.windows();
            for pair in windows.windows(2) {
                prop_assert_eq!(pair[0].1, pair[1].0);
            }
            for &(start, end) in windows {
                prop_assert!(start < end);
                prop_assert!(end <= num_tune);
            }
        }
    }

    #[test]
    fn welford_variance() {
        let mut estimator = RunningVariance::new(2);
        assert!(estimator.current().is_none());
        for x in [[1., 10.], [2., 10.], [3., 10.], [4., 10.]] {
            estimator.add_sample(&x);
        }
        let variance = estimator.current().unwrap();
        assert_relative_eq!(variance[0], 5. / 3.);
        assert_relative_eq!(variance[1], 0.);

        estimator.reset();
        assert_eq!(estimator.count(), 0);
    }

    #[test]
    fn welford_covariance() {
        let mut estimator = RunningCovariance::new(2);
        let draws = [[1., 2.], [2., 4.5], [3., 5.], [4., 9.]];
        for x in draws.iter() {
            estimator.add_sample(x);
        }
        let cov = estimator.current().unwrap();

        let mean = [2.5, 5.125];
        let mut expected = [0f64; 4];
        for x in draws.iter() {
            for i in 0..2 {
                for j in 0..2 {
                    expected[i * 2 + j] += (x[i] - mean[i]) * (x[j] - mean[j]) / 3.;
                }
            }
        }
        for (a, b) in cov.iter().zip(expected.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
        assert_relative_eq!(cov[1], cov[2], epsilon = 1e-12);
    }

    #[test]
    fn regularized_update() {
        let options = MassMatrixAdaptOptions {
            init_buffer: 0,
            term_buffer: 0,
            base_window: 20,
            ..Default::default()
        };
        let mut mass_matrix = MassMatrix::identity_diag(1);
        let mut adapt = MassMatrixAdapt::new(options, 20, &mass_matrix);
        assert_eq!(adapt.windows().windows(), &[(0, 20)]);

        let mut updated = false;
        for draw in 0..20 {
            let x = if draw % 2 == 0 { 1. } else { -1. };
            updated = adapt.adapt(&mut mass_matrix, draw, &[x]);
            assert_eq!(updated, draw == 19);
        }
        assert!(updated);
        assert_eq!(adapt.num_updates(), 1);

        let sample_variance = 20. / 19.;
        let expected = 20. / 25. * sample_variance + 1e-3 * 5. / 25.;
        assert_relative_eq!(mass_matrix.variance()[0], expected, epsilon = 1e-12);

        // Tuning is over, later draws are ignored.
        assert!(!adapt.adapt(&mut mass_matrix, 20, &[100.]));
    }

    #[test]
    fn constant_draws_are_regularized() {
        let options = MassMatrixAdaptOptions {
            init_buffer: 0,
            term_buffer: 0,
            base_window: 20,
            ..Default::default()
        };
        let mut mass_matrix = MassMatrix::identity_dense(2);
        let mut adapt = MassMatrixAdapt::new(options, 20, &mass_matrix);
        for draw in 0..20 {
            adapt.adapt(&mut mass_matrix, draw, &[1., 1.]);
        }
        let variance = mass_matrix.variance();
        assert_relative_eq!(variance[0], 1e-3 * 5. / 25., epsilon = 1e-12);
        assert_relative_eq!(variance[1], 1e-3 * 5. / 25., epsilon = 1e-12);
    }
}

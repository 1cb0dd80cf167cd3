use std::collections::HashMap;

use crate::hamiltonian::DivergenceInfo;

#[derive(Debug, Clone, PartialEq)]
pub enum SampleStatValue {
    Array(Box<[f64]>),
    OptionArray(Option<Box<[f64]>>),
    U64(u64),
    I64(i64),
    F64(f64),
    OptionF64(Option<f64>),
    Bool(bool),
}

impl From<Box<[f64]>> for SampleStatValue {
    fn from(val: Box<[f64]>) -> Self {
        SampleStatValue::Array(val)
    }
}

impl From<Option<Box<[f64]>>> for SampleStatValue {
    fn from(val: Option<Box<[f64]>>) -> Self {
        SampleStatValue::OptionArray(val)
    }
}

impl From<u64> for SampleStatValue {
    fn from(val: u64) -> Self {
        SampleStatValue::U64(val)
    }
}

impl From<i64> for SampleStatValue {
    fn from(val: i64) -> Self {
        SampleStatValue::I64(val)
    }
}

impl From<f64> for SampleStatValue {
    fn from(val: f64) -> Self {
        SampleStatValue::F64(val)
    }
}

impl From<Option<f64>> for SampleStatValue {
    fn from(val: Option<f64>) -> Self {
        SampleStatValue::OptionF64(val)
    }
}

impl From<bool> for SampleStatValue {
    fn from(val: bool) -> Self {
        SampleStatValue::Bool(val)
    }
}

pub trait AsSampleStatMap {
    fn as_map(&self) -> HashMap<&'static str, SampleStatValue>;
}

/// Diagnostic information about one draw.
#[derive(Debug, Clone)]
pub struct SampleStats {
    /// The step size used to build the trajectory
    pub step_size: f64,
    /// The averaged step size of dual averaging
    pub step_size_bar: f64,
    /// Number of leapfrog steps in the trajectory
    pub n_steps: u64,
    pub depth: u64,
    pub reached_maxdepth: bool,
    pub divergent: bool,
    /// Energy of the selected point
    pub energy: f64,
    /// Energy of the selected point relative to the start of the trajectory
    pub energy_error: f64,
    /// The energy error with the largest magnitude in the trajectory
    pub max_energy_error: f64,
    /// Mean acceptance probability over all leapfrog steps
    pub mean_tree_accept: f64,
    pub logp: f64,
    pub index_in_trajectory: i64,
    pub tuning: bool,
    pub chain: u64,
    pub draw: u64,
    pub divergence_info: Option<DivergenceInfo>,
}

impl SampleStats {
    /// The number of leapfrog steps. Same as `n_steps`.
    pub fn tree_size(&self) -> u64 {
        self.n_steps
    }
}

impl AsSampleStatMap for SampleStats {
    fn as_map(&self) -> HashMap<&'static str, SampleStatValue> {
        let mut map: HashMap<_, SampleStatValue> = HashMap::with_capacity(24);
        map.insert("step_size", self.step_size.into());
        map.insert("step_size_bar", self.step_size_bar.into());
        map.insert("n_steps", self.n_steps.into());
        map.insert("depth", self.depth.into());
        map.insert("maxdepth_reached", self.reached_maxdepth.into());
        map.insert("diverging", self.divergent.into());
        map.insert("energy", self.energy.into());
        map.insert("energy_error", self.energy_error.into());
        map.insert("max_energy_error", self.max_energy_error.into());
        map.insert("mean_tree_accept", self.mean_tree_accept.into());
        map.insert("logp", self.logp.into());
        map.insert("index_in_trajectory", self.index_in_trajectory.into());
        map.insert("tuning", self.tuning.into());
        map.insert("chain", self.chain.into());
        map.insert("draw", self.draw.into());

        let info = self.divergence_info.as_ref();
        map.insert(
            "divergence_start",
            info.and_then(|d| d.start_location.clone()).into(),
        );
        map.insert(
            "divergence_start_gradient",
            info.and_then(|d| d.start_gradient.clone()).into(),
        );
        map.insert(
            "divergence_end",
            info.and_then(|d| d.end_location.clone()).into(),
        );
        map.insert(
            "divergence_momentum",
            info.and_then(|d| d.start_momentum.clone()).into(),
        );
        map.insert(
            "divergence_energy_error",
            info.and_then(|d| d.energy_error).into(),
        );
        map
    }
}

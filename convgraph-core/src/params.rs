use std::{collections::HashMap, fmt};

use rand::{distr::Uniform, rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ParameterKind {
    Weights,
    Biases,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weights => write!(f, "weights"),
            Self::Biases => write!(f, "biases"),
        }
    }
}

/// Supplies learned parameters while a graph compiles.
///
/// Returning `None` for a parameter the operation needs fails the compile with an
/// error naming the operation. Returning the wrong number of values fails it too.
pub trait ParameterSource {
    fn load_parameters(
        &mut self,
        operation: &str,
        count: usize,
        kind: ParameterKind,
    ) -> Option<Vec<f32>>;
}

impl<F> ParameterSource for F
where
    F: FnMut(&str, usize, ParameterKind) -> Option<Vec<f32>>,
{
    fn load_parameters(
        &mut self,
        operation: &str,
        count: usize,
        kind: ParameterKind,
    ) -> Option<Vec<f32>> {
        self(operation, count, kind)
    }
}

/// For graphs without learned parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoParameters;

impl ParameterSource for NoParameters {
    fn load_parameters(&mut self, _: &str, _: usize, _: ParameterKind) -> Option<Vec<f32>> {
        None
    }
}

/// Parameters held in memory, looked up as `operation name + suffix`.
#[derive(Clone, Debug)]
pub struct MemoryParameters {
    values: HashMap<String, Vec<f32>>,
    weights_suffix: String,
    biases_suffix: String,
}

impl Default for MemoryParameters {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
            weights_suffix: "_W".to_string(),
            biases_suffix: "_b".to_string(),
        }
    }
}

impl MemoryParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suffixes(mut self, weights: impl Into<String>, biases: impl Into<String>) -> Self {
        self.weights_suffix = weights.into();
        self.biases_suffix = biases.into();
        self
    }

    /// Insert under an exact key, without any suffix applied.
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<f32>) {
        self.values.insert(key.into(), values);
    }

    pub fn weights(mut self, operation: &str, values: Vec<f32>) -> Self {
        let key = self.key(operation, ParameterKind::Weights);
        self.values.insert(key, values);
        self
    }

    pub fn biases(mut self, operation: &str, values: Vec<f32>) -> Self {
        let key = self.key(operation, ParameterKind::Biases);
        self.values.insert(key, values);
        self
    }

    fn key(&self, operation: &str, kind: ParameterKind) -> String {
        let suffix = match kind {
            ParameterKind::Weights => &self.weights_suffix,
            ParameterKind::Biases => &self.biases_suffix,
        };
        format!("{operation}{suffix}")
    }
}

impl ParameterSource for MemoryParameters {
    fn load_parameters(
        &mut self,
        operation: &str,
        count: usize,
        kind: ParameterKind,
    ) -> Option<Vec<f32>> {
        let key = self.key(operation, kind);
        let values = self.values.get(&key);
        if values.is_none() {
            log::debug!("no parameters stored under `{key}` ({count} {kind} expected)");
        }
        values.cloned()
    }
}

#[derive(Clone, Copy, Debug)]
enum Init {
    Uniform { scale: f32 },
    Normal { mean: f32, std: f32 },
}

/// Seeded random parameters, for trying out a topology before real weights exist.
#[derive(Clone, Debug)]
pub struct RandomParameters {
    rng: StdRng,
    init: Init,
}

impl RandomParameters {
    /// Uniform values in `[-0.1, 0.1)`.
    pub fn new(seed: u64) -> Self {
        Self::uniform(seed, 0.1)
    }

    pub fn uniform(seed: u64, scale: f32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            init: Init::Uniform { scale },
        }
    }

    pub fn normal(seed: u64, mean: f32, std: f32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            init: Init::Normal { mean, std },
        }
    }
}

impl ParameterSource for RandomParameters {
    fn load_parameters(&mut self, _: &str, count: usize, _: ParameterKind) -> Option<Vec<f32>> {
        match self.init {
            Init::Uniform { scale } => {
                let dist = Uniform::new(-scale, scale).ok()?;
                Some(dist.sample_iter(&mut self.rng).take(count).collect())
            }
            Init::Normal { mean, std } => {
                let dist = Normal::new(mean, std).ok()?;
                Some(dist.sample_iter(&mut self.rng).take(count).collect())
            }
        }
    }
}

//! Named parameter sets and batches of posterior draws.

use crate::error::{Result, SimulationError};
use crate::neural::MlpWeights;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A parameter's numeric content: a scalar rate or a network's weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Scalar(f64),
    Network(MlpWeights),
}

impl ParameterValue {
    fn kind(&self) -> &'static str {
        match self {
            ParameterValue::Scalar(_) => "scalar",
            ParameterValue::Network(_) => "network weights",
        }
    }

    fn size(&self) -> usize {
        match self {
            ParameterValue::Scalar(_) => 1,
            ParameterValue::Network(w) => w.num_parameters(),
        }
    }
}

/// A parameter entry. `unit` is a display label only; numerics never read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub value: ParameterValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Parameter {
    pub fn scalar(value: f64) -> Self {
        Self {
            value: ParameterValue::Scalar(value),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }
}

/// Mapping from parameter name to value.
///
/// Sets are values: updating returns a new set, so a set handed to a running
/// simulation is never changed underneath it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: BTreeMap<String, Parameter>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a scalar set from a flat vector in the given parameter order.
    pub fn from_vector(names: &[String], values: &[f64]) -> Result<Self> {
        if names.len() != values.len() {
            return Err(SimulationError::shape(
                "Parameter vector length",
                names.len(),
                values.len(),
            ));
        }
        Ok(names
            .iter()
            .zip(values)
            .fold(Self::new(), |set, (name, &v)| set.with_scalar(name, v)))
    }

    pub fn with(mut self, name: &str, parameter: Parameter) -> Self {
        self.entries.insert(name.to_string(), parameter);
        self
    }

    pub fn with_scalar(self, name: &str, value: f64) -> Self {
        self.with(name, Parameter::scalar(value))
    }

    /// Returns a copy with `name` set to `value`, keeping any existing unit tag.
    pub fn with_value(&self, name: &str, value: ParameterValue) -> Self {
        let mut next = self.clone();
        let unit = next.entries.get(name).and_then(|p| p.unit.clone());
        next.entries
            .insert(name.to_string(), Parameter { value, unit });
        next
    }

    pub fn get(&self, name: &str) -> Result<&Parameter> {
        self.entries
            .get(name)
            .ok_or_else(|| SimulationError::MissingParameter {
                name: name.to_string(),
            })
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        match &self.get(name)?.value {
            ParameterValue::Scalar(v) => Ok(*v),
            ParameterValue::Network(_) => Err(SimulationError::ParameterKind {
                name: name.to_string(),
                expected: "scalar",
            }),
        }
    }

    pub fn network(&self, name: &str) -> Result<&MlpWeights> {
        match &self.get(name)?.value {
            ParameterValue::Network(w) => Ok(w),
            ParameterValue::Scalar(_) => Err(SimulationError::ParameterKind {
                name: name.to_string(),
                expected: "network weights",
            }),
        }
    }

    /// Resolves `names` to scalars, in order.
    pub fn scalars(&self, names: &[String]) -> Result<Vec<f64>> {
        names.iter().map(|name| self.scalar(name)).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Display labels, `"name (unit)"` where a unit tag is present.
    pub fn labels(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(name, p)| match &p.unit {
                Some(unit) => format!("{name} ({unit})"),
                None => name.clone(),
            })
            .collect()
    }

    /// Checks that `other` has the same names, kinds and sizes.
    fn check_layout(&self, other: &ParameterSet) -> Result<()> {
        for name in self.entries.keys().chain(other.entries.keys()) {
            let mine = self.get(name)?;
            let theirs = other.get(name)?;
            if mine.value.kind() != theirs.value.kind() {
                return Err(SimulationError::ParameterKind {
                    name: name.clone(),
                    expected: mine.value.kind(),
                });
            }
            if mine.value.size() != theirs.value.size() {
                return Err(SimulationError::shape(
                    format!("Parameter '{name}' size"),
                    mine.value.size(),
                    theirs.value.size(),
                ));
            }
        }
        Ok(())
    }
}

/// Ordered posterior draws sharing one parameter layout.
///
/// Serialized as a plain array of sets; deserializing checks the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ParameterSet>", into = "Vec<ParameterSet>")]
pub struct PosteriorSampleBatch {
    samples: Vec<ParameterSet>,
}

impl PosteriorSampleBatch {
    pub fn new(samples: Vec<ParameterSet>) -> Result<Self> {
        if let Some((first, rest)) = samples.split_first() {
            for sample in rest {
                first.check_layout(sample)?;
            }
        }
        Ok(Self { samples })
    }

    /// One scalar set per row, columns in `names` order.
    pub fn from_matrix(names: &[String], rows: &[Vec<f64>]) -> Result<Self> {
        let samples = rows
            .iter()
            .map(|row| ParameterSet::from_vector(names, row))
            .collect::<Result<Vec<_>>>()?;
        Self::new(samples)
    }

    pub fn samples(&self) -> &[ParameterSet] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<ParameterSet> {
        self.samples
    }

    /// Element-wise posterior mean. Unit tags come from the first draw.
    pub fn mean(&self) -> Result<ParameterSet> {
        let first = self
            .samples
            .first()
            .ok_or(SimulationError::InsufficientSamples(0))?;

        let mut mean = first.clone();
        for (name, param) in &first.entries {
            let value = match &param.value {
                ParameterValue::Scalar(_) => {
                    let total = self
                        .samples
                        .iter()
                        .map(|s| s.scalar(name))
                        .sum::<Result<f64>>()?;
                    ParameterValue::Scalar(total / self.samples.len() as f64)
                }
                ParameterValue::Network(_) => {
                    let all = self
                        .samples
                        .iter()
                        .map(|s| s.network(name))
                        .collect::<Result<Vec<_>>>()?;
                    let averaged = MlpWeights::average(&all).ok_or_else(|| {
                        SimulationError::shape(format!("Parameter '{name}' size"), 0, 0)
                    })?;
                    ParameterValue::Network(averaged)
                }
            };
            mean = mean.with_value(name, value);
        }
        Ok(mean)
    }
}

impl TryFrom<Vec<ParameterSet>> for PosteriorSampleBatch {
    type Error = SimulationError;

    fn try_from(samples: Vec<ParameterSet>) -> Result<Self> {
        Self::new(samples)
    }
}

impl From<PosteriorSampleBatch> for Vec<ParameterSet> {
    fn from(batch: PosteriorSampleBatch) -> Self {
        batch.into_samples()
    }
}

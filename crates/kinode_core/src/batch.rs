//! Batched simulation over declared axes.
//!
//! Each input (initial conditions, parameters, times) is either a single
//! value shared by every batch element or a list mapped onto a batch group.
//! Inputs mapped onto the same group are zipped and must have equal length.
//! Distinct groups combine as an outer product, with group 0 outermost.
//!
//! ```text
//! ics: Mapped(0), params: Shared,    times: Shared    -> shape [n_ics]
//! ics: Mapped(0), params: Mapped(0), times: Shared    -> shape [n]       (zip)
//! ics: Mapped(0), params: Mapped(1), times: Shared    -> shape [n_ics, n_params]
//! ```

use crate::error::{Result, SimulationError};
use crate::integrator::{integrate, validate_times, IntegratorSettings, Trajectory};
use crate::parameters::ParameterSet;
use crate::system::OdeSystem;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single value or a list of values for one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Batch<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        match self {
            Batch::One(_) => 1,
            Batch::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_map<U>(&self, f: impl Fn(&T) -> Result<U>) -> Result<Batch<U>> {
        Ok(match self {
            Batch::One(item) => Batch::One(f(item)?),
            Batch::Many(items) => Batch::Many(items.iter().map(f).collect::<Result<_>>()?),
        })
    }

    fn items(&self) -> &[T] {
        match self {
            Batch::One(item) => std::slice::from_ref(item),
            Batch::Many(items) => items,
        }
    }

    fn select(&self, index: usize) -> &T {
        match self {
            Batch::One(item) => item,
            Batch::Many(items) => &items[index],
        }
    }
}

/// How one input participates in the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    /// A single value broadcast to every batch element.
    #[default]
    Shared,
    /// A leading batch axis belonging to the given group.
    Mapped(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchAxes {
    pub initial_conditions: Axis,
    pub parameters: Axis,
    pub times: Axis,
}

impl BatchAxes {
    /// No batching: every input is a single value.
    pub fn single() -> Self {
        Self::default()
    }

    pub fn map_initial_conditions(mut self, group: usize) -> Self {
        self.initial_conditions = Axis::Mapped(group);
        self
    }

    pub fn map_parameters(mut self, group: usize) -> Self {
        self.parameters = Axis::Mapped(group);
        self
    }

    pub fn map_times(mut self, group: usize) -> Self {
        self.times = Axis::Mapped(group);
        self
    }
}

/// Trajectories laid out row-major over the batch `shape`.
/// Single-instance runs have an empty shape and exactly one trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTrajectories {
    pub shape: Vec<usize>,
    pub trajectories: Vec<Trajectory>,
}

impl BatchTrajectories {
    pub fn get(&self, index: &[usize]) -> Option<&Trajectory> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0;
        for (&i, &n) in index.iter().zip(&self.shape) {
            if i >= n {
                return None;
            }
            flat = flat * n + i;
        }
        self.trajectories.get(flat)
    }

    /// The trajectory of an unbatched run.
    pub fn single(&self) -> Option<&Trajectory> {
        if self.shape.is_empty() {
            self.trajectories.first()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }
}

/// Checks the declared axis against the supplied input and records its group length.
fn register<T>(
    name: &str,
    axis: Axis,
    input: &Batch<T>,
    groups: &mut BTreeMap<usize, usize>,
) -> Result<()> {
    match (axis, input) {
        (Axis::Shared, Batch::One(_)) => Ok(()),
        (Axis::Shared, Batch::Many(items)) => Err(SimulationError::shape(
            format!("{name} declared shared; batch length"),
            1,
            items.len(),
        )),
        (Axis::Mapped(_), Batch::One(_)) => Err(SimulationError::shape(
            format!("{name} declared batched; batch dimensions"),
            1,
            0,
        )),
        (Axis::Mapped(group), Batch::Many(items)) => match groups.get(&group) {
            Some(&len) if len != items.len() => Err(SimulationError::shape(
                format!("Batch group {group} length for {name}"),
                len,
                items.len(),
            )),
            _ => {
                groups.insert(group, items.len());
                Ok(())
            }
        },
    }
}

fn position(axis: Axis, groups: &[usize], multi: &[usize]) -> usize {
    match axis {
        Axis::Shared => 0,
        Axis::Mapped(group) => groups
            .iter()
            .position(|&g| g == group)
            .map(|slot| multi[slot])
            .unwrap_or(0),
    }
}

/// Simulates every batch element declared by `axes`.
///
/// Batch elements are independent. The first failing element fails the
/// whole batch; its index is logged before the error is returned.
pub fn simulate(
    system: &OdeSystem,
    initial_conditions: &Batch<Vec<f64>>,
    parameters: &Batch<ParameterSet>,
    times: &Batch<Vec<f64>>,
    dt0: f64,
    axes: &BatchAxes,
    settings: &IntegratorSettings,
) -> Result<BatchTrajectories> {
    settings.validate()?;

    let mut groups = BTreeMap::new();
    register("Initial conditions", axes.initial_conditions, initial_conditions, &mut groups)?;
    register("Parameters", axes.parameters, parameters, &mut groups)?;
    register("Times", axes.times, times, &mut groups)?;

    for ts in times.items() {
        validate_times(ts, settings.t0)?;
    }
    let dim = system.dimension();
    for y0 in initial_conditions.items() {
        if y0.len() != dim {
            return Err(SimulationError::shape("Initial state dimension", dim, y0.len()));
        }
    }

    let group_ids: Vec<usize> = groups.keys().copied().collect();
    let shape: Vec<usize> = groups.values().copied().collect();
    let total: usize = shape.iter().product();
    debug!("simulating {total} batch element(s) with shape {shape:?}");

    let mut multi = vec![0usize; shape.len()];
    let mut trajectories = Vec::with_capacity(total);
    for flat in 0..total {
        let mut rem = flat;
        for slot in (0..shape.len()).rev() {
            multi[slot] = rem % shape[slot];
            rem /= shape[slot];
        }

        let y0 = initial_conditions.select(position(axes.initial_conditions, &group_ids, &multi));
        let params = parameters.select(position(axes.parameters, &group_ids, &multi));
        let ts = times.select(position(axes.times, &group_ids, &multi));

        let trajectory = system
            .bind(params)
            .and_then(|bound| integrate(&bound, y0, ts, dt0, settings))
            .inspect_err(|err| warn!("batch element {multi:?} failed: {err}"))?;
        trajectories.push(trajectory);
    }

    Ok(BatchTrajectories {
        shape,
        trajectories,
    })
}

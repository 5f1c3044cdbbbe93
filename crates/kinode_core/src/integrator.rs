//! Adaptive single-instance integration onto a requested time grid.

use crate::error::{Result, SimulationError};
use crate::solvers::Solver;
use crate::traits::{DynamicalSystem, Steppable};
use log::debug;
use serde::{Deserialize, Serialize};

/// Settings controlling the adaptive step-size controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub solver: Solver,
    pub rtol: f64,
    pub atol: f64,
    /// Time at which the initial condition holds.
    pub t0: f64,
    /// Budget of attempted steps (accepted and rejected) per integration.
    pub max_steps: usize,
    pub safety: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            solver: Solver::Tsit5,
            rtol: 1e-3,
            atol: 1e-6,
            t0: 0.0,
            max_steps: 4096,
            safety: 0.9,
            min_factor: 0.2,
            max_factor: 10.0,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.rtol.is_finite() && self.rtol > 0.0) {
            return Err(invalid("rtol must be finite and positive"));
        }
        if !(self.atol.is_finite() && self.atol > 0.0) {
            return Err(invalid("atol must be finite and positive"));
        }
        if !self.t0.is_finite() {
            return Err(invalid("t0 must be finite"));
        }
        if self.max_steps == 0 {
            return Err(invalid("max_steps must be greater than zero"));
        }
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(invalid("safety must lie in (0, 1]"));
        }
        if !(self.min_factor > 0.0 && self.min_factor < 1.0 && self.max_factor > 1.0) {
            return Err(invalid("step factors must satisfy 0 < min_factor < 1 < max_factor"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> SimulationError {
    SimulationError::InvalidSettings(message.to_string())
}

/// States aligned 1:1 with their evaluation times, in species order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Values of one species across time.
    pub fn species_series(&self, index: usize) -> Option<Vec<f64>> {
        self.states.iter().map(|s| s.get(index).copied()).collect()
    }
}

/// Checks that `times` is non-empty, finite, strictly increasing and not before `t0`.
pub fn validate_times(times: &[f64], t0: f64) -> Result<()> {
    let first = times
        .first()
        .ok_or_else(|| SimulationError::InvalidTimeSequence("time sequence is empty".to_string()))?;
    if let Some(i) = times.iter().position(|t| !t.is_finite()) {
        return Err(SimulationError::InvalidTimeSequence(format!(
            "time at index {i} is not finite"
        )));
    }
    if *first < t0 {
        return Err(SimulationError::InvalidTimeSequence(format!(
            "first time {first} precedes the initial time {t0}"
        )));
    }
    if let Some(i) = times.windows(2).position(|w| w[1] <= w[0]) {
        return Err(SimulationError::InvalidTimeSequence(format!(
            "times are not strictly increasing at index {} ({} -> {})",
            i + 1,
            times[i],
            times[i + 1]
        )));
    }
    Ok(())
}

/// Integrates `system` from `settings.t0` and reports the state at each of `times`.
///
/// `dt0` is the initial step-size hint; the controller adapts from there.
/// Steps run freely up to the last requested time. A requested time inside
/// an accepted step is filled by a shorter step from that step's start, so
/// it neither counts against `max_steps` nor changes the step sequence.
pub fn integrate(
    system: &impl DynamicalSystem,
    initial_state: &[f64],
    times: &[f64],
    dt0: f64,
    settings: &IntegratorSettings,
) -> Result<Trajectory> {
    settings.validate()?;
    validate_times(times, settings.t0)?;
    if !(dt0.is_finite() && dt0 > 0.0) {
        return Err(invalid("initial step size must be finite and positive"));
    }
    let dim = system.dimension();
    if initial_state.len() != dim {
        return Err(SimulationError::shape(
            "Initial state dimension",
            dim,
            initial_state.len(),
        ));
    }

    let mut stepper = settings.solver.build(dim);
    let exponent = 1.0 / (stepper.error_order() as f64 + 1.0);

    let mut t = settings.t0;
    let mut h = dt0;
    let mut state = initial_state.to_vec();
    let mut next = vec![0.0; dim];
    let mut error = vec![0.0; dim];
    let mut scratch = vec![0.0; dim];
    let mut attempts = 0usize;
    let mut states = Vec::with_capacity(times.len());

    // times equal to t0 report the initial state
    let mut pending = times.iter().take_while(|&&target| target <= t).count();
    states.resize(pending, state.clone());
    let t_end = times[times.len() - 1];

    while pending < times.len() {
        if attempts >= settings.max_steps {
            return Err(SimulationError::IntegrationDiverged {
                t,
                steps: attempts,
                reason: format!("step budget of {} exhausted", settings.max_steps),
            });
        }
        attempts += 1;

        let remaining = t_end - t;
        let last = h >= remaining;
        let dt = if last { remaining } else { h };

        stepper.attempt(system, t, &state, dt, &mut next, &mut error)?;
        let norm = error_norm(&state, &next, &error, settings.rtol, settings.atol);
        if !norm.is_finite() || next.iter().any(|v| !v.is_finite()) {
            return Err(SimulationError::IntegrationDiverged {
                t,
                steps: attempts,
                reason: "state or error estimate is not finite".to_string(),
            });
        }

        let factor = if norm == 0.0 {
            settings.max_factor
        } else {
            (settings.safety * norm.powf(-exponent))
                .clamp(settings.min_factor, settings.max_factor)
        };

        if norm <= 1.0 {
            let t_next = if last { t_end } else { t + dt };
            while pending < times.len() && times[pending] <= t_next {
                let target = times[pending];
                if target < t_next {
                    // a shorter step from the accepted start point; it does
                    // not advance the solution
                    let mut out = vec![0.0; dim];
                    stepper.attempt(system, t, &state, target - t, &mut out, &mut scratch)?;
                    if out.iter().any(|v| !v.is_finite()) {
                        return Err(SimulationError::IntegrationDiverged {
                            t: target,
                            steps: attempts,
                            reason: "state is not finite".to_string(),
                        });
                    }
                    states.push(out);
                } else {
                    states.push(next.clone());
                }
                pending += 1;
            }
            t = t_next;
            state.copy_from_slice(&next);
            h = dt * factor;
        } else {
            debug!("rejected step at t = {t}, dt = {dt}, error norm = {norm}");
            h = dt * factor.min(1.0);
            if h <= 4.0 * f64::EPSILON * t.abs().max(1.0) {
                return Err(SimulationError::IntegrationDiverged {
                    t,
                    steps: attempts,
                    reason: format!("step size underflow (dt = {h})"),
                });
            }
        }
    }

    Ok(Trajectory {
        times: times.to_vec(),
        states,
    })
}

/// RMS of the error scaled by `atol + rtol * max(|y|, |y_next|)`.
fn error_norm(state: &[f64], next: &[f64], error: &[f64], rtol: f64, atol: f64) -> f64 {
    if error.is_empty() {
        return 0.0;
    }
    let sum: f64 = state
        .iter()
        .zip(next)
        .zip(error)
        .map(|((y, yn), e)| {
            let scale = atol + rtol * y.abs().max(yn.abs());
            (e / scale).powi(2)
        })
        .sum();
    (sum / error.len() as f64).sqrt()
}

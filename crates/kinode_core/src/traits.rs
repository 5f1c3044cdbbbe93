use crate::error::Result;

/// A right-hand side `dx/dt = f(t, x)` with its parameters already resolved.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt into, same length as `x`
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<()>;
}

/// A solver that can attempt one step and report a local error estimate.
pub trait Steppable {
    /// Order of the embedded (lower-order) solution, used by the step-size controller.
    fn error_order(&self) -> u32;

    /// Attempts one step of size dt from (t, state) without committing it.
    /// next: buffer receiving the proposed state at t + dt
    /// error: buffer receiving the per-component local error estimate
    fn attempt(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        next: &mut [f64],
        error: &mut [f64],
    ) -> Result<()>;
}

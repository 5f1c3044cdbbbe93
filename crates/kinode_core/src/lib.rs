//! The `kinode_core` crate is the numerical engine behind kinode: reaction
//! kinetics and neural ODEs integrated in batches, with posterior
//! credibility bands built on top.
//!
//! Key components:
//! - **System**: `OdeSystem` with a closed-form, closure or neural right-hand side.
//! - **Equation Engine**: expression trees compiled to a small bytecode VM.
//! - **Solvers**: embedded Runge-Kutta pairs (Tsit5, Dopri5, Bosh3).
//! - **Integrator / Batch**: adaptive stepping and batched simulation over mapped axes.
//! - **Credibility**: HPDI bands over posterior simulations.
pub mod batch;
pub mod credibility;
pub mod equation_engine;
pub mod error;
pub mod integrator;
pub mod neural;
pub mod parameters;
pub mod solvers;
pub mod system;
pub mod traits;

pub use error::{Result, SimulationError};

use thiserror::Error;

/// Errors raised while evaluating, integrating or aggregating simulations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("Parameter '{name}' is required but missing from the parameter set.")]
    MissingParameter { name: String },

    #[error("Parameter '{name}' has the wrong kind: expected {expected}.")]
    ParameterKind { name: String, expected: &'static str },

    #[error("{context} mismatch. Expected {expected}, got {found}.")]
    ShapeMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid time sequence: {0}")]
    InvalidTimeSequence(String),

    #[error("Integration diverged at t = {t} after {steps} steps: {reason}")]
    IntegrationDiverged {
        t: f64,
        steps: usize,
        reason: String,
    },

    #[error("Coverage must lie in (0, 1], got {0}.")]
    InvalidCoverage(f64),

    #[error("At least 2 posterior samples are required, got {0}.")]
    InsufficientSamples(usize),

    #[error("Initial condition is missing species '{0}'.")]
    MissingSpecies(String),

    #[error("Initial condition names unknown species '{0}'.")]
    UnknownSpecies(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Expression bytecode left the evaluation stack unbalanced.")]
    MalformedExpression,
}

impl SimulationError {
    pub(crate) fn shape(context: impl Into<String>, expected: usize, found: usize) -> Self {
        SimulationError::ShapeMismatch {
            context: context.into(),
            expected,
            found,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimulationError>;

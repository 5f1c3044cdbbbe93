//! ODE systems: ordered species plus a closed-form or learned right-hand side.

use crate::equation_engine::{EquationSystem, Expr};
use crate::error::{Result, SimulationError};
use crate::neural::{MlpWeights, NeuralDerivative};
use crate::parameters::ParameterSet;
use crate::traits::DynamicalSystem;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Species name to initial value, as handed over by the definition layer.
pub type InitialCondition = BTreeMap<String, f64>;

/// Closed-form right-hand side supplied as Rust code.
pub type DerivativeFn = dyn Fn(f64, &[f64], &ParameterSet) -> Result<Vec<f64>> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Species {
    pub name: String,
    pub observable: bool,
}

impl Species {
    pub fn observable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            observable: true,
        }
    }

    pub fn latent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            observable: false,
        }
    }
}

/// How `dx/dt` is produced. Chosen once, at construction.
#[derive(Clone)]
pub enum Derivative {
    Expressions(EquationSystem),
    Function(Arc<DerivativeFn>),
    Neural(NeuralDerivative),
}

impl fmt::Debug for Derivative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Derivative::Expressions(eqs) => f.debug_tuple("Expressions").field(eqs).finish(),
            Derivative::Function(_) => f.write_str("Function(..)"),
            Derivative::Neural(net) => f.debug_tuple("Neural").field(net).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OdeSystem {
    species: Vec<Species>,
    derivative: Derivative,
}

impl OdeSystem {
    /// Compiles one expression per species, in species order.
    pub fn from_expressions(species: Vec<Species>, expressions: &[Expr]) -> Result<Self> {
        let names: Vec<String> = species.iter().map(|s| s.name.clone()).collect();
        let equations = EquationSystem::compile(&names, expressions)?;
        Ok(Self {
            species,
            derivative: Derivative::Expressions(equations),
        })
    }

    pub fn from_fn<F>(species: Vec<Species>, f: F) -> Self
    where
        F: Fn(f64, &[f64], &ParameterSet) -> Result<Vec<f64>> + Send + Sync + 'static,
    {
        Self {
            species,
            derivative: Derivative::Function(Arc::new(f)),
        }
    }

    pub fn neural(species: Vec<Species>, network: NeuralDerivative) -> Result<Self> {
        if network.data_size != species.len() {
            return Err(SimulationError::shape(
                "Network data size",
                species.len(),
                network.data_size,
            ));
        }
        Ok(Self {
            species,
            derivative: Derivative::Neural(network),
        })
    }

    pub fn dimension(&self) -> usize {
        self.species.len()
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn species_names(&self) -> Vec<String> {
        self.species.iter().map(|s| s.name.clone()).collect()
    }

    pub fn observable_indices(&self) -> Vec<usize> {
        self.species
            .iter()
            .enumerate()
            .filter(|(_, s)| s.observable)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn derivative(&self) -> &Derivative {
        &self.derivative
    }

    /// Parameter names the right-hand side is known to read.
    /// Rust closures declare nothing; they fail at evaluation instead.
    pub fn required_parameters(&self) -> Vec<String> {
        match &self.derivative {
            Derivative::Expressions(eqs) => eqs.param_names.clone(),
            Derivative::Function(_) => Vec::new(),
            Derivative::Neural(net) => vec![net.weights_key.clone()],
        }
    }

    /// Orders a labeled initial condition by species.
    pub fn assemble_state(&self, initial: &InitialCondition) -> Result<Vec<f64>> {
        if let Some(unknown) = initial
            .keys()
            .find(|name| !self.species.iter().any(|s| &s.name == *name))
        {
            return Err(SimulationError::UnknownSpecies(unknown.clone()));
        }
        self.species
            .iter()
            .map(|s| {
                initial
                    .get(&s.name)
                    .copied()
                    .ok_or_else(|| SimulationError::MissingSpecies(s.name.clone()))
            })
            .collect()
    }

    /// Resolves `params` into an evaluation context. Fails with
    /// `MissingParameter` before any evaluation if an entry is absent.
    pub fn bind<'a>(&'a self, params: &'a ParameterSet) -> Result<BoundSystem<'a>> {
        let rhs = match &self.derivative {
            Derivative::Expressions(eqs) => BoundRhs::Expressions {
                equations: eqs,
                values: params.scalars(&eqs.param_names)?,
                stack: RefCell::new(Vec::with_capacity(64)),
            },
            Derivative::Function(f) => BoundRhs::Function {
                f: f.as_ref(),
                params,
            },
            Derivative::Neural(net) => BoundRhs::Neural {
                network: net,
                weights: net.resolve(params)?,
            },
        };
        Ok(BoundSystem {
            dim: self.dimension(),
            rhs,
        })
    }

    /// `dx/dt` at (t, state) under `params`.
    pub fn evaluate(&self, t: f64, state: &[f64], params: &ParameterSet) -> Result<Vec<f64>> {
        let bound = self.bind(params)?;
        let mut out = vec![0.0; self.dimension()];
        bound.apply(t, state, &mut out)?;
        Ok(out)
    }
}

enum BoundRhs<'a> {
    Expressions {
        equations: &'a EquationSystem,
        values: Vec<f64>,
        // Interior mutability for the VM stack to avoid allocation in apply.
        stack: RefCell<Vec<f64>>,
    },
    Function {
        f: &'a DerivativeFn,
        params: &'a ParameterSet,
    },
    Neural {
        network: &'a NeuralDerivative,
        weights: &'a MlpWeights,
    },
}

/// An [`OdeSystem`] with its parameters resolved, ready for a solver.
pub struct BoundSystem<'a> {
    dim: usize,
    rhs: BoundRhs<'a>,
}

impl DynamicalSystem for BoundSystem<'_> {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<()> {
        if x.len() != self.dim {
            return Err(SimulationError::shape("State dimension", self.dim, x.len()));
        }
        match &self.rhs {
            BoundRhs::Expressions {
                equations,
                values,
                stack,
            } => equations.apply(t, x, values, &mut stack.borrow_mut(), out),
            BoundRhs::Function { f, params } => {
                let dx = f(t, x, *params)?;
                if dx.len() != self.dim {
                    return Err(SimulationError::shape(
                        "Derivative output length",
                        self.dim,
                        dx.len(),
                    ));
                }
                out.copy_from_slice(&dx);
                Ok(())
            }
            BoundRhs::Neural { network, weights } => network.apply(weights, x, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::Function;

    fn michaelis_menten() -> OdeSystem {
        OdeSystem::from_expressions(
            vec![Species::observable("s1")],
            &[Expr::div(
                Expr::neg(Expr::mul(Expr::sym("v_max"), Expr::sym("s1"))),
                Expr::add(Expr::sym("K_m"), Expr::sym("s1")),
            )],
        )
        .expect("system")
    }

    #[test]
    fn evaluate_closed_form_is_repeatable_with_new_parameters() {
        let system = michaelis_menten();
        assert_eq!(system.required_parameters(), vec!["v_max", "K_m"]);

        let p1 = ParameterSet::new().with_scalar("v_max", 7.0).with_scalar("K_m", 100.0);
        let p2 = ParameterSet::new().with_scalar("v_max", 14.0).with_scalar("K_m", 100.0);

        let d1 = system.evaluate(0.0, &[300.0], &p1).expect("evaluate");
        let d2 = system.evaluate(0.0, &[300.0], &p2).expect("evaluate");
        let d1_again = system.evaluate(0.0, &[300.0], &p1).expect("evaluate");

        assert!((d1[0] + 5.25).abs() < 1e-12);
        assert!((d2[0] + 10.5).abs() < 1e-12);
        assert_eq!(d1, d1_again);
    }

    #[test]
    fn evaluate_reports_missing_parameter() {
        let system = michaelis_menten();
        let params = ParameterSet::new().with_scalar("v_max", 7.0);
        assert_eq!(
            system.evaluate(0.0, &[1.0], &params),
            Err(SimulationError::MissingParameter {
                name: "K_m".to_string()
            })
        );
    }

    #[test]
    fn function_derivative_with_wrong_length_is_shape_mismatch() {
        let system = OdeSystem::from_fn(
            vec![Species::observable("x"), Species::observable("y")],
            |_t, x, _p| Ok(vec![x[0]]),
        );
        let err = system
            .evaluate(0.0, &[1.0, 2.0], &ParameterSet::new())
            .expect_err("expected shape mismatch");
        assert!(matches!(
            err,
            SimulationError::ShapeMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }

    #[test]
    fn function_derivative_reads_parameters_by_name() {
        let system = OdeSystem::from_fn(vec![Species::observable("x")], |_t, x, p| {
            Ok(vec![-p.scalar("k")? * x[0]])
        });
        let dx = system
            .evaluate(0.0, &[2.0], &ParameterSet::new().with_scalar("k", 0.5))
            .expect("evaluate");
        assert_eq!(dx, vec![-1.0]);

        assert!(matches!(
            system.evaluate(0.0, &[2.0], &ParameterSet::new()),
            Err(SimulationError::MissingParameter { .. })
        ));
    }

    #[test]
    fn evaluate_rejects_wrong_state_length() {
        let system = michaelis_menten();
        let params = ParameterSet::new().with_scalar("v_max", 7.0).with_scalar("K_m", 100.0);
        assert!(matches!(
            system.evaluate(0.0, &[1.0, 2.0], &params),
            Err(SimulationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn time_dependent_expression_receives_time() {
        let system = OdeSystem::from_expressions(
            vec![Species::observable("x")],
            &[Expr::call(Function::Cos, Expr::sym("t"))],
        )
        .expect("system");
        let dx = system
            .evaluate(std::f64::consts::PI, &[0.0], &ParameterSet::new())
            .expect("evaluate");
        assert!((dx[0] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn neural_rejects_mismatched_network_size() {
        let net = NeuralDerivative::new(3, 4, 1).expect("network");
        assert!(matches!(
            OdeSystem::neural(vec![Species::observable("x")], net),
            Err(SimulationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn assemble_state_orders_by_species() {
        let system = OdeSystem::from_fn(
            vec![Species::observable("b"), Species::latent("a")],
            |_t, x, _p| Ok(x.to_vec()),
        );
        assert_eq!(system.observable_indices(), vec![0]);

        let ic: InitialCondition = [("a".to_string(), 1.0), ("b".to_string(), 2.0)]
            .into_iter()
            .collect();
        assert_eq!(system.assemble_state(&ic), Ok(vec![2.0, 1.0]));

        let missing: InitialCondition = [("b".to_string(), 2.0)].into_iter().collect();
        assert_eq!(
            system.assemble_state(&missing),
            Err(SimulationError::MissingSpecies("a".to_string()))
        );

        let unknown: InitialCondition = [
            ("a".to_string(), 1.0),
            ("b".to_string(), 2.0),
            ("c".to_string(), 3.0),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            system.assemble_state(&unknown),
            Err(SimulationError::UnknownSpecies("c".to_string()))
        );
    }

    #[test]
    fn labeled_initial_condition_round_trips_as_json_object() {
        let ic: InitialCondition = [("s1".to_string(), 300.0)].into_iter().collect();
        let json = serde_json::to_string(&ic).expect("serialize");
        assert_eq!(json, r#"{"s1":300.0}"#);
        let back: InitialCondition = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, ic);
    }
}

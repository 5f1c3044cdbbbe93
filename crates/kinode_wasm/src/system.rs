//! Core WASM model wrapper and batched simulation.

use anyhow::{bail, Context};
use kinode_core::batch::{simulate, Batch, BatchAxes, BatchTrajectories};
use kinode_core::equation_engine::Expr;
use kinode_core::integrator::IntegratorSettings;
use kinode_core::parameters::ParameterSet;
use kinode_core::system::{InitialCondition, OdeSystem, Species};
use serde::Deserialize;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

/// Model definition as sent from JS: one expression per species, in order.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ModelDefinition {
    pub species: Vec<Species>,
    pub expressions: Vec<Expr>,
}

#[wasm_bindgen]
pub struct WasmModel {
    pub(crate) system: OdeSystem,
    pub(crate) settings: IntegratorSettings,
}

pub(crate) fn js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{err:#}"))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(value: JsValue, what: &str) -> Result<T, JsValue> {
    from_value(value).map_err(|e| JsValue::from_str(&format!("Invalid {what}: {e}")))
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<JsValue, JsValue> {
    to_value(value).map_err(|e| JsValue::from_str(&format!("Serialization error: {e}")))
}

pub(crate) fn build_model(definition: ModelDefinition) -> anyhow::Result<OdeSystem> {
    if definition.species.is_empty() {
        bail!("Model has no species.");
    }
    OdeSystem::from_expressions(definition.species, &definition.expressions)
        .context("Failed to compile model")
}

/// Batched simulation from labeled initial conditions.
pub(crate) fn run_simulation(
    system: &OdeSystem,
    settings: &IntegratorSettings,
    initial_conditions: &Batch<InitialCondition>,
    parameters: &Batch<ParameterSet>,
    times: &Batch<Vec<f64>>,
    dt0: f64,
    axes: &BatchAxes,
) -> anyhow::Result<BatchTrajectories> {
    let states = initial_conditions
        .try_map(|ic| system.assemble_state(ic))
        .context("Invalid initial condition")?;
    simulate(system, &states, parameters, times, dt0, axes, settings).context("Simulation failed")
}

#[wasm_bindgen]
impl WasmModel {
    #[wasm_bindgen(constructor)]
    pub fn new(definition: JsValue) -> Result<WasmModel, JsValue> {
        console_error_panic_hook::set_once();

        let definition: ModelDefinition = decode(definition, "model definition")?;
        let system = build_model(definition).map_err(js_error)?;
        Ok(WasmModel {
            system,
            settings: IntegratorSettings::default(),
        })
    }

    pub fn set_settings(&mut self, settings: JsValue) -> Result<(), JsValue> {
        let settings: IntegratorSettings = decode(settings, "integrator settings")?;
        settings
            .validate()
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        self.settings = settings;
        Ok(())
    }

    pub fn species_names(&self) -> js_sys::Array {
        self.system
            .species_names()
            .into_iter()
            .map(JsValue::from)
            .collect()
    }

    pub fn required_parameters(&self) -> js_sys::Array {
        self.system
            .required_parameters()
            .into_iter()
            .map(JsValue::from)
            .collect()
    }

    pub fn observable_indices(&self) -> Vec<u32> {
        self.system
            .observable_indices()
            .into_iter()
            .map(|i| i as u32)
            .collect()
    }

    /// Each input is `{ "One": value }` or `{ "Many": [values] }`; `axes`
    /// declares which inputs are mapped and how they combine.
    pub fn simulate(
        &self,
        initial_conditions: JsValue,
        parameters: JsValue,
        times: JsValue,
        dt0: f64,
        axes: JsValue,
    ) -> Result<JsValue, JsValue> {
        let initial_conditions: Batch<InitialCondition> =
            decode(initial_conditions, "initial conditions")?;
        let parameters: Batch<ParameterSet> = decode(parameters, "parameters")?;
        let times: Batch<Vec<f64>> = decode(times, "times")?;
        let axes: BatchAxes = if axes.is_undefined() || axes.is_null() {
            BatchAxes::single()
        } else {
            decode(axes, "batch axes")?
        };
        let result = run_simulation(
            &self.system,
            &self.settings,
            &initial_conditions,
            &parameters,
            &times,
            dt0,
            &axes,
        )
        .map_err(js_error)?;
        encode(&result)
    }
}

//! Posterior credibility bands exposed to JS.

use crate::system::{decode, encode, js_error, WasmModel};
use anyhow::{ensure, Context};
use kinode_core::credibility::{credibility_interval, CredibilityReport};
use kinode_core::integrator::IntegratorSettings;
use kinode_core::parameters::{ParameterSet, PosteriorSampleBatch};
use kinode_core::system::{InitialCondition, OdeSystem};
use wasm_bindgen::prelude::*;

pub(crate) fn run_credibility(
    system: &OdeSystem,
    settings: &IntegratorSettings,
    initial: &InitialCondition,
    samples: Vec<ParameterSet>,
    times: &[f64],
    dt0: f64,
    coverage: f64,
) -> anyhow::Result<CredibilityReport> {
    ensure!(!samples.is_empty(), "Posterior has no samples.");
    let state = system
        .assemble_state(initial)
        .context("Invalid initial condition")?;
    let posterior =
        PosteriorSampleBatch::new(samples).context("Posterior samples are inconsistent")?;
    credibility_interval(system, &posterior, &state, times, dt0, coverage, settings)
        .context("Credibility band failed")
}

#[wasm_bindgen]
impl WasmModel {
    /// `samples` is an array of parameter sets, one per posterior draw.
    pub fn credibility_band(
        &self,
        initial: JsValue,
        samples: JsValue,
        times: Vec<f64>,
        dt0: f64,
        coverage: f64,
    ) -> Result<JsValue, JsValue> {
        let initial: InitialCondition = decode(initial, "initial condition")?;
        let samples: Vec<ParameterSet> = decode(samples, "posterior samples")?;
        let report = run_credibility(
            &self.system,
            &self.settings,
            &initial,
            samples,
            &times,
            dt0,
            coverage,
        )
        .map_err(js_error)?;
        encode(&report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinode_core::equation_engine::Expr;
    use kinode_core::system::Species;

    fn growth_model() -> OdeSystem {
        OdeSystem::from_expressions(
            vec![Species::observable("n")],
            &[Expr::mul(Expr::sym("r"), Expr::sym("n"))],
        )
        .expect("model")
    }

    fn draws(rates: &[f64]) -> Vec<ParameterSet> {
        rates
            .iter()
            .map(|&r| ParameterSet::new().with_scalar("r", r))
            .collect()
    }

    #[test]
    fn run_credibility_builds_band_and_central_run() {
        let system = growth_model();
        let initial = InitialCondition::from([("n".to_string(), 1.0)]);
        let rates: Vec<f64> = (0..20).map(|i| 0.1 + 0.01 * i as f64).collect();

        let report = run_credibility(
            &system,
            &IntegratorSettings::default(),
            &initial,
            draws(&rates),
            &[1.0, 2.0],
            0.1,
            0.8,
        )
        .expect("report");

        let band = report.band.species(0).expect("band");
        assert_eq!(band.lower.len(), 2);
        assert!(band.lower[1] < band.upper[1]);
        assert!(band.lower[1] >= (2.0 * 0.1_f64).exp() * 0.99);
        assert!(band.upper[1] <= (2.0 * 0.29_f64).exp() * 1.01);
        assert_eq!(report.central.len(), 2);
    }

    #[test]
    fn run_credibility_rejects_bad_posteriors() {
        let system = growth_model();
        let initial = InitialCondition::from([("n".to_string(), 1.0)]);
        let settings = IntegratorSettings::default();

        let err = run_credibility(&system, &settings, &initial, Vec::new(), &[1.0], 0.1, 0.9)
            .expect_err("empty posterior");
        assert!(err.to_string().contains("no samples"));

        let err = run_credibility(&system, &settings, &initial, draws(&[0.1, 0.2]), &[1.0], 0.1, 2.0)
            .expect_err("bad coverage");
        assert!(format!("{err:#}").contains("Credibility band failed"));
    }
}

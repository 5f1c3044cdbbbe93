//! Highest-density credibility bands over posterior simulations.

use crate::batch::{simulate, Batch, BatchAxes};
use crate::error::{Result, SimulationError};
use crate::integrator::{IntegratorSettings, Trajectory};
use crate::parameters::PosteriorSampleBatch;
use crate::system::OdeSystem;
use serde::{Deserialize, Serialize};

/// Per time point and species: HPDI bounds, the raw sample mean and a
/// representative value. Indexed `[time][species]`, like [`Trajectory::states`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredibilityBand {
    pub coverage: f64,
    pub times: Vec<f64>,
    /// Sample mean of each cell. Skewed cells can put it outside the band.
    pub mean: Vec<Vec<f64>>,
    /// The sample mean clamped into `[lower, upper]`.
    pub representative: Vec<Vec<f64>>,
    pub lower: Vec<Vec<f64>>,
    pub upper: Vec<Vec<f64>>,
}

/// One species' series, ready for plotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesBand {
    pub mean: Vec<f64>,
    pub representative: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl CredibilityBand {
    pub fn species(&self, index: usize) -> Option<SpeciesBand> {
        let column = |rows: &[Vec<f64>]| -> Option<Vec<f64>> {
            rows.iter().map(|row| row.get(index).copied()).collect()
        };
        Some(SpeciesBand {
            mean: column(&self.mean)?,
            representative: column(&self.representative)?,
            lower: column(&self.lower)?,
            upper: column(&self.upper)?,
        })
    }
}

/// The HPDI band together with the central trajectory simulated from the
/// posterior-mean parameters. The central trajectory is an independent
/// simulation and may leave the band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredibilityReport {
    pub band: CredibilityBand,
    pub central: Trajectory,
}

fn check_coverage(coverage: f64) -> Result<()> {
    if coverage > 0.0 && coverage <= 1.0 {
        Ok(())
    } else {
        Err(SimulationError::InvalidCoverage(coverage))
    }
}

fn check_sample_count(n: usize) -> Result<()> {
    if n < 2 {
        Err(SimulationError::InsufficientSamples(n))
    } else {
        Ok(())
    }
}

/// Number of sorted samples a window must span to hold `coverage` of `n`.
fn window_size(coverage: f64, n: usize) -> usize {
    // guard against 0.9 * 1000 landing a hair above 900
    let raw = (coverage * n as f64 - 1e-9).ceil();
    (raw as usize).clamp(1, n)
}

/// Narrowest window over already sorted samples; ties go to the lowest index.
fn narrowest_window(sorted: &[f64], window: usize) -> (f64, f64) {
    let mut best = 0;
    let mut best_width = f64::INFINITY;
    for start in 0..=(sorted.len() - window) {
        let width = sorted[start + window - 1] - sorted[start];
        if width < best_width {
            best_width = width;
            best = start;
        }
    }
    (sorted[best], sorted[best + window - 1])
}

/// Highest-density interval of `samples` holding at least `coverage` of them.
pub fn hpdi(samples: &[f64], coverage: f64) -> Result<(f64, f64)> {
    check_coverage(coverage)?;
    check_sample_count(samples.len())?;
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(narrowest_window(&sorted, window_size(coverage, sorted.len())))
}

/// Cell-wise mean and HPDI over trajectories sharing one time grid and species order.
pub fn aggregate(trajectories: &[Trajectory], coverage: f64) -> Result<CredibilityBand> {
    check_coverage(coverage)?;
    check_sample_count(trajectories.len())?;

    let reference = &trajectories[0];
    let n_times = reference.len();
    let n_species = reference.states.first().map_or(0, Vec::len);
    for traj in trajectories {
        if traj.times != reference.times {
            return Err(SimulationError::InvalidTimeSequence(
                "posterior trajectories do not share one time grid".to_string(),
            ));
        }
        if traj.states.len() != n_times {
            return Err(SimulationError::shape(
                "Trajectory length",
                n_times,
                traj.states.len(),
            ));
        }
        if let Some(state) = traj.states.iter().find(|s| s.len() != n_species) {
            return Err(SimulationError::shape("Species count", n_species, state.len()));
        }
    }

    let n = trajectories.len();
    let window = window_size(coverage, n);
    let mut mean = vec![vec![0.0; n_species]; n_times];
    let mut representative = mean.clone();
    let mut lower = mean.clone();
    let mut upper = mean.clone();
    let mut cell = Vec::with_capacity(n);

    for t in 0..n_times {
        for s in 0..n_species {
            cell.clear();
            cell.extend(trajectories.iter().map(|traj| traj.states[t][s]));
            let sample_mean = cell.iter().sum::<f64>() / n as f64;
            cell.sort_by(f64::total_cmp);
            let (lo, hi) = narrowest_window(&cell, window);
            mean[t][s] = sample_mean;
            representative[t][s] = sample_mean.max(lo).min(hi);
            lower[t][s] = lo;
            upper[t][s] = hi;
        }
    }

    Ok(CredibilityBand {
        coverage,
        times: reference.times.clone(),
        mean,
        representative,
        lower,
        upper,
    })
}

/// Simulates every posterior draw from one initial condition, aggregates
/// the HPDI band, and simulates the central trajectory once from the
/// posterior-mean parameters.
pub fn credibility_interval(
    system: &OdeSystem,
    posterior: &PosteriorSampleBatch,
    initial_state: &[f64],
    times: &[f64],
    dt0: f64,
    coverage: f64,
    settings: &IntegratorSettings,
) -> Result<CredibilityReport> {
    check_coverage(coverage)?;
    check_sample_count(posterior.len())?;

    let initial = Batch::One(initial_state.to_vec());
    let times = Batch::One(times.to_vec());

    let draws = simulate(
        system,
        &initial,
        &Batch::Many(posterior.samples().to_vec()),
        &times,
        dt0,
        &BatchAxes::single().map_parameters(0),
        settings,
    )?;
    let band = aggregate(&draws.trajectories, coverage)?;

    let central = simulate(
        system,
        &initial,
        &Batch::One(posterior.mean()?),
        &times,
        dt0,
        &BatchAxes::single(),
        settings,
    )?;
    let central = central
        .trajectories
        .into_iter()
        .next()
        .ok_or_else(|| SimulationError::shape("Central trajectory count", 1, 0))?;

    Ok(CredibilityReport { band, central })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::Expr;
    use crate::parameters::ParameterSet;
    use crate::system::Species;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Gamma, Normal};

    fn constant_trajectory(value: f64) -> Trajectory {
        Trajectory {
            times: vec![1.0],
            states: vec![vec![value]],
        }
    }

    #[test]
    fn hpdi_picks_narrowest_window() {
        let (lo, hi) = hpdi(&[100.0, 3.0, 1.0, 4.0, 2.0], 0.6).expect("hpdi");
        assert_eq!((lo, hi), (1.0, 3.0));

        let (lo, hi) = hpdi(&[0.0, 10.0, 10.5, 11.0, 30.0], 0.6).expect("hpdi");
        assert_eq!((lo, hi), (10.0, 11.0));
    }

    #[test]
    fn hpdi_full_coverage_spans_all_samples() {
        let (lo, hi) = hpdi(&[5.0, -1.0, 2.0], 1.0).expect("hpdi");
        assert_eq!((lo, hi), (-1.0, 5.0));
    }

    #[test]
    fn hpdi_width_grows_with_coverage() {
        let mut rng = StdRng::seed_from_u64(11);
        let gamma = Gamma::new(2.0, 1.5).expect("gamma");
        let samples: Vec<f64> = (0..500).map(|_| gamma.sample(&mut rng)).collect();

        let mut previous = 0.0;
        for step in 1..=20 {
            let coverage = step as f64 / 20.0;
            let (lo, hi) = hpdi(&samples, coverage).expect("hpdi");
            let width = hi - lo;
            assert!(width >= previous, "coverage {coverage}: {width} < {previous}");
            previous = width;
        }
    }

    #[test]
    fn hpdi_holds_requested_mass_of_unimodal_samples() {
        let mut rng = StdRng::seed_from_u64(2024);
        let normal = Normal::new(3.0, 0.5).expect("normal");
        let samples: Vec<f64> = (0..1000).map(|_| normal.sample(&mut rng)).collect();

        let (lo, hi) = hpdi(&samples, 0.9).expect("hpdi");
        let inside = samples.iter().filter(|&&x| lo <= x && x <= hi).count();
        assert!(inside >= 900, "only {inside} samples inside");
        assert!(lo < 3.0 && 3.0 < hi);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert_eq!(
            aggregate(&[constant_trajectory(1.0)], 0.9),
            Err(SimulationError::InsufficientSamples(1))
        );
        let two = [constant_trajectory(1.0), constant_trajectory(2.0)];
        assert_eq!(aggregate(&two, 1.5), Err(SimulationError::InvalidCoverage(1.5)));
        assert_eq!(aggregate(&two, 0.0), Err(SimulationError::InvalidCoverage(0.0)));
        assert!(matches!(
            hpdi(&[1.0, 2.0], f64::NAN),
            Err(SimulationError::InvalidCoverage(_))
        ));
    }

    #[test]
    fn aggregate_rejects_misaligned_trajectories() {
        let a = constant_trajectory(1.0);
        let b = Trajectory {
            times: vec![2.0],
            states: vec![vec![1.0]],
        };
        assert!(matches!(
            aggregate(&[a.clone(), b], 0.9),
            Err(SimulationError::InvalidTimeSequence(_))
        ));

        let c = Trajectory {
            times: vec![1.0],
            states: vec![vec![1.0, 2.0]],
        };
        assert!(matches!(
            aggregate(&[a, c], 0.9),
            Err(SimulationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn aggregate_is_cellwise() {
        let trajectories: Vec<Trajectory> = (0..10)
            .map(|i| Trajectory {
                times: vec![0.0, 1.0],
                states: vec![vec![i as f64, 0.0], vec![2.0 * i as f64, -(i as f64)]],
            })
            .collect();
        let band = aggregate(&trajectories, 0.8).expect("band");

        assert_eq!(band.times, vec![0.0, 1.0]);
        assert!((band.mean[0][0] - 4.5).abs() < 1e-12);
        assert!((band.mean[1][1] + 4.5).abs() < 1e-12);
        assert_eq!(band.representative, band.mean);
        // evenly spaced: every window of 8 has the same width, lowest wins
        assert_eq!((band.lower[0][0], band.upper[0][0]), (0.0, 7.0));
        assert_eq!((band.lower[0][1], band.upper[0][1]), (0.0, 0.0));
        assert_eq!((band.lower[1][1], band.upper[1][1]), (-9.0, -2.0));

        let species = band.species(1).expect("species");
        assert_eq!(species.lower, vec![0.0, -9.0]);
        assert!(band.species(2).is_none());
    }

    #[test]
    fn skewed_cell_keeps_representative_inside_band() {
        let trajectories: Vec<Trajectory> = [1.0, 2.0, 3.0, 4.0, 100.0]
            .into_iter()
            .map(constant_trajectory)
            .collect();
        let band = aggregate(&trajectories, 0.6).expect("band");
        assert_eq!((band.lower[0][0], band.upper[0][0]), (1.0, 3.0));
        assert_eq!(band.representative[0][0], 3.0);
        assert!((band.mean[0][0] - 22.0).abs() < 1e-12);

        let species = band.species(0).expect("species");
        assert_eq!(species.representative, vec![3.0]);
        assert!(species.mean[0] > species.upper[0]);
    }

    #[test]
    fn credibility_interval_brackets_the_posterior() {
        let system = OdeSystem::from_expressions(
            vec![Species::observable("x")],
            &[Expr::neg(Expr::mul(Expr::sym("k"), Expr::sym("x")))],
        )
        .expect("system");

        let mut rng = StdRng::seed_from_u64(5);
        let prior = Normal::new(0.5, 0.05).expect("normal");
        let names = vec!["k".to_string()];
        let rows: Vec<Vec<f64>> = (0..200).map(|_| vec![prior.sample(&mut rng)]).collect();
        let posterior = PosteriorSampleBatch::from_matrix(&names, &rows).expect("posterior");

        let times = [1.0, 2.0, 4.0];
        let report = credibility_interval(
            &system,
            &posterior,
            &[10.0],
            &times,
            0.1,
            0.9,
            &IntegratorSettings::default(),
        )
        .expect("report");

        assert_eq!(report.band.times, times.to_vec());
        assert_eq!(report.central.times, times.to_vec());
        let k_mean = posterior.mean().expect("mean").scalar("k").expect("k");
        for (i, t) in times.iter().enumerate() {
            let (lo, hi) = (report.band.lower[i][0], report.band.upper[i][0]);
            assert!(lo < hi);
            let representative = report.band.representative[i][0];
            assert!(lo <= representative && representative <= hi);
            let expected = 10.0 * (-k_mean * t).exp();
            assert!((report.central.states[i][0] - expected).abs() / expected < 1e-2);
        }
    }

    #[test]
    fn credibility_interval_checks_inputs_before_simulating() {
        let system = OdeSystem::from_fn(vec![Species::observable("x")], |_t, _x, _p| {
            Ok(vec![0.0])
        });
        let one = PosteriorSampleBatch::new(vec![ParameterSet::new()]).expect("posterior");
        assert_eq!(
            credibility_interval(
                &system,
                &one,
                &[1.0],
                &[1.0],
                0.1,
                0.9,
                &IntegratorSettings::default()
            ),
            Err(SimulationError::InsufficientSamples(1))
        );
    }
}

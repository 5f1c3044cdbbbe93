use crate::error::Result;
use crate::traits::{DynamicalSystem, Steppable};
use serde::{Deserialize, Serialize};

/// Explicit Runge-Kutta families with an embedded error estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Solver {
    /// Tsitouras 5(4).
    #[default]
    Tsit5,
    /// Dormand-Prince 5(4).
    Dopri5,
    /// Bogacki-Shampine 3(2).
    Bosh3,
}

impl Solver {
    pub fn build(self, dim: usize) -> EmbeddedRk {
        let tableau = match self {
            Solver::Tsit5 => &TSIT5,
            Solver::Dopri5 => &DOPRI5,
            Solver::Bosh3 => &BOSH3,
        };
        EmbeddedRk::new(tableau, dim)
    }
}

/// Butcher tableau of an embedded pair.
/// `e` holds the difference between the propagated and embedded weights,
/// so `dt * sum(e_i * k_i)` is the local error estimate.
pub struct Tableau {
    c: &'static [f64],
    a: &'static [&'static [f64]],
    b: &'static [f64],
    e: &'static [f64],
    error_order: u32,
}

impl Tableau {
    fn stages(&self) -> usize {
        self.c.len()
    }
}

static TSIT5: Tableau = Tableau {
    c: &[0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0],
    a: &[
        &[],
        &[0.161],
        &[-0.008480655492356989, 0.335480655492357],
        &[2.897153057105493, -6.359448489975075, 4.3622954328695815],
        &[
            5.325864858437957,
            -11.748883564062828,
            7.4955393428898365,
            -0.09249506636175525,
        ],
        &[
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.028269050394068383,
        ],
        &[
            0.09646076681806523,
            0.01,
            0.4798896504144996,
            1.379008574103742,
            -3.290069515436081,
            2.324710524099774,
        ],
    ],
    b: &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436081,
        2.324710524099774,
        0.0,
    ],
    e: &[
        -0.00178001105222577714,
        -0.0008164344596567469,
        0.007880878010261995,
        -0.1447110071732629,
        0.5823571654525552,
        -0.45808210592918697,
        0.015151515151515152,
    ],
    error_order: 4,
};

static DOPRI5: Tableau = Tableau {
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[
            19372.0 / 6561.0,
            -25360.0 / 2187.0,
            64448.0 / 6561.0,
            -212.0 / 729.0,
        ],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    e: &[
        71.0 / 57600.0,
        0.0,
        -71.0 / 16695.0,
        71.0 / 1920.0,
        -17253.0 / 339200.0,
        22.0 / 525.0,
        -1.0 / 40.0,
    ],
    error_order: 4,
};

static BOSH3: Tableau = Tableau {
    c: &[0.0, 0.5, 0.75, 1.0],
    a: &[
        &[],
        &[0.5],
        &[0.0, 0.75],
        &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0],
    ],
    b: &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0],
    e: &[-5.0 / 72.0, 1.0 / 12.0, 1.0 / 9.0, -1.0 / 8.0],
    error_order: 2,
};

/// Explicit embedded Runge-Kutta stepper driven by a [`Tableau`].
/// Stage buffers are allocated once per integration.
pub struct EmbeddedRk {
    tableau: &'static Tableau,
    k: Vec<Vec<f64>>,
    tmp: Vec<f64>,
}

impl EmbeddedRk {
    pub fn new(tableau: &'static Tableau, dim: usize) -> Self {
        Self {
            tableau,
            k: vec![vec![0.0; dim]; tableau.stages()],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for EmbeddedRk {
    fn error_order(&self) -> u32 {
        self.tableau.error_order
    }

    fn attempt(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        state: &[f64],
        dt: f64,
        next: &mut [f64],
        error: &mut [f64],
    ) -> Result<()> {
        let tab = self.tableau;
        let dim = state.len();

        system.apply(t, state, &mut self.k[0])?;

        for stage in 1..tab.stages() {
            let row = tab.a[stage];
            for i in 0..dim {
                let mut acc = 0.0;
                for (j, a) in row.iter().enumerate() {
                    acc += a * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            system.apply(t + tab.c[stage] * dt, &self.tmp, &mut self.k[stage])?;
        }

        for i in 0..dim {
            let mut incr = 0.0;
            let mut err = 0.0;
            for stage in 0..tab.stages() {
                incr += tab.b[stage] * self.k[stage][i];
                err += tab.e[stage] * self.k[stage][i];
            }
            next[i] = state[i] + dt * incr;
            error[i] = dt * err;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Solver;
    use crate::error::Result;
    use crate::traits::{DynamicalSystem, Steppable};

    struct Decay {
        rate: f64,
    }

    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<()> {
            out[0] = -self.rate * x[0];
            Ok(())
        }
    }

    struct Clock;

    impl DynamicalSystem for Clock {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, t: f64, _x: &[f64], out: &mut [f64]) -> Result<()> {
            out[0] = 2.0 * t;
            Ok(())
        }
    }

    #[test]
    fn tableaus_are_consistent() {
        for tab in [&super::TSIT5, &super::DOPRI5, &super::BOSH3] {
            let b_sum: f64 = tab.b.iter().sum();
            let e_sum: f64 = tab.e.iter().sum();
            assert!((b_sum - 1.0).abs() < 1e-12, "weights sum to {b_sum}");
            assert!(e_sum.abs() < 1e-12, "error weights sum to {e_sum}");
            for (stage, row) in tab.a.iter().enumerate() {
                assert_eq!(row.len(), stage);
                let row_sum: f64 = row.iter().sum();
                assert!((row_sum - tab.c[stage]).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn single_step_matches_exponential() {
        for solver in [Solver::Tsit5, Solver::Dopri5, Solver::Bosh3] {
            let mut stepper = solver.build(1);
            let mut next = [0.0];
            let mut err = [0.0];
            stepper
                .attempt(&Decay { rate: 1.0 }, 0.0, &[1.0], 0.1, &mut next, &mut err)
                .expect("step should succeed");
            let expected = (-0.1_f64).exp();
            assert!((next[0] - expected).abs() < 1e-5, "{solver:?}: {}", next[0]);
            assert!(err[0].abs() < 1e-3);
        }
    }

    #[test]
    fn polynomial_in_time_is_integrated_exactly() {
        let mut stepper = Solver::Tsit5.build(1);
        let mut next = [0.0];
        let mut err = [0.0];
        stepper
            .attempt(&Clock, 1.0, &[0.0], 0.5, &mut next, &mut err)
            .expect("step should succeed");
        // x(t) = t^2 - 1 from x(1) = 0
        assert!((next[0] - 1.25).abs() < 1e-12);
        assert!(err[0].abs() < 1e-12);
    }
}

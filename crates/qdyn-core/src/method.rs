//! Stepping formulas.
//!
//! Every formula is a variant of [`Method`], picked once per solve. Explicit
//! Runge–Kutta methods share one [`Tableau`]-driven step; the remaining
//! variants are structure-preserving or stochastic maps on density matrices.

use ndarray::{Array2, ArrayView1, s};
use num_complex::Complex64;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::equation::{EquationKind, Evaluator};
use crate::error::{SolveError, SolveResult};
use crate::state::{dag, trace};

/// Stepping formula.
///
/// Serialised with an internal `name` tag, e.g. `{ name: euler, dt: 0.01 }`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Method {
    /// Dormand–Prince 5(4) with its native continuous extension.
    #[default]
    Dopri5,
    /// Dormand–Prince 8(5,3). Steps always end on save points.
    Dopri8,
    /// Tsitouras 5(4) with its free fourth-order interpolant.
    Tsit5,
    /// Fixed-step forward Euler.
    Euler {
        /// Step size.
        dt: f64,
    },
    /// First-order Rouchon Kraus map for Lindblad problems.
    Rouchon1 {
        /// Step size.
        dt: f64,
    },
    /// Exact exponentials of constant generators, one per save interval.
    Propagator,
    /// Euler–Maruyama for the diffusive stochastic master equation.
    EulerMaruyama {
        /// Step size.
        dt: f64,
    },
}

impl Method {
    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Method::Dopri5 => "Dopri5",
            Method::Dopri8 => "Dopri8",
            Method::Tsit5 => "Tsit5",
            Method::Euler { .. } => "Euler",
            Method::Rouchon1 { .. } => "Rouchon1",
            Method::Propagator => "Propagator",
            Method::EulerMaruyama { .. } => "EulerMaruyama",
        }
    }

    /// True for embedded pairs driven by the step controller.
    pub fn is_adaptive(&self) -> bool {
        matches!(self, Method::Dopri5 | Method::Dopri8 | Method::Tsit5)
    }

    /// True when accepted steps can be evaluated between their endpoints
    /// at the method's own order.
    pub fn has_dense_output(&self) -> bool {
        matches!(self, Method::Dopri5 | Method::Tsit5)
    }

    /// Step size of a fixed-step method.
    pub fn fixed_step(&self) -> Option<f64> {
        match *self {
            Method::Euler { dt } | Method::Rouchon1 { dt } | Method::EulerMaruyama { dt } => {
                Some(dt)
            }
            _ => None,
        }
    }

    /// Whether the adjoint engine has a backward rule for this method.
    pub fn supports_gradient(&self) -> bool {
        self.tableau().is_some() || matches!(self, Method::Propagator)
    }

    /// Explicit Runge–Kutta tableau, if the method has one.
    pub fn tableau(&self) -> Option<&'static Tableau> {
        match self {
            Method::Dopri5 => Some(&DOPRI5),
            Method::Dopri8 => Some(&DOPRI8),
            Method::Tsit5 => Some(&TSIT5),
            Method::Euler { .. } => Some(&EULER),
            _ => None,
        }
    }

    /// Check the method against the equation and operator time dependence.
    pub fn check_compatible(&self, kind: EquationKind, constant: bool) -> SolveResult<()> {
        let incompatible = |reason: &str| SolveError::IncompatibleMethod {
            method: self.name(),
            reason: reason.to_string(),
        };
        if let Some(dt) = self.fixed_step() {
            if !(dt.is_finite() && dt > 0.0) {
                return Err(SolveError::InvalidConfig(format!(
                    "{} step size must be positive and finite, got {dt}",
                    self.name()
                )));
            }
        }
        match (self, kind) {
            (Method::EulerMaruyama { .. }, EquationKind::StochasticMaster) => Ok(()),
            (Method::EulerMaruyama { .. }, _) => {
                Err(incompatible("only integrates stochastic master equations"))
            }
            (_, EquationKind::StochasticMaster) => Err(incompatible(
                "stochastic master equations need a stochastic method",
            )),
            (Method::Rouchon1 { .. }, EquationKind::Schrodinger) => {
                Err(incompatible("is a density-matrix map"))
            }
            (Method::Propagator, _) if !constant => {
                Err(incompatible("needs time-independent operators"))
            }
            _ => Ok(()),
        }
    }

    /// Evaluate the continuous extension of an accepted step at
    /// `θ = (t − t₀) / h ∈ [0, 1]`.
    pub(crate) fn interpolate(
        &self,
        y0: &Array2<Complex64>,
        y1: &Array2<Complex64>,
        stages: &[Array2<Complex64>],
        h: f64,
        theta: f64,
    ) -> Array2<Complex64> {
        match self {
            Method::Dopri5 if stages.len() == 7 => dopri5_dense(y0, y1, stages, h, theta),
            Method::Tsit5 if stages.len() == 7 => combine(y0, stages, &tsit5_dense(theta), h),
            _ => {
                let mut out = y0.mapv(|z| z * (1.0 - theta));
                out.scaled_add(Complex64::new(theta, 0.0), y1);
                out
            }
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.fixed_step() {
            Some(dt) => write!(f, "{} (dt = {dt})", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

// ---------------------------------------------------------------------------
// Explicit Runge–Kutta
// ---------------------------------------------------------------------------

/// Butcher tableau of an explicit method.
///
/// Row `i` of `a` holds the coefficients of stage `i + 1`. For FSAL methods
/// the last row equals `b`, so the last stage is the derivative at the new
/// point.
#[derive(Debug)]
pub struct Tableau {
    /// Stage nodes.
    pub c: &'static [f64],
    /// Strictly lower-triangular coefficients.
    pub a: &'static [&'static [f64]],
    /// Solution weights.
    pub b: &'static [f64],
    /// Error weights; empty without an embedded estimate.
    pub e: &'static [f64],
    /// Weights of a second, lower-order estimate blended into the first;
    /// empty for single-estimate pairs.
    pub e_low: &'static [f64],
    /// First same as last.
    pub fsal: bool,
    /// Order of the propagated solution.
    pub order: u32,
}

impl Tableau {
    /// Number of stages.
    pub fn stages(&self) -> usize {
        self.c.len()
    }

    /// True when an embedded error estimate is available.
    pub fn has_error_estimate(&self) -> bool {
        !self.e.is_empty()
    }
}

static DOPRI5: Tableau = Tableau {
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
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
    e_low: &[],
    fsal: true,
    order: 5,
};

static TSIT5: Tableau = Tableau {
    c: &[0.0, 0.161, 0.327, 0.9, 0.980_025_540_904_509_7, 1.0, 1.0],
    a: &[
        &[0.161],
        &[-0.008_480_655_492_356_989, 0.335_480_655_492_357],
        &[2.897_153_057_105_493, -6.359_448_489_975_075, 4.362_295_432_869_581_5],
        &[
            5.325_864_828_439_257,
            -11.748_883_564_062_828,
            7.495_539_342_889_836_5,
            -0.092_495_066_361_755_25,
        ],
        &[
            5.861_455_442_946_42,
            -12.920_969_317_847_11,
            8.159_367_898_576_159,
            -0.071_584_973_281_401,
            -0.028_269_050_394_068_383,
        ],
        &[
            0.096_460_766_818_065_23,
            0.01,
            0.479_889_650_414_499_6,
            1.379_008_574_103_742,
            -3.290_069_515_436_081,
            2.324_710_524_099_774,
        ],
    ],
    b: &[
        0.096_460_766_818_065_23,
        0.01,
        0.479_889_650_414_499_6,
        1.379_008_574_103_742,
        -3.290_069_515_436_081,
        2.324_710_524_099_774,
        0.0,
    ],
    e: &[
        -0.001_780_011_052_225_777_14,
        -0.000_816_434_459_656_746_9,
        0.007_880_878_010_261_995,
        -0.144_711_007_173_262_9,
        0.582_357_165_452_555_2,
        -0.458_082_105_929_186_97,
        0.015_151_515_151_515_152,
    ],
    e_low: &[],
    fsal: true,
    order: 5,
};

// Dormand–Prince 8(5,3) (Hairer, Nørsett & Wanner, II.10). The thirteenth
// stage reuses the solution weights so the pair is FSAL.
static DOPRI8: Tableau = Tableau {
    c: &[
        0.0,
        0.052_600_151_958_767_731_878_558_754_448_8,
        0.078_900_227_938_151_597_817_838_131_673_2,
        0.118_350_341_907_227_396_726_757_197_510,
        0.281_649_658_092_772_603_273_242_802_490,
        1.0 / 3.0,
        0.25,
        4.0 / 13.0,
        127.0 / 195.0,
        0.6,
        6.0 / 7.0,
        1.0,
        1.0,
    ],
    a: &[
        &[0.052_600_151_958_767_731_878_558_754_448_8],
        &[
            0.019_725_056_984_537_899_454_459_532_918_3,
            0.059_175_170_953_613_698_363_378_598_754_9,
        ],
        &[
            0.029_587_585_476_806_849_181_689_299_377_5,
            0.0,
            0.088_762_756_430_420_547_545_067_898_132_4,
        ],
        &[
            0.241_365_134_159_266_685_502_369_798_665,
            0.0,
            -0.884_549_479_328_286_085_344_864_962_717,
            0.924_834_003_261_792_003_115_737_966_543,
        ],
        &[
            0.037_037_037_037_037_037_037_037_037_037,
            0.0,
            0.0,
            0.170_828_608_729_473_871_279_604_482_173,
            0.125_467_687_566_822_425_016_691_814_123,
        ],
        &[
            0.037_109_375,
            0.0,
            0.0,
            0.170_252_211_019_544_039_314_978_060_272,
            0.060_216_538_980_455_960_685_021_939_728_3,
            -0.017_578_125,
        ],
        &[
            0.037_092_000_118_504_792_710_877_931_983_6,
            0.0,
            0.0,
            0.170_383_925_712_239_993_810_214_054_705,
            0.107_262_030_446_373_284_651_809_199_168,
            -0.015_319_437_748_624_401_752_793_615_823_6,
            0.008_273_789_163_814_022_887_584_737_660_02,
        ],
        &[
            0.624_110_958_716_075_717_114_429_577_812,
            0.0,
            0.0,
            -3.360_892_629_446_941_294_068_571_098_25,
            -0.868_219_346_841_726_006_818_189_891_453,
            27.592_099_699_446_708_304_941_560_079_7,
            20.154_067_550_477_893_408_618_678_897_9,
            -43.489_884_181_069_958_847_736_625_514_4,
        ],
        &[
            0.477_662_536_438_264_365_890_433_908_527,
            0.0,
            0.0,
            -2.488_114_619_971_667_641_926_425_864_68,
            -0.590_290_826_836_842_996_371_446_475_743,
            21.230_051_448_181_194_234_728_894_989_7,
            15.279_233_632_882_423_583_259_692_293_8,
            -33.288_210_968_984_862_919_445_326_558_7,
            -0.020_331_201_708_508_626_135_822_292_859_3,
        ],
        &[
            -0.937_142_430_085_987_325_717_040_216_58,
            0.0,
            0.0,
            5.186_372_428_844_063_708_300_238_532_09,
            1.091_437_348_996_729_578_185_002_546_54,
            -8.149_787_010_746_926_125_139_972_673_57,
            -18.520_065_659_996_959_864_156_618_070_1,
            22.739_487_099_350_504_281_897_005_673_4,
            2.493_605_552_679_652_389_870_893_967_62,
            -3.046_764_471_898_219_500_382_366_902_2,
        ],
        &[
            2.273_310_147_516_538_207_923_597_684_49,
            0.0,
            0.0,
            -10.534_495_466_737_250_198_406_668_987_9,
            -2.000_872_058_224_862_499_096_757_184_44,
            -17.958_931_863_118_798_917_276_595_053_4,
            27.948_884_529_419_960_050_849_980_883_7,
            -2.858_998_277_135_023_694_740_655_086_74,
            -8.872_856_933_530_629_544_335_492_892_58,
            12.360_567_175_794_303_064_726_620_152_8,
            0.643_392_746_015_763_530_355_970_484_046,
        ],
        &[
            0.054_293_734_116_568_762_238_053_576_636_3,
            0.0,
            0.0,
            0.0,
            0.0,
            4.450_312_892_752_408_881_441_139_505_66,
            1.891_517_899_314_500_383_042_815_990_44,
            -5.801_203_960_010_584_781_467_211_422_7,
            0.311_164_366_957_819_894_408_916_062_37,
            -0.152_160_949_662_516_078_556_178_806_805,
            0.201_365_400_804_030_348_374_776_537_501,
            0.044_710_615_727_772_590_517_688_556_904_3,
        ],
    ],
    b: &[
        0.054_293_734_116_568_762_238_053_576_636_3,
        0.0,
        0.0,
        0.0,
        0.0,
        4.450_312_892_752_408_881_441_139_505_66,
        1.891_517_899_314_500_383_042_815_990_44,
        -5.801_203_960_010_584_781_467_211_422_7,
        0.311_164_366_957_819_894_408_916_062_37,
        -0.152_160_949_662_516_078_556_178_806_805,
        0.201_365_400_804_030_348_374_776_537_501,
        0.044_710_615_727_772_590_517_688_556_904_3,
        0.0,
    ],
    e: &[
        0.013_120_044_994_194_880_732_501_029_96,
        0.0,
        0.0,
        0.0,
        0.0,
        -1.225_156_446_376_204_440_720_569_753,
        -0.495_758_949_657_250_191_521_407_995_2,
        1.664_377_182_454_986_536_961_530_415,
        -0.350_328_848_749_973_681_688_648_729,
        0.334_179_118_713_017_479_029_731_884_1,
        0.081_923_206_485_115_712_465_707_426_13,
        -0.022_355_307_863_886_295_258_844_278_45,
        0.0,
    ],
    // b minus the third-order weights 0.2440…, 0.7338…, 0.0220… on stages
    // 1, 9 and 12.
    e_low: &[
        0.054_293_734_116_568_762_238_053_576_636_3 - 0.244_094_488_188_976_377_952_755_905_512,
        0.0,
        0.0,
        0.0,
        0.0,
        4.450_312_892_752_408_881_441_139_505_66,
        1.891_517_899_314_500_383_042_815_990_44,
        -5.801_203_960_010_584_781_467_211_422_7,
        0.311_164_366_957_819_894_408_916_062_37 - 0.733_846_688_281_611_857_341_361_741_547,
        -0.152_160_949_662_516_078_556_178_806_805,
        0.201_365_400_804_030_348_374_776_537_501,
        0.044_710_615_727_772_590_517_688_556_904_3 - 0.022_058_823_529_411_764_705_882_352_941_2,
        0.0,
    ],
    fsal: true,
    order: 8,
};

static EULER: Tableau = Tableau {
    c: &[0.0],
    a: &[],
    b: &[1.0],
    e: &[],
    e_low: &[],
    fsal: false,
    order: 1,
};

/// Result of one explicit Runge–Kutta attempt.
#[derive(Debug, Clone)]
pub(crate) struct RkProposal {
    /// Candidate state at `t + h`.
    pub y_new: Array2<Complex64>,
    /// Embedded error estimate `h Σ e_i k_i`.
    pub error: Option<Array2<Complex64>>,
    /// Lower-order companion estimate, when the tableau has one.
    pub error_low: Option<Array2<Complex64>>,
    /// Stage derivatives `k_i`.
    pub stages: Vec<Array2<Complex64>>,
    /// Derivative evaluations spent.
    pub evaluations: u64,
}

impl RkProposal {
    /// Derivative at the new point for FSAL methods.
    pub fn fsal(&self, tableau: &Tableau) -> Option<&Array2<Complex64>> {
        if tableau.fsal {
            self.stages.last()
        } else {
            None
        }
    }
}

/// One explicit Runge–Kutta attempt of size `h` from `(t, y)`.
///
/// `k1` reuses a derivative already known at `(t, y)`.
pub(crate) fn rk_step(
    tableau: &Tableau,
    mut rhs: impl FnMut(f64, &Array2<Complex64>) -> SolveResult<Array2<Complex64>>,
    t: f64,
    y: &Array2<Complex64>,
    h: f64,
    k1: Option<&Array2<Complex64>>,
) -> SolveResult<RkProposal> {
    let s = tableau.stages();
    let mut evaluations = 0;
    let mut stages = Vec::with_capacity(s);
    stages.push(match k1 {
        Some(k) => k.clone(),
        None => {
            evaluations += 1;
            rhs(t, y)?
        }
    });

    let mut last_point = None;
    for i in 1..s {
        let point = combine(y, &stages, tableau.a[i - 1], h);
        stages.push(rhs(t + tableau.c[i] * h, &point)?);
        evaluations += 1;
        last_point = Some(point);
    }

    let y_new = match last_point {
        Some(point) if tableau.fsal => point,
        _ => combine(y, &stages, tableau.b, h),
    };
    let zeros = Array2::zeros(y.dim());
    let error = tableau
        .has_error_estimate()
        .then(|| combine(&zeros, &stages, tableau.e, h));
    let error_low = (!tableau.e_low.is_empty()).then(|| combine(&zeros, &stages, tableau.e_low, h));

    Ok(RkProposal {
        y_new,
        error,
        error_low,
        stages,
        evaluations,
    })
}

/// `base + h Σ w_j k_j`.
pub(crate) fn combine(
    base: &Array2<Complex64>,
    stages: &[Array2<Complex64>],
    weights: &[f64],
    h: f64,
) -> Array2<Complex64> {
    let mut out = base.clone();
    for (k, &w) in stages.iter().zip(weights) {
        if w != 0.0 {
            out.scaled_add(Complex64::new(h * w, 0.0), k);
        }
    }
    out
}

// Dormand–Prince continuous extension (Hairer, Nørsett & Wanner, II.6).
const DOPRI5_DENSE: [f64; 7] = [
    -12715105075.0 / 11282082432.0,
    0.0,
    87487479700.0 / 32700410799.0,
    -10690763975.0 / 1880347072.0,
    701980252875.0 / 199316789632.0,
    -1453857185.0 / 822651844.0,
    69997945.0 / 29380423.0,
];

fn dopri5_dense(
    y0: &Array2<Complex64>,
    y1: &Array2<Complex64>,
    k: &[Array2<Complex64>],
    h: f64,
    theta: f64,
) -> Array2<Complex64> {
    let r2 = y1 - y0;
    let mut r3 = k[0].mapv(|z| z * h);
    r3 -= &r2;
    let mut r4 = &r2 - &k[6].mapv(|z| z * h);
    r4 -= &r3;
    let r5 = combine(&Array2::zeros(y0.dim()), k, &DOPRI5_DENSE, h);

    let one_minus = 1.0 - theta;
    let c = |x: f64| Complex64::new(x, 0.0);
    let inner = (r4 + r5.mapv(|z| z * one_minus)).mapv(|z| z * theta);
    let mid = (r3 + inner).mapv(|z| z * one_minus);
    let mut out = y0.clone();
    out.scaled_add(c(theta), &(r2 + mid));
    out
}

/// Tsitouras' free interpolant: `y(t₀ + θh) = y₀ + h Σ b_i(θ) k_i`.
fn tsit5_dense(t: f64) -> [f64; 7] {
    let t2 = t * t;
    [
        -1.053_088_497_729_021_6
            * t
            * (t - 1.329_989_018_975_141_2)
            * (t2 - 1.436_402_854_171_635_1 * t + 0.713_981_691_707_420_9),
        0.1017 * t2 * (t2 - 2.196_656_833_824_975_4 * t + 1.294_985_250_737_463_1),
        2.490_627_285_651_252_8 * t2 * (t2 - 2.385_356_454_720_616_6 * t + 1.578_034_682_080_924_9),
        -16.548_102_889_244_903 * (t - 1.217_129_272_955_332_4) * (t - 0.616_204_060_378_000_9) * t2,
        47.379_521_962_819_28 * (t - 1.203_071_208_372_362_6) * (t - 0.658_047_292_653_547_4) * t2,
        -34.870_657_861_496_61 * (t - 1.2) * (t - 2.0 / 3.0) * t2,
        2.5 * (t - 1.0) * (t - 0.6) * t2,
    ]
}

// ---------------------------------------------------------------------------
// Density-matrix maps
// ---------------------------------------------------------------------------

/// Rouchon Kraus step `ρ → M₀ ρ M₀† + Σ M_k ρ M_k†` with
/// `M₀ = I − i H dt − ½ Σ L†L dt` and `M_k = √dt L_k`, renormalised to unit
/// trace.
pub(crate) fn rouchon1_step(
    eval: &Evaluator<'_>,
    t: f64,
    rho: &Array2<Complex64>,
    dt: f64,
) -> SolveResult<Array2<Complex64>> {
    let b = eval.backend();
    let (h, jumps) = eval.operators_at(t)?;
    let n = h.nrows();
    let mut m0 = Array2::<Complex64>::eye(n);
    m0.scaled_add(Complex64::new(0.0, -dt), &h);
    for l in &jumps {
        m0.scaled_add(Complex64::new(-0.5 * dt, 0.0), &b.matmul(&dag(l), l));
    }
    let mut out = b.matmul(&b.matmul(&m0, rho), &dag(&m0));
    for l in &jumps {
        out.scaled_add(
            Complex64::new(dt, 0.0),
            &b.matmul(&b.matmul(l, rho), &dag(l)),
        );
    }
    let tr = trace(&out).re;
    if tr.is_finite() && tr > 0.0 {
        out.mapv_inplace(|z| z / tr);
    }
    Ok(out)
}

/// Euler–Maruyama step of the diffusive stochastic master equation.
///
/// Returns the new state and the measurement increments
/// `dY_k = √η_k Tr[(L_k + L_k†) ρ] dt + dW_k`.
pub(crate) fn euler_maruyama_step<R: Rng + ?Sized>(
    eval: &Evaluator<'_>,
    t: f64,
    rho: &Array2<Complex64>,
    dt: f64,
    rng: &mut R,
) -> SolveResult<(Array2<Complex64>, Vec<f64>)> {
    let sqrt_dt = dt.sqrt();
    let dw: Vec<f64> = (0..eval.n_channels())
        .map(|_| rng.sample::<f64, _>(StandardNormal) * sqrt_dt)
        .collect();

    let mut out = rho.clone();
    out.scaled_add(Complex64::new(dt, 0.0), &eval.drift(t, rho)?);
    for (d, &w) in eval.diffusion(t, rho)?.iter().zip(&dw) {
        out.scaled_add(Complex64::new(w, 0.0), d);
    }
    let increments = eval
        .signal(t, rho)?
        .into_iter()
        .zip(&dw)
        .map(|(s, &w)| s * dt + w)
        .collect();
    Ok((out, increments))
}

/// Generator of the flow in vectorized form at time `t`: `−iH` for kets,
/// the column-stacked Liouvillian for density matrices.
pub(crate) fn generator(eval: &Evaluator<'_>, t: f64) -> SolveResult<Array2<Complex64>> {
    let b = eval.backend();
    let (h, jumps) = eval.operators_at(t)?;
    let minus_i = Complex64::new(0.0, -1.0);
    if !eval.kind().uses_density_matrix() {
        return Ok(h.mapv_into(|z| minus_i * z));
    }
    let eye = Array2::<Complex64>::eye(h.nrows());
    let mut generator = b.kron(&eye, &h).mapv_into(|z| minus_i * z);
    generator.scaled_add(-minus_i, &b.kron(&h.t().to_owned(), &eye));
    for l in &jumps {
        let ldl = b.matmul(&dag(l), l);
        generator += &b.kron(&l.mapv(|z| z.conj()), l);
        generator.scaled_add(Complex64::new(-0.5, 0.0), &b.kron(&eye, &ldl));
        generator.scaled_add(Complex64::new(-0.5, 0.0), &b.kron(&ldl.t().to_owned(), &eye));
    }
    Ok(generator)
}

/// Exact one-interval propagator `exp(G Δt)` of a constant generator.
pub(crate) fn propagator(eval: &Evaluator<'_>, dt: f64) -> SolveResult<Array2<Complex64>> {
    let g = generator(eval, 0.0)?;
    Ok(eval.backend().expm(&g.mapv_into(|z| z * dt)))
}

/// Apply a propagator from [`propagator`] to a state.
pub(crate) fn apply_propagator(
    eval: &Evaluator<'_>,
    u: &Array2<Complex64>,
    y: &Array2<Complex64>,
) -> Array2<Complex64> {
    let kind = eval.kind();
    let out = eval.backend().matmul(u, &vectorize(kind, y));
    unvectorize(kind, out.column(0), y.nrows())
}

/// `vec(ρ)` as a column; kets are already vectors.
pub(crate) fn vectorize(kind: EquationKind, y: &Array2<Complex64>) -> Array2<Complex64> {
    if !kind.uses_density_matrix() {
        return y.clone();
    }
    let n = y.nrows();
    // column stacking: vec(ρ)[j·n + i] = ρ[i, j]
    Array2::from_shape_fn((n * n, 1), |(k, _)| y[[k % n, k / n]])
}

/// Inverse of [`vectorize`] for a state of dimension `n`.
pub(crate) fn unvectorize(
    kind: EquationKind,
    v: ArrayView1<'_, Complex64>,
    n: usize,
) -> Array2<Complex64> {
    if kind.uses_density_matrix() {
        Array2::from_shape_fn((n, n), |(i, j)| v[j * n + i])
    } else {
        Array2::from_shape_fn((n, 1), |(i, _)| v[i])
    }
}

/// Propagator and parameter sensitivity of one exact interval.
///
/// With `X = G†` and `C = vec(a) vec(y)†`, the exponential of the block
/// matrix `[[X, C], [0, X]] Δt` holds `exp(G Δt)†` on its diagonal and
/// `W = ∫₀^Δt exp(G†(Δt − τ)) C exp(G†τ) dτ` in its upper-right block.
/// `W` is the gradient of `Re ⟨a, exp(G Δt) y⟩` with respect to `G`.
pub(crate) fn propagator_sensitivity(
    eval: &Evaluator<'_>,
    g: &Array2<Complex64>,
    a: &Array2<Complex64>,
    y: &Array2<Complex64>,
    dt: f64,
) -> (Array2<Complex64>, Array2<Complex64>) {
    let b = eval.backend();
    let kind = eval.kind();
    let n = g.nrows();
    let x = dag(g).mapv_into(|z| z * dt);
    let c = b
        .matmul(&vectorize(kind, a), &dag(&vectorize(kind, y)))
        .mapv_into(|z| z * dt);
    let mut block = Array2::<Complex64>::zeros((2 * n, 2 * n));
    block.slice_mut(s![..n, ..n]).assign(&x);
    block.slice_mut(s![n.., n..]).assign(&x);
    block.slice_mut(s![..n, n..]).assign(&c);
    let e = b.expm(&block);
    (
        e.slice(s![..n, ..n]).to_owned(),
        e.slice(s![..n, n..]).to_owned(),
    )
}

//! Successive-orders-of-scattering engine.
//!
//! Two nested iterations: an outer loop over azimuthal Fourier orders and an
//! inner loop over scattering orders. Each scattering order redistributes the
//! previous order's radiance through the phase-function kernel, integrates
//! the source function vertically, and folds into running sums with a
//! geometric-series convergence test and tail extrapolation.

use ndarray::Array2;
use smallvec::SmallVec;

use super::angles::{AngularGrid, DirVec};
use super::decay;
use super::discretize::OpticalProfile;
use super::kernel::{rayleigh_betas, rayleigh_row, PhaseKernel};
use super::{SosOutputs, SosParameters, TINY};

/// Scattering-angle spacing of the lookup table in degrees.
pub const SCATTERING_STEP_DEG: f64 = 4.0;

/// Capacity of one lookup-table row (180° at 4° steps, plus the endpoint).
pub const MAX_SCATTERING_SAMPLES: usize = 46;

/// A layer optical thickness below this is treated as an empty layer.
const THIN_LAYER: f64 = 1e-12;

/// Threshold on `1 - mu_s` under which only the `m = 0` Fourier order can
/// contribute (vertical-incidence degeneracy).
const ZENITH_SUN: f64 = 1e-6;

/// Accumulated outgoing radiance over the angular grid.
///
/// Rows are signed zenith slots (see [`AngularGrid`]): upward streams are
/// read at the top of the atmosphere, downward streams at the bottom
/// boundary. The principal vector holds the same synthesis evaluated at the
/// caller's fixed azimuth.
#[derive(Debug)]
pub struct RadianceField {
    half: usize,
    /// Radiance per (signed zenith slot, azimuth node).
    pub radiance: Array2<f64>,
    /// Radiance per signed zenith slot at the principal azimuth.
    pub principal: Vec<f64>,
    /// Scattering-angle lookup table for the upward streams.
    pub lut: ScatteringAngleLut,
}

impl RadianceField {
    /// Radiance of signed stream `k` at azimuth node `j`.
    pub fn value(&self, k: i32, j: usize) -> f64 {
        self.radiance[[(k + self.half as i32) as usize, j]]
    }

    /// Principal-azimuth radiance of signed stream `k`.
    pub fn principal_value(&self, k: i32) -> f64 {
        self.principal[(k + self.half as i32) as usize]
    }
}

/// Reflectance sampled on evenly spaced scattering angles.
///
/// Row `k - 1` belongs to the upward stream `k`. Each row holds up to
/// [`MAX_SCATTERING_SAMPLES`] samples at 4°-spaced scattering angles between
/// the geometrically admissible minimum and maximum for the (sun, view)
/// zenith pair, so directional reflectance can be interpolated from the
/// scattering angle without re-running the azimuth synthesis.
#[derive(Debug)]
pub struct ScatteringAngleLut {
    /// Accumulated radiance per (upward stream, scattering-angle sample).
    pub reflectance: Array2<f64>,
    /// Relative azimuth (radians) realizing each sampled scattering angle.
    pub azimuth: Array2<f64>,
    /// Sampled scattering angle in degrees.
    pub angle_deg: Array2<f64>,
    /// Number of valid samples per row.
    pub len: SmallVec<[usize; 32]>,
}

impl ScatteringAngleLut {
    /// Lay out the admissible scattering-angle samples for every upward
    /// stream of the grid; the per-order accumulation fills `reflectance`.
    fn build(grid: &AngularGrid, mu_s: f64) -> Self {
        let half = grid.half();
        let mut azimuth = Array2::zeros((half, MAX_SCATTERING_SAMPLES));
        let mut angle_deg = Array2::zeros((half, MAX_SCATTERING_SAMPLES));
        let mut len = SmallVec::with_capacity(half);

        let sin_s = (1.0 - mu_s * mu_s).max(0.0).sqrt();
        for k in 1..=half {
            let mu_v = grid.cosine(k as i32);
            let sin_v = (1.0 - mu_v * mu_v).max(0.0).sqrt();
            // cos Θ(φ) = a - b cos φ for a downward sun and upward view
            let a = -mu_s * mu_v;
            let b = sin_s * sin_v;
            let row = k - 1;

            if b <= TINY {
                // Sun at zenith or view at nadir: a single admissible angle
                azimuth[[row, 0]] = 0.0;
                angle_deg[[row, 0]] = a.clamp(-1.0, 1.0).acos().to_degrees();
                len.push(1);
                continue;
            }

            let theta_min = (a + b).clamp(-1.0, 1.0).acos().to_degrees();
            let theta_max = (a - b).clamp(-1.0, 1.0).acos().to_degrees();
            let mut theta = (theta_min / SCATTERING_STEP_DEG).ceil() * SCATTERING_STEP_DEG;
            let mut count = 0;
            while theta <= theta_max + 1e-9 && count < MAX_SCATTERING_SAMPLES {
                let cos_phi = ((a - theta.to_radians().cos()) / b).clamp(-1.0, 1.0);
                azimuth[[row, count]] = cos_phi.acos();
                angle_deg[[row, count]] = theta;
                count += 1;
                theta += SCATTERING_STEP_DEG;
            }
            len.push(count);
        }

        Self {
            reflectance: Array2::zeros((half, MAX_SCATTERING_SAMPLES)),
            azimuth,
            angle_deg,
            len,
        }
    }
}

/// Vertical integration sub-case: which boundary the recursion starts from.
#[derive(Debug, Clone, Copy)]
enum Stream {
    /// Integrated bottom-up from the lower boundary.
    Upward,
    /// Integrated top-down from the upper boundary.
    Downward,
}

/// Three generations of per-stream radiance at one level, for the
/// geometric-series convergence test. Reset at the start of each Fourier
/// order and discarded once the order's contribution is folded in.
#[derive(Debug)]
struct ScatteringOrderState {
    current: DirVec,
    previous: DirVec,
    older: DirVec,
}

impl ScatteringOrderState {
    fn new(half: usize) -> Self {
        Self {
            current: DirVec::new(half),
            previous: DirVec::new(half),
            older: DirVec::new(half),
        }
    }

    /// Shift generations down; `current` is then overwritten by the caller.
    fn rotate(&mut self) {
        std::mem::swap(&mut self.older, &mut self.previous);
        std::mem::swap(&mut self.previous, &mut self.current);
    }

    fn reset(&mut self) {
        self.current.reset();
        self.previous.reset();
        self.older.reset();
    }
}

/// Run the full successive-orders iteration for one geometry.
pub(crate) fn successive_orders(
    parameters: &SosParameters,
    grid: &AngularGrid,
    profile: &OpticalProfile,
    kernel: &dyn PhaseKernel,
    mu_s: f64,
) -> SosOutputs {
    let half = grid.half();
    let nt = profile.n_layers();
    let np = grid.n_azimuth();
    let obs = profile.observation_level;
    let slots = 2 * half + 1;

    let mut field = RadianceField {
        half,
        radiance: Array2::zeros((slots, np)),
        principal: vec![0.0; slots],
        lut: ScatteringAngleLut::build(grid, mu_s),
    };
    let mut toa = 0.0;
    let mut at_sensor = 0.0;

    // No azimuthal content past the kernel's highest moment; the Rayleigh
    // term ends at order 2
    let m_max = if 1.0 - mu_s < ZENITH_SUN {
        0
    } else {
        half.saturating_sub(3).min(kernel.max_order().max(2))
    };
    let (beta0, beta2) = rayleigh_betas(parameters.depolarization);

    // Scratch exclusively owned by this invocation; the per-order state is
    // reset at the start of each Fourier order and its contents die with it
    let mut source = Array2::zeros((nt + 1, slots));
    let mut radiance = Array2::zeros((nt + 1, slots));
    let mut fourier_norm = DirVec::new(half);
    let mut out_sum = DirVec::new(half);
    let mut obs_sum = DirVec::new(half);
    let mut out_state = ScatteringOrderState::new(half);
    let mut obs_state = ScatteringOrderState::new(half);

    for m in 0..=m_max {
        let aerosol = kernel.fourier_matrix(m, grid);
        let rayleigh = rayleigh_row(m, grid);
        let ray_term = |out: usize, inc: usize| -> f64 {
            match &rayleigh {
                Some(row) => {
                    let base = if m == 0 { beta0 } else { 0.0 };
                    base + beta2 * row[out] * row[inc]
                }
                None => 0.0,
            }
        };

        // Primary scattering of the attenuated direct beam
        let solar = grid.slot(0);
        for (j, level) in profile.levels.iter().enumerate() {
            for k in grid.streams() {
                let out = grid.slot(k);
                source[[j, out]] = 0.5
                    * level.solar_transmission
                    * (level.molecular * ray_term(out, solar)
                        + level.aerosol * aerosol[[out, solar]]);
            }
        }
        integrate(grid, profile, &source, &mut radiance);

        // Running sums over scattering orders: upward streams sampled at the
        // top, downward streams at the bottom boundary, everything also at
        // the observation level
        out_sum.reset();
        obs_sum.reset();
        out_state.reset();
        obs_state.reset();
        for k in grid.streams() {
            let slot = grid.slot(k);
            let boundary = if k > 0 { 0 } else { nt };
            out_sum.set(k, radiance[[boundary, slot]]);
            obs_sum.set(k, radiance[[obs, slot]]);
            out_state.current.set(k, radiance[[boundary, slot]]);
            obs_state.current.set(k, radiance[[obs, slot]]);
        }

        for _order in 2..=parameters.max_orders {
            // Redistribute the previous order through the kernel
            for (j, level) in profile.levels.iter().enumerate() {
                for k in grid.streams() {
                    let out = grid.slot(k);
                    let mut molecular = 0.0;
                    let mut aerosol_part = 0.0;
                    for kp in grid.streams() {
                        let weight = grid.weight(kp);
                        if weight == 0.0 {
                            continue;
                        }
                        let inc = grid.slot(kp);
                        let incident = weight * radiance[[j, inc]];
                        molecular += incident * ray_term(out, inc);
                        aerosol_part += incident * aerosol[[out, inc]];
                    }
                    source[[j, out]] =
                        0.5 * (level.molecular * molecular + level.aerosol * aerosol_part);
                }
            }
            integrate(grid, profile, &source, &mut radiance);

            out_state.rotate();
            obs_state.rotate();
            for k in grid.streams() {
                let slot = grid.slot(k);
                let boundary = if k > 0 { 0 } else { nt };
                out_sum.add(k, radiance[[boundary, slot]]);
                obs_sum.add(k, radiance[[obs, slot]]);
                out_state.current.set(k, radiance[[boundary, slot]]);
                obs_state.current.set(k, radiance[[obs, slot]]);
            }

            if geometric_ratio_stable(grid, &obs_state, parameters.ratio_tol) {
                extrapolate_tail(grid, &out_state, &mut out_sum);
                extrapolate_tail(grid, &obs_state, &mut obs_sum);
                break;
            }
            if below_floor(grid, &out_state, &obs_state, &out_sum, &obs_sum, parameters) {
                break;
            }
        }

        // Azimuthal Fourier synthesis of this order's contribution
        let delta = if m == 0 { 1.0 } else { 2.0 };
        let phase = |phi: f64| (m as f64 * (phi + std::f64::consts::PI)).cos();
        for k in grid.streams() {
            let slot = grid.slot(k);
            let term = delta * out_sum.get(k);
            for j in 0..np {
                field.radiance[[slot, j]] += term * phase(grid.azimuth(j));
            }
            field.principal[slot] += term * phase(parameters.principal_azimuth);
        }
        let view = half as i32;
        toa += delta * out_sum.get(view) * phase(parameters.principal_azimuth);
        at_sensor += delta * obs_sum.get(view) * phase(parameters.principal_azimuth);

        for k in 1..=half {
            let row = k - 1;
            let term = delta * out_sum.get(k as i32);
            for sample in 0..field.lut.len[row] {
                field.lut.reflectance[[row, sample]] +=
                    term * phase(field.lut.azimuth[[row, sample]]);
            }
        }

        // Stop once this order is negligible against the accumulated series
        // in every direction
        let mut worst: f64 = 0.0;
        for k in grid.streams() {
            let contribution = (delta * out_sum.get(k)).abs();
            fourier_norm.add(k, contribution);
            let norm = fourier_norm.get(k);
            if norm > TINY {
                worst = worst.max(contribution / norm);
            }
        }
        if m > 0 && worst < parameters.fourier_tol {
            break;
        }
    }

    SosOutputs {
        field,
        toa,
        at_sensor,
    }
}

/// Integrate the source function vertically for every stream.
///
/// Piecewise linear in optical depth within a layer, closed-form exponential
/// along the stream direction. Upward streams recurse from the bottom
/// boundary, downward streams from the top; both boundaries are vacuum (no
/// surface reflection, nothing incident from above).
fn integrate(
    grid: &AngularGrid,
    profile: &OpticalProfile,
    source: &Array2<f64>,
    radiance: &mut Array2<f64>,
) {
    let nt = profile.n_layers();
    let levels = &profile.levels;

    for k in grid.streams() {
        let slot = grid.slot(k);
        let mu = grid.cosine(k).abs();
        let stream = if k > 0 {
            Stream::Upward
        } else {
            Stream::Downward
        };

        match stream {
            Stream::Upward => {
                let mut acc = 0.0;
                radiance[[nt, slot]] = 0.0;
                for i in (0..nt).rev() {
                    let dtau = levels[i + 1].depth - levels[i].depth;
                    let attenuation = decay(dtau / mu);
                    acc = acc * attenuation
                        + layer_emission(
                            source[[i, slot]],
                            source[[i + 1, slot]],
                            dtau,
                            mu,
                            attenuation,
                            stream,
                        );
                    radiance[[i, slot]] = acc;
                }
            }
            Stream::Downward => {
                let mut acc = 0.0;
                radiance[[0, slot]] = 0.0;
                for i in 1..=nt {
                    let dtau = levels[i].depth - levels[i - 1].depth;
                    let attenuation = decay(dtau / mu);
                    acc = acc * attenuation
                        + layer_emission(
                            source[[i - 1, slot]],
                            source[[i, slot]],
                            dtau,
                            mu,
                            attenuation,
                            stream,
                        );
                    radiance[[i, slot]] = acc;
                }
            }
        }
    }

    // The solar slot is an input direction only
    let solar = grid.slot(0);
    for j in 0..=nt {
        radiance[[j, solar]] = 0.0;
    }
}

/// Closed-form emission of one layer into a stream.
///
/// `upper`/`lower` are the source values at the layer's upper and lower
/// boundary; the source varies linearly in depth between them.
fn layer_emission(
    upper: f64,
    lower: f64,
    dtau: f64,
    mu: f64,
    attenuation: f64,
    stream: Stream,
) -> f64 {
    if dtau <= THIN_LAYER {
        return 0.0;
    }
    let gradient = (lower - upper) / dtau;
    let ramp = mu * (1.0 - attenuation) - dtau * attenuation;
    match stream {
        Stream::Upward => upper * (1.0 - attenuation) + gradient * ramp,
        Stream::Downward => lower * (1.0 - attenuation) - gradient * ramp,
    }
}

/// True when the last three orders behave as a geometric series with a
/// stable, decaying ratio in every testable direction.
fn geometric_ratio_stable(
    grid: &AngularGrid,
    state: &ScatteringOrderState,
    ratio_tol: f64,
) -> bool {
    let mut testable = false;
    for k in grid.streams() {
        let previous = state.previous.get(k);
        let older = state.older.get(k);
        if previous.abs() <= TINY || older.abs() <= TINY {
            // Degenerate denominator: skip this direction
            continue;
        }
        let ratio = state.current.get(k) / previous;
        let earlier = previous / older;
        if !(ratio > 0.0 && ratio < 1.0 && (ratio - earlier).abs() <= ratio_tol) {
            return false;
        }
        testable = true;
    }
    testable
}

/// Add the closed-form geometric tail `current · r / (1 - r)` to every
/// direction's running sum; directions with a degenerate ratio are left as
/// plain partial sums.
fn extrapolate_tail(grid: &AngularGrid, state: &ScatteringOrderState, sum: &mut DirVec) {
    for k in grid.streams() {
        let previous = state.previous.get(k);
        if previous.abs() <= TINY {
            continue;
        }
        let ratio = state.current.get(k) / previous;
        if ratio > 0.0 && ratio < 1.0 {
            sum.add(k, state.current.get(k) * ratio / (1.0 - ratio));
        }
    }
}

/// True when the newest order is below the configured fraction of the
/// running sum in every direction, at both sampled levels.
fn below_floor(
    grid: &AngularGrid,
    out_state: &ScatteringOrderState,
    obs_state: &ScatteringOrderState,
    out_sum: &DirVec,
    obs_sum: &DirVec,
    parameters: &SosParameters,
) -> bool {
    grid.streams().all(|k| {
        let scale = out_sum.get(k).abs().max(obs_sum.get(k).abs());
        let newest = out_state
            .current
            .get(k)
            .abs()
            .max(obs_state.current.get(k).abs());
        scale <= TINY || newest <= parameters.order_floor * scale
    })
}

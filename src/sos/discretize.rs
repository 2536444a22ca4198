//! Vertical layer discretization.
//!
//! Converts the two decaying-exponential optical depth profiles (molecular
//! and aerosol) into one merged sequence of cumulative-depth levels, thin
//! where the combined extinction changes quickly, with an optional spliced-in
//! level at the sensor altitude.

use super::decay;
use crate::error::SosError;

/// Molecular (Rayleigh) scale height in km.
pub(crate) const MOLECULAR_SCALE_HEIGHT: f64 = 8.0;

/// Ceiling altitude in km; the atmosphere is optically empty above it.
const Z_TOP: f64 = 300.0;

/// Residual tolerance of the altitude bisection, in depth units.
const BISECT_TOL: f64 = 1e-5;

/// Depth distance under which the sensor level reuses an existing boundary.
const INSERT_TOL: f64 = 1e-4;

/// Largest allowed jump of the aerosol mixing fraction between consecutive
/// levels before the depth increment is halved.
const MIX_JUMP: f64 = 0.25;

/// Below this an optical depth counts as absent.
const DEPTH_EPS: f64 = 1e-8;

/// One discretized level of the atmosphere.
#[derive(Debug, Clone)]
pub(crate) struct Level {
    /// Cumulative molecular + aerosol optical depth from the top.
    pub depth: f64,
    /// Altitude of the level in km.
    pub altitude: f64,
    /// Fraction of extinction at this level that is Rayleigh scattering.
    pub molecular: f64,
    /// Fraction of extinction that is aerosol, times the single-scattering
    /// albedo.
    pub aerosol: f64,
    /// Direct-beam transmission from the top of the atmosphere to this
    /// level along the solar direction.
    pub solar_transmission: f64,
}

/// Ordered level sequence for one solver run; immutable once built.
#[derive(Debug)]
pub(crate) struct OpticalProfile {
    /// Levels from the top of the atmosphere (depth 0) down to the ground.
    pub levels: Vec<Level>,
    /// Index of the level at the sensor altitude (0 when the sensor is at or
    /// above the top of the atmosphere).
    pub observation_level: usize,
}

impl OpticalProfile {
    /// Number of layers (one less than the number of levels).
    pub fn n_layers(&self) -> usize {
        self.levels.len() - 1
    }
}

/// Discretize the atmosphere into `n_layers` optical layers.
///
/// `tau_r` and `tau_a` are the total molecular and aerosol optical depths,
/// `ha` the effective aerosol scale height in km, `ssa` the aerosol
/// single-scattering albedo and `mu_s` the solar zenith cosine. A finite
/// `sensor_altitude` (km) inserts an extra level flagged as the observation
/// level.
pub(crate) fn discretize(
    tau_r: f64,
    tau_a: f64,
    ssa: f64,
    ha: f64,
    sensor_altitude: Option<f64>,
    n_layers: usize,
    mu_s: f64,
) -> Result<OpticalProfile, SosError> {
    let hr = MOLECULAR_SCALE_HEIGHT;
    let total = tau_r + tau_a;
    let nt = n_layers;

    // Cumulative depth above altitude z, per component
    let component = |tau: f64, h: f64, z: f64| {
        if tau <= DEPTH_EPS {
            0.0
        } else {
            tau * decay(z / h)
        }
    };
    // Local extinction rate at altitude z: the profile derivative tau e^(-z/h)/h,
    // not the cumulative depth. The weighting pair is the share of this rate.
    let rate = |tau: f64, h: f64, z: f64| {
        if tau <= DEPTH_EPS {
            0.0
        } else {
            tau * decay(z / h) / h
        }
    };
    let split_at = |z: f64| -> (f64, f64) {
        let ea = rate(tau_a, ha, z);
        let er = rate(tau_r, hr, z);
        if ea + er <= f64::MIN_POSITIVE {
            // Underflowed at the very top; fall back to the ground-level split
            let ea0 = rate(tau_a, ha, 0.0);
            let er0 = rate(tau_r, hr, 0.0);
            if ea0 + er0 <= f64::MIN_POSITIVE {
                (0.0, 0.0)
            } else {
                (er0 / (ea0 + er0), ea0 / (ea0 + er0))
            }
        } else {
            (er / (ea + er), ea / (ea + er))
        }
    };

    let mut levels: Vec<Level> = Vec::with_capacity(nt + 2);

    if total <= DEPTH_EPS {
        // Vacuum column: levels carry no extinction at all
        for it in 0..=nt {
            levels.push(Level {
                depth: 0.0,
                altitude: Z_TOP * (1.0 - it as f64 / nt as f64),
                molecular: 0.0,
                aerosol: 0.0,
                solar_transmission: 1.0,
            });
        }
    } else if tau_a <= DEPTH_EPS || tau_r <= DEPTH_EPS {
        // Single-component atmosphere: linear subdivision of the present
        // component, altitude from inverting its exponential profile
        let (tau, h) = if tau_a <= DEPTH_EPS {
            (tau_r, hr)
        } else {
            (tau_a, ha)
        };
        for it in 0..=nt {
            let depth = tau * it as f64 / nt as f64;
            let altitude = if depth <= f64::MIN_POSITIVE {
                Z_TOP
            } else {
                (-h * (depth / tau).ln()).clamp(0.0, Z_TOP)
            };
            let (molecular, aerosol_frac) = if tau_a <= DEPTH_EPS {
                (1.0, 0.0)
            } else {
                (0.0, 1.0)
            };
            levels.push(Level {
                depth,
                altitude,
                molecular,
                aerosol: aerosol_frac * ssa,
                solar_transmission: 0.0,
            });
        }
    } else {
        // Mixed atmosphere: place each boundary by an implicit root solve,
        // shrinking the depth increment where the molecular/aerosol balance
        // swings quickly
        let (mol_top, aer_top) = split_at(Z_TOP);
        levels.push(Level {
            depth: 0.0,
            altitude: Z_TOP,
            molecular: mol_top,
            aerosol: aer_top * ssa,
            solar_transmission: 0.0,
        });

        let mut prev_depth = 0.0;
        let mut prev_aer_frac = aer_top;
        for it in 1..=nt {
            let remaining_depth = total - prev_depth;
            let remaining_levels = (nt - it + 1) as f64;
            let mut dt = 2.0 * remaining_depth / (remaining_levels + 1.0);

            let (z, ca, rt) = loop {
                dt *= 0.5;
                let target = if it == nt { total } else { prev_depth + dt };
                let found = bisect_altitude(tau_a, ha, tau_r, hr, target)?;

                let (_, ca, rt) = found;
                let aer_frac = (ca / ha) / (ca / ha + rt / hr);
                if it == nt
                    || (aer_frac - prev_aer_frac).abs() <= MIX_JUMP
                    || dt <= remaining_depth * 1e-4
                {
                    break found;
                }
            };

            let aer_frac = (ca / ha) / (ca / ha + rt / hr);
            let depth = ca + rt;
            prev_aer_frac = aer_frac;
            prev_depth = depth;
            levels.push(Level {
                depth,
                altitude: z,
                molecular: 1.0 - aer_frac,
                aerosol: ssa * aer_frac,
                solar_transmission: 0.0,
            });
        }
    }

    // Splice in the sensor level, reusing the nearest boundary when it is
    // already close enough in depth
    let observation_level = match sensor_altitude {
        Some(zs) if total > DEPTH_EPS => {
            let taup = component(tau_a, ha, zs) + component(tau_r, hr, zs);
            let (nearest, distance) = levels
                .iter()
                .enumerate()
                .map(|(i, level)| (i, (level.depth - taup).abs()))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap_or((0, 0.0));
            if distance < INSERT_TOL {
                nearest
            } else {
                let position = levels
                    .iter()
                    .position(|level| level.depth > taup)
                    .unwrap_or(levels.len());
                let (molecular, aerosol_frac) = split_at(zs);
                levels.insert(
                    position,
                    Level {
                        depth: taup,
                        altitude: zs,
                        molecular,
                        aerosol: aerosol_frac * ssa,
                        solar_transmission: 0.0,
                    },
                );
                position
            }
        }
        _ => 0,
    };

    for level in &mut levels {
        level.solar_transmission = decay(level.depth / mu_s);
    }

    Ok(OpticalProfile {
        levels,
        observation_level,
    })
}

/// Find the altitude where the combined cumulative depth equals `target`.
///
/// Bisection between the ground (depth = total) and the ceiling (depth ≈ 0)
/// with a residual tolerance in depth units. Returns the altitude and the
/// aerosol/molecular cumulative depths there.
fn bisect_altitude(
    tau_a: f64,
    ha: f64,
    tau_r: f64,
    hr: f64,
    target: f64,
) -> Result<(f64, f64, f64), SosError> {
    let at = |z: f64| (tau_a * decay(z / ha), tau_r * decay(z / hr));

    let (ca_top, rt_top) = at(Z_TOP);
    if target > tau_a + tau_r + BISECT_TOL || target < ca_top + rt_top - BISECT_TOL {
        return Err(SosError::NoBracket);
    }

    let mut floor = 0.0;
    let mut ceiling = Z_TOP;
    for _ in 0..200 {
        let z = 0.5 * (floor + ceiling);
        let (ca, rt) = at(z);
        if (ca + rt - target).abs() < BISECT_TOL {
            return Ok((z, ca, rt));
        }
        if ca + rt > target {
            floor = z;
        } else {
            ceiling = z;
        }
    }
    Err(SosError::NoBracket)
}

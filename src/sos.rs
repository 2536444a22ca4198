//! Successive-orders-of-scattering atmospheric solver.
//!
//! Given the molecular and aerosol optical depths of the column, a
//! scattering geometry and a phase-function kernel, the solver discretizes
//! the atmosphere into optical layers, decomposes the phase function into an
//! azimuthal Fourier series and sums multiple-scattering orders until a
//! geometric-series convergence criterion is met, producing the outgoing
//! radiance field and a compact scattering-angle lookup table.

pub(crate) mod angles;
pub(crate) mod discretize;
pub(crate) mod engine;
pub(crate) mod kernel;

#[cfg(test)]
mod tests;

pub use self::angles::AngularGrid;
pub use self::engine::{RadianceField, ScatteringAngleLut, MAX_SCATTERING_SAMPLES};
pub use self::kernel::{MomentKernel, PhaseKernel};

use crate::error::SosError;

/// Sensor altitudes at or above this (km) mean "no finite sensor": the
/// observer sits at the top of the atmosphere.
pub const SENSOR_AT_TOA: f64 = 900.0;

/// Below this a floating value counts as zero in ratio tests.
pub(crate) const TINY: f64 = 1e-30;

/// Exponential decay over a non-negative optical path, clamped to zero for
/// arguments that would underflow.
pub(crate) fn decay(path: f64) -> f64 {
    if path > 700.0 {
        0.0
    } else {
        (-path).exp()
    }
}

/// Input parameters for the solver that are constant over a batch of points.
#[derive(Debug)]
pub struct SosParameters {
    /// Zenith slots per hemisphere, including the reserved view slot.
    pub(crate) half: usize,
    /// Number of azimuth nodes.
    pub(crate) n_azimuth: usize,
    /// Number of optical layers.
    pub(crate) n_layers: usize,
    /// View zenith cosine, placed in the reserved quadrature slot.
    pub(crate) view_cosine: f64,
    /// Relative azimuth (radians) of the principal-plane output.
    pub(crate) principal_azimuth: f64,
    /// Rayleigh depolarization factor.
    pub(crate) depolarization: f64,
    /// Hard cap on the number of scattering orders.
    pub(crate) max_orders: usize,
    /// An order below this fraction of the running sum ends the inner loop.
    pub(crate) order_floor: f64,
    /// Allowed wobble of the order-to-order ratio before the geometric tail
    /// is applied.
    pub(crate) ratio_tol: f64,
    /// A Fourier order below this fraction of the accumulated series ends
    /// the outer loop.
    pub(crate) fourier_tol: f64,
}

impl SosParameters {
    /// Standard Rayleigh depolarization factor.
    const DEPOLARIZATION: f64 = 0.0279;

    /// Build run parameters.
    ///
    /// `half` is the per-hemisphere zenith slot count (at least 4, so that
    /// the Fourier cap `half - 3` leaves at least one azimuthal order),
    /// `n_azimuth` the azimuth node count, `n_layers` the optical layer
    /// count, `view_cosine` the view zenith cosine in (0, 1] and
    /// `principal_azimuth` the relative azimuth in radians at which the
    /// principal output vector is evaluated.
    pub fn new(
        half: usize,
        n_azimuth: usize,
        n_layers: usize,
        view_cosine: f64,
        principal_azimuth: f64,
    ) -> Result<Self, SosError> {
        if half < 4
            || n_azimuth == 0
            || n_layers < 2
            || !(view_cosine > 0.0 && view_cosine <= 1.0)
            || !principal_azimuth.is_finite()
        {
            return Err(SosError::InconsistentInputs);
        }
        Ok(Self {
            half,
            n_azimuth,
            n_layers,
            view_cosine,
            principal_azimuth,
            depolarization: Self::DEPOLARIZATION,
            max_orders: 30,
            order_floor: 1e-5,
            ratio_tol: 1e-3,
            fourier_tol: 1e-3,
        })
    }

    /// Override the scattering-order cap.
    pub fn with_max_orders(mut self, max_orders: usize) -> Self {
        self.max_orders = max_orders.max(1);
        self
    }

    /// Override the ratio-stability tolerance of the geometric-series test;
    /// zero disables tail extrapolation entirely.
    pub fn with_ratio_tolerance(mut self, ratio_tol: f64) -> Self {
        self.ratio_tol = ratio_tol;
        self
    }

    /// Override the Rayleigh depolarization factor.
    pub fn with_depolarization(mut self, depolarization: f64) -> Self {
        self.depolarization = depolarization;
        self
    }
}

/// Inputs for the solver for a single point. Unlike [`SosParameters`], these
/// values may vary over location/band.
#[derive(Debug)]
pub struct SosInputs {
    /// Molecular (Rayleigh) optical depth of the full column.
    rayleigh_depth: f64,
    /// Aerosol optical depth of the full column.
    aerosol_depth: f64,
    /// Aerosol single-scattering albedo.
    single_scattering_albedo: f64,
    /// Effective aerosol scale height in km, derived externally from the
    /// ratio of the aerosol depth at altitude vs. at the ground.
    aerosol_scale_height: f64,
    /// Sensor altitude in km; `None` for an observer at the top.
    sensor_altitude: Option<f64>,
    /// Solar zenith cosine.
    solar_cosine: f64,
}

impl SosInputs {
    /// Validate and store one point's atmosphere and geometry.
    ///
    /// `sensor_altitude` of [`SENSOR_AT_TOA`] or above is the sentinel for
    /// an observer outside the atmosphere.
    pub fn new(
        rayleigh_depth: f64,
        aerosol_depth: f64,
        single_scattering_albedo: f64,
        aerosol_scale_height: f64,
        sensor_altitude: f64,
        solar_cosine: f64,
    ) -> Result<Self, SosError> {
        let depths_valid = rayleigh_depth.is_finite()
            && aerosol_depth.is_finite()
            && rayleigh_depth >= 0.0
            && aerosol_depth >= 0.0;
        let albedo_valid = (0.0..=1.0).contains(&single_scattering_albedo);
        let scale_valid = aerosol_depth <= 0.0 || aerosol_scale_height > 0.0;
        let sun_valid = solar_cosine > 0.0 && solar_cosine <= 1.0;
        if !(depths_valid && albedo_valid && scale_valid && sun_valid) {
            return Err(SosError::InconsistentInputs);
        }
        let sensor_altitude = if sensor_altitude >= SENSOR_AT_TOA {
            None
        } else if sensor_altitude >= 0.0 {
            Some(sensor_altitude)
        } else {
            return Err(SosError::InconsistentInputs);
        };
        Ok(Self {
            rayleigh_depth,
            aerosol_depth,
            single_scattering_albedo,
            aerosol_scale_height,
            sensor_altitude,
            solar_cosine,
        })
    }

    /// Run the solver on the inputs for the given parameters and aerosol
    /// kernel.
    ///
    /// Fails only for a profile whose layer bisection cannot bracket a root;
    /// slow convergence is not an error and yields the partial sums.
    pub fn run(
        &self,
        parameters: &SosParameters,
        kernel: &dyn PhaseKernel,
    ) -> Result<SosOutputs, SosError> {
        let grid = AngularGrid::new(
            parameters.half,
            parameters.n_azimuth,
            self.solar_cosine,
            parameters.view_cosine,
        );
        let profile = discretize::discretize(
            self.rayleigh_depth,
            self.aerosol_depth,
            self.single_scattering_albedo,
            self.aerosol_scale_height,
            self.sensor_altitude,
            parameters.n_layers,
            self.solar_cosine,
        )?;
        Ok(engine::successive_orders(
            parameters,
            &grid,
            &profile,
            kernel,
            self.solar_cosine,
        ))
    }
}

/// Outputs from the solver for a single point.
#[derive(Debug)]
pub struct SosOutputs {
    /// Outgoing radiance over the angular grid, with the principal-plane
    /// vector and the scattering-angle lookup table.
    pub field: RadianceField,
    /// Radiance in the view direction at the top of the atmosphere, at the
    /// principal azimuth.
    pub toa: f64,
    /// Radiance in the view direction at the observation level (equals
    /// `toa` when no finite sensor altitude was given).
    pub at_sensor: f64,
}

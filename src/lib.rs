//! Successive-orders-of-scattering computation
//!
//! NOTE: this module is intended for the interface between Rust and Python.
//! The real work happens in the other modules, and they do not use `pyo3`,
//! its only used here.

pub mod error;
pub mod sos;

use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use error::SosError;
use log::{debug, info};
use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use numpy::prelude::*;
use numpy::{PyArray1, PyArray2, PyArray3, PyReadonlyArray1, ToPyArray};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use rayon::prelude::*;
use sos::{MomentKernel, SosInputs, SosOutputs, SosParameters, MAX_SCATTERING_SAMPLES};

impl From<SosError> for PyErr {
    fn from(e: SosError) -> Self {
        match e {
            SosError::InconsistentInputs => PyValueError::new_err(e.to_string()),
            SosError::NoBracket => PyValueError::new_err(e.to_string()),
            SosError::NotContiguous => PyValueError::new_err(e.to_string()),
            SosError::Cancelled => PyValueError::new_err(e.to_string()),
        }
    }
}

/// Solver results for a batch of points.
///
/// This is just a container of multiple numpy arrays; the leading dimension
/// of each is `num_points`.
#[pyclass]
struct SosResults {
    toa: Array1<f64>,
    at_sensor: Array1<f64>,
    principal: Array2<f64>,
    field: Array3<f64>,
    lut: Array3<f64>,
    lut_azimuth: Array3<f64>,
    lut_angle: Array3<f64>,
    lut_len: Array2<u32>,
}

/// Implement all the "getters" for the Python properties
#[pymethods]
impl SosResults {
    /// Top-of-atmosphere radiance in the view direction, (`num_points`, ).
    #[getter]
    fn toa<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        self.toa.to_pyarray(py)
    }

    /// Radiance in the view direction at the observation level,
    /// (`num_points`, ).
    #[getter]
    fn at_sensor<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        self.at_sensor.to_pyarray(py)
    }

    /// Principal-azimuth radiance per signed zenith slot,
    /// (`num_points`, `2 * n_gauss + 1`).
    #[getter]
    fn principal<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        self.principal.to_pyarray(py)
    }

    /// Radiance field, (`num_points`, `2 * n_gauss + 1`, `n_azimuth`).
    #[getter]
    fn field<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray3<f64>> {
        self.field.to_pyarray(py)
    }

    /// Scattering-angle lookup table values,
    /// (`num_points`, `n_gauss`, max samples).
    #[getter]
    fn lut<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray3<f64>> {
        self.lut.to_pyarray(py)
    }

    /// Relative azimuths realizing the lookup-table scattering angles,
    /// (`num_points`, `n_gauss`, max samples).
    #[getter]
    fn lut_azimuth<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray3<f64>> {
        self.lut_azimuth.to_pyarray(py)
    }

    /// Sampled scattering angles in degrees,
    /// (`num_points`, `n_gauss`, max samples).
    #[getter]
    fn lut_angle<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray3<f64>> {
        self.lut_angle.to_pyarray(py)
    }

    /// Valid sample count per lookup-table row, (`num_points`, `n_gauss`).
    #[getter]
    fn lut_len<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<u32>> {
        self.lut_len.to_pyarray(py)
    }
}

impl SosResults {
    fn new(num_points: usize, half: usize, n_azimuth: usize) -> Self {
        let slots = 2 * half + 1;
        Self {
            toa: Array1::zeros(num_points),
            at_sensor: Array1::zeros(num_points),
            principal: Array2::zeros([num_points, slots]),
            field: Array3::zeros([num_points, slots, n_azimuth]),
            lut: Array3::zeros([num_points, half, MAX_SCATTERING_SAMPLES]),
            lut_azimuth: Array3::zeros([num_points, half, MAX_SCATTERING_SAMPLES]),
            lut_angle: Array3::zeros([num_points, half, MAX_SCATTERING_SAMPLES]),
            lut_len: Array2::zeros([num_points, half]),
        }
    }
}

/// Compute the successive-orders radiative transfer solution for a batch of
/// atmospheres.
///
/// The following are per-point inputs and have shape (`num_points`, ):
///
/// `solar_cosine`: solar zenith cosine
///
/// `rayleigh_depth`: molecular optical depth of the column
///
/// `aerosol_depth`: aerosol optical depth of the column
///
/// `single_scattering_albedo`: aerosol single-scattering albedo
///
/// `aerosol_scale_height`: effective aerosol scale height in km
///
/// `sensor_altitude`: sensor altitude in km; 900 or more means the observer
/// is at the top of the atmosphere
///
/// `aerosol_moments` has shape (`num_moments`, ) and holds the Legendre
/// moments of the aerosol phase function, starting with `beta_0 = 1`.
///
/// The remaining scalars are shared run parameters: `n_gauss` zenith slots
/// per hemisphere, `n_azimuth` azimuth nodes, `n_layers` optical layers,
/// `view_cosine` the view zenith cosine and `principal_azimuth` the relative
/// azimuth (radians) of the scalar outputs.
///
/// The number of worker threads is controlled by `num_threads`. It must be a
/// positive integer, or `None` to automatically choose the number of
/// threads.
#[pyfunction]
#[pyo3(signature = (solar_cosine, rayleigh_depth, aerosol_depth, single_scattering_albedo, aerosol_scale_height, sensor_altitude, aerosol_moments, n_gauss, n_azimuth, n_layers, view_cosine, principal_azimuth, num_threads))]
#[allow(clippy::too_many_arguments)]
fn compute_sos(
    py: Python<'_>,
    solar_cosine: PyReadonlyArray1<'_, f64>,
    rayleigh_depth: PyReadonlyArray1<'_, f64>,
    aerosol_depth: PyReadonlyArray1<'_, f64>,
    single_scattering_albedo: PyReadonlyArray1<'_, f64>,
    aerosol_scale_height: PyReadonlyArray1<'_, f64>,
    sensor_altitude: PyReadonlyArray1<'_, f64>,
    aerosol_moments: PyReadonlyArray1<'_, f64>,
    n_gauss: usize,
    n_azimuth: usize,
    n_layers: usize,
    view_cosine: f64,
    principal_azimuth: f64,
    num_threads: Option<usize>,
) -> PyResult<SosResults> {
    let num_points = solar_cosine.len();

    // Check shapes of all inputs
    {
        let one_dim_points = &[
            rayleigh_depth.len(),
            aerosol_depth.len(),
            single_scattering_albedo.len(),
            aerosol_scale_height.len(),
            sensor_altitude.len(),
        ];
        if one_dim_points.iter().any(|&d| d != num_points) {
            return Err(SosError::InconsistentInputs.into());
        }
    }
    debug!("input shapes are consistent");

    let parameters = SosParameters::new(
        n_gauss,
        n_azimuth,
        n_layers,
        view_cosine,
        principal_azimuth,
    )?;
    let kernel = MomentKernel::new(aerosol_moments.as_slice()?.to_vec())?;

    let solar_cosine = solar_cosine.as_slice()?;
    let rayleigh_depth = rayleigh_depth.as_slice()?;
    let aerosol_depth = aerosol_depth.as_slice()?;
    let single_scattering_albedo = single_scattering_albedo.as_slice()?;
    let aerosol_scale_height = aerosol_scale_height.as_slice()?;
    let sensor_altitude = sensor_altitude.as_slice()?;

    let mut results = Vec::new();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads.unwrap_or(0))
        .build()
        .map_err(|e| PyValueError::new_err(e.to_string()))?;

    // These atomics keep track of how many points have finished and whether
    // it's time to cancel the computation or not
    let num_completed = AtomicUsize::new(0);
    let cancelled = AtomicBool::new(false);

    info!("Processing successive-orders solver for {num_points} atmospheres");

    pool.in_place_scope(|s| -> Result<(), PyErr> {
        s.spawn(|_| {
            (0..num_points)
                .into_par_iter()
                .map(|point| -> Result<_, SosError> {
                    if cancelled.load(Ordering::Relaxed) {
                        return Err(SosError::Cancelled);
                    }

                    let inputs = SosInputs::new(
                        rayleigh_depth[point],
                        aerosol_depth[point],
                        single_scattering_albedo[point],
                        aerosol_scale_height[point],
                        sensor_altitude[point],
                        solar_cosine[point],
                    )?;

                    inputs.run(&parameters, &kernel)
                })
                .inspect(|_| {
                    num_completed.fetch_add(1, Ordering::Relaxed);
                })
                .collect_into_vec(&mut results);
        });

        // The work is done in the thread pool, but back here in the main
        // thread, handle progress reporting and checking for early
        // cancellation
        while !cancelled.load(Ordering::Relaxed) {
            if let Err(e) = py.check_signals() {
                cancelled.store(true, Ordering::Relaxed);
                return Err(e);
            }

            let num_completed = num_completed.load(Ordering::Relaxed);
            let progress = num_completed as f64 / num_points as f64 * 100.;
            info!("Completed solver for {num_completed}/{num_points} points ({progress:0.2}%)");

            // All finished without cancelling early
            if num_completed == num_points {
                break;
            }

            py.allow_threads(|| {
                std::thread::sleep(Duration::from_secs(5));
            });
        }

        Ok(())
    })?;

    // Copy the intermediate results to the output arrays
    debug!("copying solver output");
    let mut output = SosResults::new(num_points, n_gauss, n_azimuth);
    results
        .into_iter()
        .enumerate()
        .try_for_each(|(index, point_output)| -> Result<_, SosError> {
            let SosOutputs {
                field,
                toa,
                at_sensor,
            } = point_output?;

            output.toa[index] = toa;
            output.at_sensor[index] = at_sensor;

            let rhs = ArrayView1::from(field.principal.as_slice());
            output.principal.index_axis_mut(Axis(0), index).assign(&rhs);

            output
                .field
                .index_axis_mut(Axis(0), index)
                .assign(&field.radiance);

            output
                .lut
                .index_axis_mut(Axis(0), index)
                .assign(&field.lut.reflectance);
            output
                .lut_azimuth
                .index_axis_mut(Axis(0), index)
                .assign(&field.lut.azimuth);
            output
                .lut_angle
                .index_axis_mut(Axis(0), index)
                .assign(&field.lut.angle_deg);
            for (row, &count) in field.lut.len.iter().enumerate() {
                output.lut_len[[index, row]] = count as u32;
            }

            Ok(())
        })?;

    Ok(output)
}

/// A Python module implemented in Rust.
#[pymodule]
fn atmos_sos(m: &Bound<'_, PyModule>) -> PyResult<()> {
    pyo3_log::init();

    m.add_function(wrap_pyfunction!(compute_sos, m)?)?;
    m.add_class::<SosResults>()?;
    Ok(())
}

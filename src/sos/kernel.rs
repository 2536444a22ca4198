//! Azimuthal Fourier kernels of the scattering phase functions.
//!
//! The phase function is decomposed into an azimuthal cosine series; each
//! Fourier order needs a redistribution matrix over pairs of zenith nodes.
//! The aerosol matrix comes from an external [`PhaseKernel`] collaborator
//! (the built-in [`MomentKernel`] expands Legendre moments through the
//! addition theorem); the Rayleigh term is analytic and only exists for
//! orders 0 to 2, so the engine assembles it itself from the helpers here.

use ndarray::Array2;

use super::angles::AngularGrid;
use crate::error::SosError;

/// Source of per-order aerosol redistribution matrices.
///
/// `fourier_matrix` returns a square matrix over all signed grid slots
/// (`grid.slot` maps a signed node index to a row/column); entry `(k, k')`
/// is the phase-function Fourier coefficient coupling incoming stream `k'`
/// to outgoing stream `k`. Same-hemisphere and opposite-hemisphere pairs are
/// covered by the sign of the node indices.
pub trait PhaseKernel {
    /// Highest Fourier order with any content; higher orders are zero.
    fn max_order(&self) -> usize;

    /// Redistribution matrix for one Fourier order.
    fn fourier_matrix(&self, order: usize, grid: &AngularGrid) -> Array2<f64>;
}

/// Aerosol kernel built from a Legendre-moment expansion of the phase
/// function, `p(Θ) = Σ_l β_l P_l(cos Θ)` with `β_0 = 1`.
#[derive(Debug, Clone)]
pub struct MomentKernel {
    moments: Vec<f64>,
}

impl MomentKernel {
    /// Wrap a moment sequence `β_0, β_1, ...`; `β_0` must be 1 (within
    /// rounding) for a normalized phase function.
    pub fn new(moments: Vec<f64>) -> Result<Self, SosError> {
        match moments.first() {
            Some(&b0) if (b0 - 1.0).abs() < 1e-6 => Ok(Self { moments }),
            _ => Err(SosError::InconsistentInputs),
        }
    }

    /// Isotropic scattering (a single unit moment).
    pub fn isotropic() -> Self {
        Self { moments: vec![1.0] }
    }
}

impl PhaseKernel for MomentKernel {
    fn max_order(&self) -> usize {
        self.moments.len() - 1
    }

    fn fourier_matrix(&self, order: usize, grid: &AngularGrid) -> Array2<f64> {
        let n = 2 * grid.half() + 1;
        let mut matrix = Array2::zeros((n, n));
        let lmax = self.moments.len() - 1;
        if order > lmax {
            return matrix;
        }

        // Λ_l^m at every slot, then the addition-theorem contraction
        // Σ_{l≥m} β_l Λ_l^m(μ) Λ_l^m(μ').
        let rows: Vec<Vec<f64>> = (-(grid.half() as i32)..=grid.half() as i32)
            .map(|k| normalized_assoc_legendre(order, lmax, grid.cosine(k)))
            .collect();

        for (i, row_i) in rows.iter().enumerate() {
            for (j, row_j) in rows.iter().enumerate() {
                let mut sum = 0.0;
                for l in order..=lmax {
                    sum += self.moments[l] * row_i[l - order] * row_j[l - order];
                }
                matrix[[i, j]] = sum;
            }
        }
        matrix
    }
}

/// Rayleigh mixing coefficients `(β_0, β_2)` for a depolarization factor.
pub(crate) fn rayleigh_betas(depolarization: f64) -> (f64, f64) {
    let beta2 = 0.5 * (1.0 - depolarization) / (1.0 + 2.0 * depolarization);
    (1.0, beta2)
}

/// `Λ_2^m` at every grid slot, or `None` for orders beyond the Rayleigh
/// content (the Rayleigh phase function has no moment above `l = 2`).
pub(crate) fn rayleigh_row(order: usize, grid: &AngularGrid) -> Option<Vec<f64>> {
    if order > 2 {
        return None;
    }
    Some(
        (-(grid.half() as i32)..=grid.half() as i32)
            .map(|k| {
                let values = normalized_assoc_legendre(order, 2, grid.cosine(k));
                values[2 - order]
            })
            .collect(),
    )
}

/// Normalized associated Legendre values `Λ_l^m(μ)` for `l = m..=lmax`.
///
/// `Λ_l^m = sqrt((l-m)!/(l+m)!) P_l^m`, the normalization for which the
/// addition theorem reads
/// `P_l(cos Θ) = Σ_m (2 - δ_m0) Λ_l^m(μ) Λ_l^m(μ') cos(mφ)`.
pub(crate) fn normalized_assoc_legendre(m: usize, lmax: usize, mu: f64) -> Vec<f64> {
    debug_assert!(lmax >= m);
    let mut values = Vec::with_capacity(lmax - m + 1);

    // Seed Λ_m^m = [sqrt((2m)!) / (2^m m!)] (1-μ²)^(m/2), built up as a
    // running product to stay finite for large m.
    let s = (1.0 - mu * mu).max(0.0).sqrt();
    let mut seed = 1.0;
    for i in 1..=m {
        let i = i as f64;
        seed *= ((2.0 * i - 1.0) / (2.0 * i)).sqrt() * s;
    }
    values.push(seed);

    if lmax == m {
        return values;
    }

    // Upward recurrence in degree:
    // sqrt((l+1)²-m²) Λ_{l+1} = (2l+1) μ Λ_l - sqrt(l²-m²) Λ_{l-1}
    let m2 = (m * m) as f64;
    let mut below = 0.0;
    let mut current = seed;
    for l in m..lmax {
        let l = l as f64;
        let above = ((2.0 * l + 1.0) * mu * current - (l * l - m2).sqrt() * below)
            / ((l + 1.0) * (l + 1.0) - m2).sqrt();
        below = current;
        current = above;
        values.push(current);
    }

    values
}

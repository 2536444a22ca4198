//! Angular discretization: Gauss quadrature over zenith cosines and the
//! signed-index direction grid shared by the solver and the kernels.

/// Fixed angular grid for one solver run.
///
/// Zenith slots are indexed by a signed node index `k` in `-half..=half`:
/// positive `k` is an upward stream, negative `k` the mirrored downward
/// stream. Two slots are reserved and carry zero quadrature weight: slot `0`
/// holds the solar beam direction (cosine `-mu_s`) and slots `±half` hold the
/// view direction (cosine `±mu_v`), so radiance is available exactly at the
/// observation geometry without interpolation.
#[derive(Debug, Clone)]
pub struct AngularGrid {
    half: usize,
    cosines: Vec<f64>,
    weights: Vec<f64>,
    azimuths: Vec<f64>,
}

impl AngularGrid {
    /// Build the grid for a (sun, view) geometry.
    ///
    /// `half` is the per-hemisphere slot count including the reserved view
    /// slot, so `half - 1` true Gauss nodes are placed on (0, 1). `n_azimuth`
    /// azimuth nodes are spaced uniformly on `[0, 2π)`.
    pub(crate) fn new(half: usize, n_azimuth: usize, mu_s: f64, mu_v: f64) -> Self {
        let n_gauss = half - 1;
        let (nodes, node_weights) = gauss_legendre_unit(n_gauss);

        let len = 2 * half + 1;
        let mut cosines = vec![0.0; len];
        let mut weights = vec![0.0; len];

        cosines[half] = -mu_s;
        for i in 1..half {
            cosines[half + i] = nodes[i - 1];
            cosines[half - i] = -nodes[i - 1];
            weights[half + i] = node_weights[i - 1];
            weights[half - i] = node_weights[i - 1];
        }
        cosines[2 * half] = mu_v;
        cosines[0] = -mu_v;

        let azimuths = (0..n_azimuth)
            .map(|j| 2.0 * std::f64::consts::PI * j as f64 / n_azimuth as f64)
            .collect();

        Self {
            half,
            cosines,
            weights,
            azimuths,
        }
    }

    /// Row/column slot of signed node `k` in kernel matrices.
    pub fn slot(&self, k: i32) -> usize {
        debug_assert!(k.unsigned_abs() as usize <= self.half);
        (k + self.half as i32) as usize
    }

    /// Per-hemisphere slot count (including the reserved view slot).
    pub fn half(&self) -> usize {
        self.half
    }

    /// Number of azimuth nodes.
    pub fn n_azimuth(&self) -> usize {
        self.azimuths.len()
    }

    /// Zenith cosine of signed node `k`.
    pub fn cosine(&self, k: i32) -> f64 {
        self.cosines[self.slot(k)]
    }

    /// Quadrature weight of signed node `k` (zero for the reserved slots).
    pub fn weight(&self, k: i32) -> f64 {
        self.weights[self.slot(k)]
    }

    /// Azimuth node `j` in radians.
    pub fn azimuth(&self, j: usize) -> f64 {
        self.azimuths[j]
    }

    /// All signed stream indices, excluding the solar slot `0`.
    pub fn streams(&self) -> impl Iterator<Item = i32> {
        let half = self.half as i32;
        (-half..=half).filter(|&k| k != 0)
    }
}

/// Per-direction vector indexed by signed zenith node.
///
/// A thin wrapper that keeps the signed-stream indexing explicit instead of
/// spreading `k + half` offset arithmetic through the solver.
#[derive(Debug, Clone)]
pub(crate) struct DirVec {
    half: i32,
    data: Vec<f64>,
}

impl DirVec {
    pub(crate) fn new(half: usize) -> Self {
        Self {
            half: half as i32,
            data: vec![0.0; 2 * half + 1],
        }
    }

    pub(crate) fn get(&self, k: i32) -> f64 {
        self.data[(k + self.half) as usize]
    }

    pub(crate) fn set(&mut self, k: i32, value: f64) {
        self.data[(k + self.half) as usize] = value;
    }

    pub(crate) fn add(&mut self, k: i32, value: f64) {
        self.data[(k + self.half) as usize] += value;
    }

    pub(crate) fn reset(&mut self) {
        self.data.fill(0.0);
    }
}

/// Gauss-Legendre nodes and weights on the unit interval (0, 1).
///
/// Roots of the degree-`n` Legendre polynomial found by Newton iteration on
/// the three-term recurrence, then mapped from (-1, 1) onto (0, 1). Nodes are
/// returned in increasing order.
pub(crate) fn gauss_legendre_unit(n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];

    for i in 0..n {
        // Tricomi's approximation as the starting guess
        let mut x = (std::f64::consts::PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let mut dp = 0.0;

        for _ in 0..100 {
            let mut p_prev = 1.0;
            let mut p = x;
            for l in 2..=n {
                let l = l as f64;
                let p_next = ((2.0 * l - 1.0) * x * p - (l - 1.0) * p_prev) / l;
                p_prev = p;
                p = p_next;
            }
            dp = n as f64 * (x * p - p_prev) / (x * x - 1.0);

            let dx = p / dp;
            x -= dx;
            if dx.abs() < 1e-14 {
                break;
            }
        }

        // Roots come out in decreasing order of x; store increasing
        nodes[n - 1 - i] = 0.5 * (1.0 + x);
        weights[n - 1 - i] = 1.0 / ((1.0 - x * x) * dp * dp);
    }

    (nodes, weights)
}

/// Possible solver errors.
#[derive(Debug)]
pub enum SosError {
    /// The inputs don't have the expected shape(s) or ranges
    InconsistentInputs,
    /// The layer bisection could not bracket an altitude for a target depth
    NoBracket,
    /// An array is not contiguous when it was assumed to be
    NotContiguous,
    /// The operation was aborted early
    Cancelled,
}

impl std::fmt::Display for SosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SosError::InconsistentInputs => {
                write!(f, "inputs to the solver have the wrong shape or range")
            }
            SosError::NoBracket => {
                write!(
                    f,
                    "layer discretization could not bracket a root; \
                     check the optical depth / scale height combination"
                )
            }
            SosError::NotContiguous => write!(f, "array slice not contiguous in memory"),
            SosError::Cancelled => write!(f, "operation cancelled early"),
        }
    }
}

impl std::error::Error for SosError {}

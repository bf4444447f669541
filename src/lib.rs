pub mod fitter;
pub mod gaussian_psf;
pub mod multi_plane;
pub mod peak;
pub mod psf_model;
pub mod residual;
pub mod solver;
pub mod spline_psf;

#[cfg(test)]
mod test_fitting;

// Re-export commonly used items
pub use fitter::{FitConfig, FitResult, FitState, FitStats, PeakKind};
pub use gaussian_psf::{GaussianMode, GaussianPsf};
pub use multi_plane::MultiPlaneFit;
pub use peak::{Peak, PeakStatus};
pub use psf_model::{PeakFailure, PsfModel};
pub use residual::ResidualImage;
pub use spline_psf::{SplinePsf, SplineTable};

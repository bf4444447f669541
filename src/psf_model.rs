/// PSF evaluator capability
///
/// Every PSF family plugs into the fitting drivers through the [`PsfModel`]
/// trait: shape evaluation over a peak's bounding box, Gauss-Newton
/// Jacobian/Hessian accumulation for the family's active parameter subset,
/// parameter validity checks and axial-range clamping. The drivers never
/// look inside a model; they only move peaks through the
/// subtract / solve / update / check / re-add cycle.
use nalgebra::{DMatrix, DVector};

use crate::fitter::FitConfig;
use crate::peak::Peak;
use crate::residual::ResidualImage;

/// Model scratch attached to each peak. The drivers treat this as opaque;
/// the residual store only needs the unit-height shape values.
#[derive(Debug, Clone)]
pub enum PeakShape {
    Gaussian(GaussianShape),
    Sampled(SampledShape),
}

/// Separable Gaussian scratch: per-column and per-row sub-pixel offsets and
/// their exponentials. The shape over the box is the outer product.
#[derive(Debug, Clone, Default)]
pub struct GaussianShape {
    pub xt: Vec<f64>,
    pub ext: Vec<f64>,
    pub yt: Vec<f64>,
    pub eyt: Vec<f64>,
    /// Squared width-versus-z polynomial terms, kept for the axial
    /// chain-rule factors.
    pub wx_term: f64,
    pub wy_term: f64,
}

/// Sampled-PSF scratch: the shape and its three spatial derivatives,
/// evaluated on the bounding-box grid at the current sub-pixel offsets.
#[derive(Debug, Clone, Default)]
pub struct SampledShape {
    pub shape: Vec<f64>,
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
    pub dz: Vec<f64>,
}

impl PeakShape {
    /// Unit-height model value at box row `j`, column `k`. `row_len` is the
    /// box width in pixels (2 * wx + 1).
    #[inline]
    pub fn value(&self, j: usize, k: usize, row_len: usize) -> f64 {
        match self {
            PeakShape::Gaussian(g) => g.eyt[j] * g.ext[k],
            PeakShape::Sampled(s) => s.shape[j * row_len + k],
        }
    }

    pub(crate) fn as_gaussian(&self) -> &GaussianShape {
        match self {
            PeakShape::Gaussian(g) => g,
            PeakShape::Sampled(_) => unreachable!("gaussian scratch expected"),
        }
    }

    pub(crate) fn as_gaussian_mut(&mut self) -> &mut GaussianShape {
        match self {
            PeakShape::Gaussian(g) => g,
            PeakShape::Sampled(_) => unreachable!("gaussian scratch expected"),
        }
    }

    pub(crate) fn as_sampled(&self) -> &SampledShape {
        match self {
            PeakShape::Sampled(s) => s,
            PeakShape::Gaussian(_) => unreachable!("sampled scratch expected"),
        }
    }

    pub(crate) fn as_sampled_mut(&mut self) -> &mut SampledShape {
        match self {
            PeakShape::Sampled(s) => s,
            PeakShape::Gaussian(_) => unreachable!("sampled scratch expected"),
        }
    }
}

/// Why a peak failed a validity check. Each kind maps onto one diagnostic
/// counter in the fit statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakFailure {
    /// The Gauss-Newton system was not positive definite.
    Solver,
    /// The integer anchor drifted into the image border band.
    Margin,
    NegativeHeight,
    NegativeWidth,
    /// The modeled pixel rate went non-positive, the log-likelihood is
    /// undefined there.
    NegativeModel,
    /// The damping ramp ran out without a decreasing error.
    NonDecreasing,
}

/// Capability surface shared by all PSF families.
pub trait PsfModel {
    /// Number of active parameters in the update system (n <= 6).
    fn jac_size(&self) -> usize;

    /// Whether update vectors follow the five-parameter convention
    /// [HEIGHT, XCENTER, YCENTER, ZCENTER, BACKGROUND] required by the
    /// multi-plane coordinator.
    fn five_param_convention(&self) -> bool;

    /// Prepare a freshly appended peak: width parameters (from the given
    /// sigmas where the family uses them), bounding-box half-widths and
    /// shape scratch. Position parameters and the anchor are already set.
    fn init_peak(&self, peak: &mut Peak, sigmas: Option<(f64, f64)>, config: &FitConfig);

    /// Recompute the shape scratch for the current parameters and anchor.
    /// Must be called before the peak is added to the residual store.
    fn calc_shape(&self, peak: &mut Peak);

    /// Accumulate the Jacobian vector and Gauss-Newton Hessian of the
    /// likelihood surrogate over the peak's bounding box. The peak is
    /// expected to be currently added to the residual store.
    fn calc_jh(
        &self,
        image: &ResidualImage,
        peak: &Peak,
        jacobian: &mut DVector<f64>,
        hessian: &mut DMatrix<f64>,
    );

    /// Map a solved update vector onto the parameter array.
    fn apply_deltas(&self, peak: &mut Peak, deltas: &DVector<f64>, use_clamp: bool);

    /// Validate the current parameters. Ok means the update may be kept.
    fn check(&self, peak: &Peak) -> Result<(), PeakFailure>;

    /// Clamp the axial coordinate into the model's valid range. A no-op for
    /// purely lateral families.
    fn clamp_z(&self, peak: &mut Peak);

    /// Refresh bounding-box half-widths (and width parameters derived from
    /// z) after an accepted update. A no-op for fixed-extent families.
    fn update_bounds(&self, peak: &mut Peak, config: &FitConfig);

    /// Convert a stored width parameter into the units reported in result
    /// records.
    fn report_width(&self, width_param: f64) -> f64 {
        width_param
    }

    /// Offset between this family's position convention and pixel-centered
    /// coordinates, used when affine maps are applied across channels.
    fn xoff(&self) -> f64 {
        0.0
    }

    fn yoff(&self) -> f64 {
        0.0
    }
}

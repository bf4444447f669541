/// Peak data model for multi-emitter fitting
///
/// A peak is one emitter hypothesis under refinement. The seven fit
/// parameters live in a fixed-order array so that update vectors, clamp
/// values and result records can be addressed by index.
use serde::Serialize;

use crate::psf_model::PeakShape;

/// Number of fitted parameters per peak.
pub const NUM_PARAMS: usize = 7;

/// Number of values in a full peak record (parameters + status + error).
pub const RECORD_LEN: usize = 9;

/// Parameter indices into [`Peak::params`] and the clamp arrays.
pub const HEIGHT: usize = 0;
pub const XCENTER: usize = 1;
pub const XWIDTH: usize = 2;
pub const YCENTER: usize = 3;
pub const YWIDTH: usize = 4;
pub const BACKGROUND: usize = 5;
pub const ZCENTER: usize = 6;

/// Starting Levenberg-Marquardt damping for a fresh peak.
pub const LAMBDA_START: f64 = 1.0;

/// Lifecycle state of a peak. `Running` peaks are still being refined;
/// `Converged` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeakStatus {
    Running,
    Converged,
    Error,
    Bad,
}

impl PeakStatus {
    /// Numeric code used in flat result records.
    pub fn code(self) -> f64 {
        match self {
            PeakStatus::Running => 0.0,
            PeakStatus::Converged => 1.0,
            PeakStatus::Error => 2.0,
            PeakStatus::Bad => 3.0,
        }
    }

    /// Decode the status field of a flat peak record. Unknown codes map to
    /// `Error` so a malformed record can never re-enter the fit.
    pub fn from_code(code: f64) -> PeakStatus {
        match code as i64 {
            0 => PeakStatus::Running,
            1 => PeakStatus::Converged,
            3 => PeakStatus::Bad,
            _ => PeakStatus::Error,
        }
    }
}

/// One emitter under fit.
#[derive(Debug, Clone)]
pub struct Peak {
    pub status: PeakStatus,
    /// Integer pixel anchor of the bounding box.
    pub xi: i64,
    pub yi: i64,
    /// Bounding-box half-widths, capped by the fit margin.
    pub wx: i64,
    pub wy: i64,
    /// Fit parameters, indexed by the constants above.
    pub params: [f64; NUM_PARAMS],
    /// Log-likelihood surrogate for the current and previous outer step.
    pub error: f64,
    pub error_old: f64,
    /// Per-parameter step limiter magnitudes.
    pub clamp: [f64; NUM_PARAMS],
    /// Sign of the last applied delta per parameter; 0 until first update.
    pub sign: [i8; NUM_PARAMS],
    /// Levenberg-Marquardt damping.
    pub lambda: f64,
    /// Whether this peak's shape is currently summed into the residual store.
    pub added: bool,
    /// Model-specific shape and derivative scratch.
    pub shape: PeakShape,
}

impl Peak {
    pub fn new(shape: PeakShape) -> Self {
        Peak {
            status: PeakStatus::Running,
            xi: 0,
            yi: 0,
            wx: 1,
            wy: 1,
            params: [0.0; NUM_PARAMS],
            error: 0.0,
            error_old: 0.0,
            clamp: [1.0; NUM_PARAMS],
            sign: [0; NUM_PARAMS],
            lambda: LAMBDA_START,
            added: false,
            shape,
        }
    }

    /// Apply one solved delta to a parameter.
    ///
    /// With clamping enabled the step is limited to roughly the clamp
    /// magnitude, and a sign reversal relative to the previous step halves
    /// the clamp. This damps the oscillation that otherwise develops when a
    /// peak straddles two pixels.
    pub fn update_param(&mut self, index: usize, delta: f64, use_clamp: bool) {
        if delta == 0.0 {
            return;
        }
        if use_clamp {
            if self.sign[index] != 0 {
                if (self.sign[index] == 1 && delta < 0.0)
                    || (self.sign[index] == -1 && delta > 0.0)
                {
                    self.clamp[index] *= 0.5;
                }
            }
            self.sign[index] = if delta > 0.0 { 1 } else { -1 };
            self.params[index] -= delta / (1.0 + delta.abs() / self.clamp[index]);
        } else {
            self.params[index] -= delta;
        }
    }

    /// Move the integer anchor after a sub-pixel position update, with
    /// hysteresis so the bounding box does not flicker between adjacent
    /// pixels. This is the truncating form used by the single-channel
    /// drivers: the anchor only moves once the sub-pixel center is well
    /// clear of the current pixel.
    pub fn update_anchor_floor(&mut self, hysteresis: f64) {
        if (self.params[XCENTER] - self.xi as f64 - 0.5).abs() > hysteresis {
            self.xi = self.params[XCENTER] as i64;
        }
        if (self.params[YCENTER] - self.yi as f64 - 0.5).abs() > hysteresis {
            self.yi = self.params[YCENTER] as i64;
        }
    }

    /// Rounding anchor update used by the multi-plane coordinator, whose
    /// position convention centers the anchor on the sub-pixel estimate.
    pub fn update_anchor_round(&mut self, hysteresis: f64) {
        if (self.params[XCENTER] - self.xi as f64).abs() > hysteresis {
            self.xi = self.params[XCENTER].round() as i64;
        }
        if (self.params[YCENTER] - self.yi as f64).abs() > hysteresis {
            self.yi = self.params[YCENTER].round() as i64;
        }
    }
}

/// Fit state and single-channel iteration drivers
///
/// A [`FitState`] owns one channel's residual store, its PSF model and the
/// peak set, and drives the per-peak refinement cycle: evaluate the
/// Gauss-Newton system on the live residual, subtract the peak, solve,
/// update, validate, re-add. Two drivers are provided: the original
/// clamped iteration and a Levenberg-Marquardt variant with an explicit
/// accept/reject step.
use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::debug;

use crate::peak::{
    Peak, PeakStatus, BACKGROUND, HEIGHT, NUM_PARAMS, RECORD_LEN, XCENTER, XWIDTH, YCENTER,
    YWIDTH, ZCENTER,
};
use crate::psf_model::{PeakFailure, PeakShape, PsfModel};
use crate::residual::ResidualImage;
use crate::solver;

/// Per-fit-state configuration. These were compile-time globals in older
/// fitters; carrying them per state keeps concurrent fits independent.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Border band in pixels; also the maximum bounding-box half-width.
    pub margin: usize,
    /// Anchor / box-resize hysteresis threshold.
    pub hysteresis: f64,
    /// Whether the original driver limits steps with the parameter clamp.
    pub use_clamp: bool,
    /// Damping ramp factors for the Levenberg-Marquardt drivers.
    pub lambda_up: f64,
    pub lambda_down: f64,
    /// Smallest allowed peak height when heights are floored rather than
    /// rejected.
    pub height_floor: f64,
    /// Retry budget for one Levenberg-Marquardt peak update.
    pub max_lm_cycles: usize,
    /// Relative error change below which a peak has converged.
    pub tolerance: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            margin: 10,
            hysteresis: 0.6,
            use_clamp: true,
            lambda_up: 4.0,
            lambda_down: 0.9,
            height_floor: 0.01,
            max_lm_cycles: 50,
            tolerance: 1e-6,
        }
    }
}

/// Diagnostic counters for one fit state, reset with each new frame.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FitStats {
    /// Peaks lost to a non-positive-definite update system.
    pub n_dposv: usize,
    /// Peaks lost to the image border band.
    pub n_margin: usize,
    /// Peaks lost to a non-positive modeled rate.
    pub n_neg_fi: usize,
    pub n_neg_height: usize,
    pub n_neg_width: usize,
    /// Levenberg-Marquardt retries that failed to decrease the error.
    pub n_non_decr: usize,
    /// Total update cycles across all peaks.
    pub n_iterations: usize,
}

impl FitStats {
    pub(crate) fn record(&mut self, failure: PeakFailure) {
        match failure {
            PeakFailure::Solver => self.n_dposv += 1,
            PeakFailure::Margin => self.n_margin += 1,
            PeakFailure::NegativeHeight => self.n_neg_height += 1,
            PeakFailure::NegativeWidth => self.n_neg_width += 1,
            PeakFailure::NegativeModel => self.n_neg_fi += 1,
            PeakFailure::NonDecreasing => self.n_non_decr += 1,
        }
    }
}

/// Layout of candidate records handed to [`FitState::new_peaks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakKind {
    /// Finder output: (x, y, z) triples, height and background estimated
    /// from the current residual.
    Finder,
    /// Synthetic test candidates, same layout as finder output.
    Testing,
    /// Previously stored localizations: (x, y, z, height, background).
    Hdf5,
}

impl PeakKind {
    fn stride(self) -> usize {
        match self {
            PeakKind::Finder | PeakKind::Testing => 3,
            PeakKind::Hdf5 => 5,
        }
    }
}

/// One harvested localization.
#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    pub height: f64,
    pub x: f64,
    pub sigma_x: f64,
    pub y: f64,
    pub sigma_y: f64,
    pub background: f64,
    pub z: f64,
    pub status: PeakStatus,
    pub error: f64,
}

struct Candidate {
    x: f64,
    y: f64,
    z: f64,
    height: Option<f64>,
    background: Option<f64>,
    sigmas: Option<(f64, f64)>,
    status: PeakStatus,
    error: f64,
}

/// One channel's fitting state.
pub struct FitState {
    config: FitConfig,
    clamp_start: [f64; NUM_PARAMS],
    model: Box<dyn PsfModel>,
    image: ResidualImage,
    peaks: Vec<Peak>,
    stats: FitStats,
}

impl FitState {
    /// Create a fit state for `width` x `height` frames. `variance` is the
    /// per-pixel sCMOS variance / gain^2 term; `clamp` the starting step
    /// limits in parameter order.
    pub fn new(
        model: Box<dyn PsfModel>,
        variance: &[f64],
        clamp: &[f64; NUM_PARAMS],
        tolerance: f64,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        let config = FitConfig {
            tolerance,
            ..FitConfig::default()
        };
        Self::with_config(model, variance, clamp, config, width, height)
    }

    pub fn with_config(
        model: Box<dyn PsfModel>,
        variance: &[f64],
        clamp: &[f64; NUM_PARAMS],
        config: FitConfig,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        if width <= 2 * config.margin || height <= 2 * config.margin {
            return Err(anyhow!(
                "{}x{} image has no interior inside a margin of {}",
                width,
                height,
                config.margin
            ));
        }
        Ok(FitState {
            config,
            clamp_start: *clamp,
            model,
            image: ResidualImage::new(variance, width, height)?,
            peaks: Vec::new(),
            stats: FitStats::default(),
        })
    }

    /// Supply the next frame. The peak set and diagnostics restart with the
    /// frame; candidates are appended afterwards with `new_peaks`.
    pub fn new_image(&mut self, pixels: &[f64]) -> Result<()> {
        self.image.new_image(pixels)?;
        self.peaks.clear();
        self.stats = FitStats::default();
        Ok(())
    }

    /// Append candidate peaks in one of the flat record layouts.
    pub fn new_peaks(&mut self, params: &[f64], kind: PeakKind) -> Result<()> {
        let stride = kind.stride();
        if params.len() % stride != 0 {
            return Err(anyhow!(
                "candidate array length {} is not a multiple of {}",
                params.len(),
                stride
            ));
        }
        let start = self.peaks.len();
        for chunk in params.chunks_exact(stride) {
            let (height, background) = match kind {
                PeakKind::Finder | PeakKind::Testing => (None, None),
                PeakKind::Hdf5 => (Some(chunk[3]), Some(chunk[4])),
            };
            self.append_candidate(Candidate {
                x: chunk[0],
                y: chunk[1],
                z: chunk[2],
                height,
                background,
                sigmas: None,
                status: PeakStatus::Running,
                error: 0.0,
            });
        }
        for i in start..self.peaks.len() {
            self.error_and_convergence_pass(i);
        }
        Ok(())
    }

    /// Append candidates from full nine-wide records (seven parameters plus
    /// status and stored error), the layout also used by `results`.
    pub fn new_peaks_full(&mut self, records: &[f64]) -> Result<()> {
        if records.len() % RECORD_LEN != 0 {
            return Err(anyhow!(
                "record array length {} is not a multiple of {}",
                records.len(),
                RECORD_LEN
            ));
        }
        let start = self.peaks.len();
        for chunk in records.chunks_exact(RECORD_LEN) {
            let status = PeakStatus::from_code(chunk[7]);
            let error = if status == PeakStatus::Running {
                0.0
            } else {
                chunk[8]
            };
            self.append_candidate(Candidate {
                x: chunk[XCENTER],
                y: chunk[YCENTER],
                z: chunk[ZCENTER],
                height: Some(chunk[HEIGHT]),
                background: Some(chunk[BACKGROUND]),
                sigmas: Some((chunk[XWIDTH], chunk[YWIDTH])),
                status,
                error,
            });
        }
        for i in start..self.peaks.len() {
            self.error_and_convergence_pass(i);
        }
        Ok(())
    }

    fn append_candidate(&mut self, cand: Candidate) {
        let mut peak = Peak::new(PeakShape::Gaussian(Default::default()));
        peak.clamp = self.clamp_start;
        peak.status = cand.status;
        peak.error = cand.error;
        peak.error_old = cand.error;
        peak.params[XCENTER] = cand.x;
        peak.params[YCENTER] = cand.y;
        peak.params[ZCENTER] = cand.z;
        peak.xi = cand.x as i64;
        peak.yi = cand.y as i64;

        // Reject before touching pixel data so out-of-image candidates are
        // safe to pass in.
        if self.outside_margin(peak.xi, peak.yi) {
            debug!(x = cand.x, y = cand.y, "candidate outside fit margin");
            peak.status = PeakStatus::Error;
            self.stats.n_margin += 1;
            self.peaks.push(peak);
            return;
        }

        self.model.init_peak(&mut peak, cand.sigmas, &self.config);
        let background = cand
            .background
            .unwrap_or_else(|| {
                self.image
                    .box_min_observed(peak.xi, peak.yi, peak.wx, peak.wy)
                    .max(1.0)
            });
        let height = cand.height.unwrap_or_else(|| {
            (self.image.observed_raw(peak.xi, peak.yi) - background).max(self.config.height_floor)
        });
        peak.params[BACKGROUND] = background;
        peak.params[HEIGHT] = height;

        if peak.status != PeakStatus::Error {
            self.model.calc_shape(&mut peak);
            self.image.add_peak(&mut peak);
        }
        self.peaks.push(peak);
    }

    fn outside_margin(&self, xi: i64, yi: i64) -> bool {
        let m = self.config.margin as i64;
        xi < m
            || xi > self.image.width() as i64 - m - 1
            || yi < m
            || yi > self.image.height() as i64 - m - 1
    }

    /// One pass of the original clamped iteration: update every running
    /// peak in array order, then recompute errors and test convergence.
    pub fn iterate(&mut self) {
        for i in 0..self.peaks.len() {
            self.update_peak_original(i);
        }
        for i in 0..self.peaks.len() {
            self.error_and_convergence_pass(i);
        }
    }

    fn update_peak_original(&mut self, i: usize) {
        if self.peaks[i].status != PeakStatus::Running {
            return;
        }
        let n = self.model.jac_size();
        let mut jacobian = DVector::zeros(n);
        let mut hessian = DMatrix::zeros(n, n);
        self.model
            .calc_jh(&self.image, &self.peaks[i], &mut jacobian, &mut hessian);
        self.image.subtract_peak(&mut self.peaks[i]);
        self.stats.n_iterations += 1;

        let deltas = match solver::solve_spd(hessian, &jacobian) {
            Some(d) => d,
            None => {
                debug!(peak = i, "update system not positive definite");
                self.peaks[i].status = PeakStatus::Error;
                self.stats.n_dposv += 1;
                return;
            }
        };

        self.model
            .apply_deltas(&mut self.peaks[i], &deltas, self.config.use_clamp);
        self.peaks[i].update_anchor_floor(self.config.hysteresis);
        self.flag_invalid(i);
        self.model.clamp_z(&mut self.peaks[i]);

        if self.peaks[i].status != PeakStatus::Error {
            self.model.update_bounds(&mut self.peaks[i], &self.config);
            self.model.calc_shape(&mut self.peaks[i]);
            self.image.add_peak(&mut self.peaks[i]);
        }
    }

    fn flag_invalid(&mut self, i: usize) {
        if self.outside_margin(self.peaks[i].xi, self.peaks[i].yi) {
            debug!(
                x = self.peaks[i].params[XCENTER],
                y = self.peaks[i].params[YCENTER],
                "peak drifted outside fit margin"
            );
            self.peaks[i].status = PeakStatus::Error;
            self.stats.n_margin += 1;
        }
        if let Err(failure) = self.model.check(&self.peaks[i]) {
            self.peaks[i].status = PeakStatus::Error;
            self.stats.record(failure);
        }
    }

    fn error_and_convergence_pass(&mut self, i: usize) {
        if self.peaks[i].status != PeakStatus::Running {
            return;
        }
        if !self.image.calc_error(&mut self.peaks[i]) {
            self.stats.n_neg_fi += 1;
            if self.peaks[i].added {
                self.image.subtract_peak(&mut self.peaks[i]);
            }
            self.peaks[i].status = PeakStatus::Error;
            return;
        }
        let peak = &mut self.peaks[i];
        if peak.error_old != 0.0
            && ((peak.error - peak.error_old).abs() / peak.error_old) < self.config.tolerance
        {
            peak.status = PeakStatus::Converged;
        }
    }

    /// One pass of the Levenberg-Marquardt driver: each running peak is
    /// refined on a working copy, with the damping ramped up until an
    /// update is accepted, convergence is declared, or the retry budget is
    /// spent.
    pub fn iterate_lm(&mut self) {
        for i in 0..self.peaks.len() {
            self.update_peak_lm(i);
        }
    }

    fn update_peak_lm(&mut self, i: usize) {
        if self.peaks[i].status != PeakStatus::Running {
            return;
        }
        let n = self.model.jac_size();
        let mut working = self.peaks[i].clone();

        if !self.image.calc_error(&mut working) {
            self.stats.n_neg_fi += 1;
            self.image.subtract_peak(&mut working);
            working.status = PeakStatus::Error;
            self.peaks[i] = working;
            return;
        }
        let starting_error = working.error;

        let mut jacobian = DVector::zeros(n);
        let mut hessian = DMatrix::zeros(n, n);
        self.model
            .calc_jh(&self.image, &working, &mut jacobian, &mut hessian);
        self.image.subtract_peak(&mut working);

        let mut cycles = 0;
        loop {
            cycles += 1;
            self.stats.n_iterations += 1;
            working.status = PeakStatus::Running;

            let mut damped = hessian.clone();
            for d in 0..n {
                damped[(d, d)] *= 1.0 + working.lambda;
            }
            let deltas = match solver::solve_spd(damped, &jacobian) {
                Some(d) => d,
                None => {
                    self.stats.n_dposv += 1;
                    working.status = PeakStatus::Error;
                    working.lambda *= self.config.lambda_up;
                    if cycles >= self.config.max_lm_cycles {
                        break;
                    }
                    continue;
                }
            };

            self.model.apply_deltas(&mut working, &deltas, false);
            working.update_anchor_floor(self.config.hysteresis);
            if self.outside_margin(working.xi, working.yi) {
                working.status = PeakStatus::Error;
                self.stats.n_margin += 1;
            }
            if let Err(failure) = self.model.check(&working) {
                working.status = PeakStatus::Error;
                self.stats.record(failure);
            }
            self.model.clamp_z(&mut working);
            if working.status == PeakStatus::Error {
                working = Self::reset_working(&self.peaks[i], working.lambda * self.config.lambda_up);
                if cycles >= self.config.max_lm_cycles {
                    break;
                }
                continue;
            }

            self.model.update_bounds(&mut working, &self.config);
            self.model.calc_shape(&mut working);
            self.image.add_peak(&mut working);

            if !self.image.calc_error(&mut working) {
                self.stats.n_neg_fi += 1;
                self.image.subtract_peak(&mut working);
                working = Self::reset_working(&self.peaks[i], working.lambda * self.config.lambda_up);
                if cycles >= self.config.max_lm_cycles {
                    break;
                }
                continue;
            }

            let current_error = working.error;
            if current_error > starting_error {
                // Usually the damping has grown so large that the peak
                // barely moves; treat a tiny relative increase as done.
                if (current_error - starting_error) / starting_error < self.config.tolerance {
                    working.status = PeakStatus::Converged;
                    break;
                }
                self.stats.n_non_decr += 1;
                self.image.subtract_peak(&mut working);
                working = Self::reset_working(&self.peaks[i], working.lambda * self.config.lambda_up);
                if cycles >= self.config.max_lm_cycles {
                    break;
                }
                continue;
            }
            if (starting_error - current_error) / starting_error < self.config.tolerance {
                working.status = PeakStatus::Converged;
            } else {
                working.lambda *= self.config.lambda_down;
            }
            break;
        }
        self.peaks[i] = working;
    }

    /// Roll a working peak back to its committed state, keeping the ramped
    /// damping. The peak stays flagged until an update survives the checks.
    fn reset_working(committed: &Peak, lambda: f64) -> Peak {
        let mut peak = committed.clone();
        peak.lambda = lambda;
        peak.added = false;
        peak.status = PeakStatus::Error;
        peak
    }

    /// Number of peaks still being refined.
    pub fn unconverged(&self) -> usize {
        self.peaks
            .iter()
            .filter(|p| p.status == PeakStatus::Running)
            .count()
    }

    /// Flat nine-wide result records in peak order.
    pub fn results(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.peaks.len() * RECORD_LEN);
        for peak in &self.peaks {
            out.push(peak.params[HEIGHT]);
            out.push(peak.params[XCENTER]);
            out.push(self.model.report_width(peak.params[XWIDTH]));
            out.push(peak.params[YCENTER]);
            out.push(self.model.report_width(peak.params[YWIDTH]));
            out.push(peak.params[BACKGROUND]);
            out.push(peak.params[ZCENTER]);
            out.push(peak.status.code());
            out.push(peak.error);
        }
        out
    }

    /// Structured result records, convenient for serialization.
    pub fn result_records(&self) -> Vec<FitResult> {
        self.peaks
            .iter()
            .map(|peak| FitResult {
                height: peak.params[HEIGHT],
                x: peak.params[XCENTER],
                sigma_x: self.model.report_width(peak.params[XWIDTH]),
                y: peak.params[YCENTER],
                sigma_y: self.model.report_width(peak.params[YWIDTH]),
                background: peak.params[BACKGROUND],
                z: peak.params[ZCENTER],
                status: peak.status,
                error: peak.error,
            })
            .collect()
    }

    /// Current residual image (observed minus reconstructed foreground).
    pub fn residual(&self) -> Vec<f64> {
        self.image.residual()
    }

    pub fn stats(&self) -> &FitStats {
        &self.stats
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub(crate) fn peaks_mut(&mut self) -> &mut Vec<Peak> {
        &mut self.peaks
    }

    pub(crate) fn model(&self) -> &dyn PsfModel {
        self.model.as_ref()
    }

    pub(crate) fn image(&self) -> &ResidualImage {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut ResidualImage {
        &mut self.image
    }

    pub(crate) fn stats_mut(&mut self) -> &mut FitStats {
        &mut self.stats
    }

    /// Error update for an externally managed working peak, without the
    /// convergence test. Used by the coordinated drivers.
    pub(crate) fn calc_error_working(&mut self, peak: &mut Peak) -> bool {
        if !self.image.calc_error(peak) {
            self.stats.n_neg_fi += 1;
            peak.status = PeakStatus::Error;
            return false;
        }
        true
    }

    /// Error update plus convergence test for an externally managed peak.
    pub(crate) fn calc_error_convergence(&mut self, peak: &mut Peak) -> bool {
        if peak.status != PeakStatus::Running {
            return true;
        }
        if !self.image.calc_error(peak) {
            self.stats.n_neg_fi += 1;
            peak.status = PeakStatus::Error;
            return false;
        }
        if peak.error_old != 0.0
            && ((peak.error - peak.error_old).abs() / peak.error_old) < self.config.tolerance
        {
            peak.status = PeakStatus::Converged;
        }
        true
    }

    /// Margin test for an externally managed working peak.
    pub(crate) fn working_outside_margin(&self, peak: &Peak) -> bool {
        self.outside_margin(peak.xi, peak.yi)
    }
}

/// Multi-plane coordinator
///
/// Fits the same emitters across several co-registered optical channels.
/// Each logical emitter is represented by one peak per channel at the same
/// index; the coordinator keeps those groups synchronized: shared status,
/// shared axial position, optionally shared height, and lateral positions
/// related by per-channel affine maps calibrated against channel 0.
/// Per-channel update vectors are combined into one coherent group update
/// using z-dependent channel weights.
use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::fitter::{FitConfig, FitState, PeakKind};
use crate::peak::{Peak, PeakStatus, BACKGROUND, HEIGHT, NUM_PARAMS, XCENTER, YCENTER, ZCENTER};
use crate::psf_model::PsfModel;
use crate::solver;

/// Update-vector component order shared by all coordinated models.
const D_HEIGHT: usize = 0;
const D_XCENTER: usize = 1;
const D_YCENTER: usize = 2;
const D_ZCENTER: usize = 3;
const D_BACKGROUND: usize = 4;
const JAC_SIZE: usize = 5;

pub struct MultiPlaneFit {
    n_channels: usize,
    independent_heights: bool,
    config: FitConfig,
    clamp_start: [f64; NUM_PARAMS],
    width: usize,
    height: usize,
    channels: Vec<FitState>,
    /// Affine triples (constant, y-linear, x-linear) per channel. The
    /// "x transforms" produce y coordinates and vice versa; this axis swap
    /// matches the calibration convention and must not be "corrected".
    xt_0to_n: Vec<[f64; 3]>,
    yt_0to_n: Vec<[f64; 3]>,
    xt_nto0: Vec<[f64; 3]>,
    yt_nto0: Vec<[f64; 3]>,
    /// Channel weights per z bin, channel-fast layout. Backgrounds float
    /// independently, so the background weights are stored but not consumed
    /// by the current update rule.
    #[allow(dead_code)]
    w_bg: Vec<f64>,
    w_h: Vec<f64>,
    w_x: Vec<f64>,
    w_y: Vec<f64>,
    w_z: Vec<f64>,
    n_weights: usize,
    w_z_offset: f64,
    w_z_scale: f64,
    /// Per-channel height factors feeding the weighted averages; all 1.0 in
    /// fixed-height mode, the latest fitted heights otherwise.
    heights: Vec<f64>,
}

impl MultiPlaneFit {
    pub fn new(
        clamp: &[f64; NUM_PARAMS],
        tolerance: f64,
        n_channels: usize,
        independent_heights: bool,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        if n_channels == 0 {
            return Err(anyhow!("at least one channel is required"));
        }
        let config = FitConfig {
            tolerance,
            ..FitConfig::default()
        };
        // Identity maps until calibration transforms are supplied; note the
        // swapped-axis convention.
        let identity_y = [0.0, 0.0, 1.0];
        let identity_x = [0.0, 1.0, 0.0];
        Ok(MultiPlaneFit {
            n_channels,
            independent_heights,
            config,
            clamp_start: *clamp,
            width,
            height,
            channels: Vec::with_capacity(n_channels),
            xt_0to_n: vec![identity_x; n_channels],
            yt_0to_n: vec![identity_y; n_channels],
            xt_nto0: vec![identity_x; n_channels],
            yt_nto0: vec![identity_y; n_channels],
            w_bg: vec![1.0; n_channels],
            w_h: vec![1.0; n_channels],
            w_x: vec![1.0; n_channels],
            w_y: vec![1.0; n_channels],
            w_z: vec![1.0; n_channels],
            n_weights: 1,
            w_z_offset: 0.0,
            w_z_scale: 0.0,
            heights: vec![1.0; n_channels],
        })
    }

    /// Attach the next channel's PSF model and sCMOS calibration. Models
    /// must use the five-parameter update convention.
    pub fn add_channel(&mut self, model: Box<dyn PsfModel>, variance: &[f64]) -> Result<()> {
        if self.channels.len() == self.n_channels {
            return Err(anyhow!("all {} channels already configured", self.n_channels));
        }
        if !model.five_param_convention() {
            return Err(anyhow!(
                "channel models must use the height/x/y/z/background update convention"
            ));
        }
        let state = FitState::with_config(
            model,
            variance,
            &self.clamp_start,
            self.config.clone(),
            self.width,
            self.height,
        )?;
        self.channels.push(state);
        Ok(())
    }

    /// Set the affine transforms between channel-0 coordinates and each
    /// channel, three coefficients per channel per direction.
    pub fn set_transforms(
        &mut self,
        xt_0to_n: &[f64],
        yt_0to_n: &[f64],
        xt_nto0: &[f64],
        yt_nto0: &[f64],
    ) -> Result<()> {
        let expect = 3 * self.n_channels;
        for (name, t) in [
            ("xt_0toN", xt_0to_n),
            ("yt_0toN", yt_0to_n),
            ("xt_Nto0", xt_nto0),
            ("yt_Nto0", yt_nto0),
        ] {
            if t.len() != expect {
                return Err(anyhow!("{} has {} coefficients, expected {}", name, t.len(), expect));
            }
        }
        let triples = |t: &[f64]| -> Vec<[f64; 3]> {
            t.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
        };
        self.xt_0to_n = triples(xt_0to_n);
        self.yt_0to_n = triples(yt_0to_n);
        self.xt_nto0 = triples(xt_nto0);
        self.yt_nto0 = triples(yt_nto0);
        Ok(())
    }

    /// Set the z-dependent channel weights used when averaging per-channel
    /// updates. Arrays are indexed by z bin (slow) then channel (fast).
    pub fn set_weights(
        &mut self,
        w_bg: &[f64],
        w_h: &[f64],
        w_x: &[f64],
        w_y: &[f64],
        w_z: &[f64],
        z_size: usize,
    ) -> Result<()> {
        let expect = z_size * self.n_channels;
        for (name, w) in [("w_bg", w_bg), ("w_h", w_h), ("w_x", w_x), ("w_y", w_y), ("w_z", w_z)] {
            if w.len() != expect {
                return Err(anyhow!("{} has {} values, expected {}", name, w.len(), expect));
            }
        }
        self.w_bg = w_bg.to_vec();
        self.w_h = w_h.to_vec();
        self.w_x = w_x.to_vec();
        self.w_y = w_y.to_vec();
        self.w_z = w_z.to_vec();
        self.n_weights = z_size;
        self.heights = vec![1.0; self.n_channels];
        Ok(())
    }

    /// Set the conversion from a peak z value to a weight-array bin.
    pub fn set_weights_indexing(&mut self, z_offset: f64, z_scale: f64) {
        self.w_z_offset = z_offset;
        self.w_z_scale = z_scale;
    }

    pub fn channel(&self, index: usize) -> &FitState {
        &self.channels[index]
    }

    pub fn n_fit(&self) -> usize {
        self.channels.first().map_or(0, |c| c.peaks().len())
    }

    /// Peaks still running, counted over channel 0 (groups share status).
    pub fn unconverged(&self) -> usize {
        self.channels.first().map_or(0, |c| c.unconverged())
    }

    /// Supply the next frame for every channel.
    pub fn new_images(&mut self, frames: &[&[f64]]) -> Result<()> {
        if frames.len() != self.n_channels {
            return Err(anyhow!(
                "{} frames supplied for {} channels",
                frames.len(),
                self.n_channels
            ));
        }
        for (channel, frame) in self.channels.iter_mut().zip(frames) {
            channel.new_image(frame)?;
        }
        Ok(())
    }

    fn check_ready(&self) -> Result<()> {
        if self.channels.len() != self.n_channels {
            return Err(anyhow!(
                "only {} of {} channels configured",
                self.channels.len(),
                self.n_channels
            ));
        }
        Ok(())
    }

    /// Append candidate peaks to every channel, mapping lateral positions
    /// from channel-0 coordinates through the forward affines.
    pub fn new_peaks(&mut self, params: &[f64], kind: PeakKind) -> Result<()> {
        self.check_ready()?;
        let stride = match kind {
            PeakKind::Finder | PeakKind::Testing => 3,
            PeakKind::Hdf5 => 5,
        };
        if params.len() % stride != 0 {
            return Err(anyhow!(
                "candidate array length {} is not a multiple of {}",
                params.len(),
                stride
            ));
        }
        let n_peaks = params.len() / stride;
        let start = self.n_fit();

        for c in 0..self.n_channels {
            if c == 0 {
                self.channels[0].new_peaks(params, kind)?;
                continue;
            }
            let mut mapped = params.to_vec();
            for record in mapped.chunks_exact_mut(stride) {
                let tx = record[0];
                let ty = record[1];
                record[0] = self.yt_0to_n[c][0] + ty * self.yt_0to_n[c][1] + tx * self.yt_0to_n[c][2];
                record[1] = self.xt_0to_n[c][0] + ty * self.xt_0to_n[c][1] + tx * self.xt_0to_n[c][2];
            }
            self.channels[c].new_peaks(&mapped, kind)?;
        }

        if !self.independent_heights {
            self.reset_group_heights(start, start + n_peaks);
        }
        self.sync_group_errors(start, start + n_peaks);
        Ok(())
    }

    /// Give every peak of a group the mean height across channels and
    /// refresh the residuals and errors accordingly.
    fn reset_group_heights(&mut self, start: usize, stop: usize) {
        for i in start..stop {
            let mean = self
                .channels
                .iter()
                .map(|c| c.peaks()[i].params[HEIGHT])
                .sum::<f64>()
                / self.n_channels as f64;
            for c in 0..self.n_channels {
                let channel = &mut self.channels[c];
                let mut peak = channel.peaks()[i].clone();
                if peak.status != PeakStatus::Error && peak.added {
                    channel.image_mut().subtract_peak(&mut peak);
                }
                peak.params[HEIGHT] = mean;
                if peak.status != PeakStatus::Error {
                    channel.image_mut().add_peak(&mut peak);
                    channel.calc_error_working(&mut peak);
                }
                channel.peaks_mut()[i] = peak;
            }
        }
    }

    /// If any channel's peak initialized in error, the whole group goes to
    /// error and the surviving peers are removed from their residuals.
    fn sync_group_errors(&mut self, start: usize, stop: usize) {
        for i in start..stop {
            let any_error = self
                .channels
                .iter()
                .any(|c| c.peaks()[i].status == PeakStatus::Error);
            if !any_error {
                continue;
            }
            for c in 0..self.n_channels {
                let channel = &mut self.channels[c];
                if channel.peaks()[i].status != PeakStatus::Error {
                    let mut peak = channel.peaks()[i].clone();
                    if peak.added {
                        channel.image_mut().subtract_peak(&mut peak);
                    }
                    peak.status = PeakStatus::Error;
                    channel.peaks_mut()[i] = peak;
                } else {
                    channel.peaks_mut()[i].status = PeakStatus::Error;
                }
            }
        }
    }

    /// Weight-array bin for a z value.
    fn weight_index(&self, z: f64) -> usize {
        let zi = (self.w_z_scale * (z - self.w_z_offset)).floor() as i64;
        if zi < 0 {
            debug!(zi, "weight index below range");
            return 0;
        }
        if zi >= self.n_weights as i64 {
            debug!(zi, "weight index above range");
            return self.n_weights - 1;
        }
        zi as usize
    }

    /// Apply one coherent group update from the per-channel update vectors.
    ///
    /// Lateral deltas are rotated into the channel-0 frame through the
    /// inverse affines, averaged with the z-dependent weights (scaled by the
    /// channel heights), applied to channel 0, and the other channels'
    /// positions re-derived through the forward affines. Note the x/y swap
    /// between the transform arrays and the parameters; it mirrors the
    /// calibration convention used when the maps were built.
    fn update_working(&mut self, working: &mut [Peak], deltas: &[DVector<f64>]) {
        let nc = self.n_channels;
        let use_clamp = self.config.use_clamp;
        let zi = self.weight_index(working[0].params[ZCENTER]);

        if self.independent_heights {
            for c in 0..nc {
                working[c].update_param(HEIGHT, deltas[c][D_HEIGHT], use_clamp);
                if working[c].params[HEIGHT] < self.config.height_floor {
                    working[c].params[HEIGHT] = self.config.height_floor;
                }
                self.heights[c] = working[c].params[HEIGHT];
            }
        } else {
            let mut p_ave = 0.0;
            let mut p_total = 0.0;
            for c in 0..nc {
                p_ave += deltas[c][D_HEIGHT] * self.w_h[zi * nc + c];
                p_total += self.w_h[zi * nc + c];
            }
            working[0].update_param(HEIGHT, p_ave / p_total, use_clamp);
            let h0 = working[0].params[HEIGHT];
            for peer in working.iter_mut().skip(1) {
                peer.params[HEIGHT] = h0;
            }
        }

        // X in the channel-0 frame.
        let mut p_ave = 0.0;
        let mut p_total = 0.0;
        for c in 0..nc {
            let delta = self.yt_nto0[c][1] * deltas[c][D_YCENTER]
                + self.yt_nto0[c][2] * deltas[c][D_XCENTER];
            p_ave += delta * self.w_x[zi * nc + c] * self.heights[c];
            p_total += self.w_x[zi * nc + c] * self.heights[c];
        }
        working[0].update_param(XCENTER, p_ave / p_total, use_clamp);

        // Y, through the complementary transform rows.
        let mut p_ave = 0.0;
        let mut p_total = 0.0;
        for c in 0..nc {
            let delta = self.xt_nto0[c][1] * deltas[c][D_YCENTER]
                + self.xt_nto0[c][2] * deltas[c][D_XCENTER];
            p_ave += delta * self.w_y[zi * nc + c] * self.heights[c];
            p_total += self.w_y[zi * nc + c] * self.heights[c];
        }
        working[0].update_param(YCENTER, p_ave / p_total, use_clamp);

        // Re-derive the other channels' positions from channel 0, shifting
        // through the model origin offsets for corner-anchored tables.
        let xoff = self.channels[0].model().xoff();
        let yoff = self.channels[0].model().yoff();
        let x0 = working[0].params[XCENTER];
        let y0 = working[0].params[YCENTER];
        for c in 1..nc {
            let t = self.yt_0to_n[c][0]
                + self.yt_0to_n[c][1] * (y0 + yoff)
                + self.yt_0to_n[c][2] * (x0 + xoff);
            working[c].params[XCENTER] = t - xoff;
            let t = self.xt_0to_n[c][0]
                + self.xt_0to_n[c][1] * (y0 + yoff)
                + self.xt_0to_n[c][2] * (x0 + xoff);
            working[c].params[YCENTER] = t - yoff;
        }

        for peer in working.iter_mut() {
            peer.update_anchor_round(self.config.hysteresis);
        }

        // Z is a plain weighted average applied to every channel.
        let mut p_ave = 0.0;
        let mut p_total = 0.0;
        for c in 0..nc {
            p_ave += deltas[c][D_ZCENTER] * self.w_z[zi * nc + c] * self.heights[c];
            p_total += self.w_z[zi * nc + c] * self.heights[c];
        }
        let dz = p_ave / p_total;
        for c in 0..nc {
            working[c].update_param(ZCENTER, dz, use_clamp);
            self.channels[c].model().clamp_z(&mut working[c]);
        }

        // Backgrounds float independently.
        for c in 0..nc {
            working[c].update_param(BACKGROUND, deltas[c][D_BACKGROUND], use_clamp);
        }
    }

    /// Restore working peaks from their committed state with a ramped
    /// damping, keeping the physical added/subtracted state.
    fn reset_working(&self, working: &mut [Peak], index: usize) {
        for (c, peer) in working.iter_mut().enumerate() {
            let added = peer.added;
            let lambda = peer.lambda;
            let mut fresh = self.channels[c].peaks()[index].clone();
            fresh.added = added;
            fresh.lambda = lambda * self.config.lambda_up;
            fresh.status = PeakStatus::Error;
            *peer = fresh;
        }
    }

    /// One Levenberg-Marquardt pass over every running group.
    pub fn iterate_lm(&mut self) {
        for i in 0..self.n_fit() {
            if self.channels[0].peaks()[i].status != PeakStatus::Running {
                continue;
            }
            self.update_group_lm(i);
        }
    }

    fn update_group_lm(&mut self, i: usize) {
        let nc = self.n_channels;
        let mut working: Vec<Peak> = Vec::with_capacity(nc);
        let mut jacobians: Vec<DVector<f64>> = Vec::with_capacity(nc);
        let mut hessians: Vec<DMatrix<f64>> = Vec::with_capacity(nc);

        // Bookkeeping for the add/subtract protocol: the group must end
        // fully added on success and fully absent on error.
        let mut n_add = nc as i64;

        let mut starting_error = 0.0;
        for c in 0..nc {
            let channel = &mut self.channels[c];
            let mut peak = channel.peaks()[i].clone();
            channel.calc_error_working(&mut peak);
            starting_error += peak.error;
            let mut jacobian = DVector::zeros(JAC_SIZE);
            let mut hessian = DMatrix::zeros(JAC_SIZE, JAC_SIZE);
            channel
                .model()
                .calc_jh(channel.image(), &peak, &mut jacobian, &mut hessian);
            channel.image_mut().subtract_peak(&mut peak);
            n_add -= 1;
            working.push(peak);
            jacobians.push(jacobian);
            hessians.push(hessian);
        }

        let mut cycles = 0;
        loop {
            cycles += 1;

            // Status may be left over from a failed pass.
            for peer in working.iter_mut() {
                peer.status = PeakStatus::Running;
            }

            let mut deltas: Vec<DVector<f64>> = Vec::with_capacity(nc);
            let mut solver_failed = false;
            for c in 0..nc {
                self.channels[c].stats_mut().n_iterations += 1;
                let mut damped = hessians[c].clone();
                for d in 0..JAC_SIZE {
                    damped[(d, d)] *= 1.0 + working[c].lambda;
                }
                match solver::solve_spd(damped, &jacobians[c]) {
                    Some(d) => deltas.push(d),
                    None => {
                        debug!(peak = i, channel = c, "group update system not positive definite");
                        self.channels[c].stats_mut().n_dposv += 1;
                        solver_failed = true;
                        break;
                    }
                }
            }
            if solver_failed {
                for peer in working.iter_mut() {
                    peer.status = PeakStatus::Error;
                    peer.lambda *= self.config.lambda_up;
                }
                if cycles >= self.config.max_lm_cycles {
                    break;
                }
                continue;
            }

            self.update_working(&mut working, &deltas);

            let mut check_failed = false;
            for c in 0..nc {
                if self.channels[c].working_outside_margin(&working[c]) {
                    working[c].status = PeakStatus::Error;
                    self.channels[c].stats_mut().n_margin += 1;
                }
                if let Err(failure) = self.channels[c].model().check(&working[c]) {
                    working[c].status = PeakStatus::Error;
                    self.channels[c].stats_mut().record(failure);
                }
                if working[c].status == PeakStatus::Error {
                    check_failed = true;
                }
            }
            if check_failed {
                self.reset_working(&mut working, i);
                if cycles >= self.config.max_lm_cycles {
                    break;
                }
                continue;
            }

            for c in 0..nc {
                let channel = &mut self.channels[c];
                let config = self.config.clone();
                channel.model().update_bounds(&mut working[c], &config);
                channel.model().calc_shape(&mut working[c]);
                channel.image_mut().add_peak(&mut working[c]);
                n_add += 1;
            }

            let mut current_error = 0.0;
            let mut error_failed = false;
            for c in 0..nc {
                if !self.channels[c].calc_error_working(&mut working[c]) {
                    error_failed = true;
                }
                current_error += working[c].error;
            }
            if error_failed {
                for c in 0..nc {
                    self.channels[c].image_mut().subtract_peak(&mut working[c]);
                    n_add -= 1;
                }
                self.reset_working(&mut working, i);
                if cycles >= self.config.max_lm_cycles {
                    break;
                }
                continue;
            }

            if current_error > starting_error {
                // The damping usually has to grow until the group barely
                // moves; a tiny relative increase counts as converged.
                if (current_error - starting_error) / starting_error < self.config.tolerance {
                    for peer in working.iter_mut() {
                        peer.status = PeakStatus::Converged;
                    }
                    break;
                }
                for c in 0..nc {
                    self.channels[c].stats_mut().n_non_decr += 1;
                    self.channels[c].image_mut().subtract_peak(&mut working[c]);
                    n_add -= 1;
                }
                self.reset_working(&mut working, i);
                if cycles >= self.config.max_lm_cycles {
                    break;
                }
                continue;
            }

            if (starting_error - current_error) / starting_error < self.config.tolerance {
                for peer in working.iter_mut() {
                    peer.status = PeakStatus::Converged;
                }
            } else {
                for peer in working.iter_mut() {
                    peer.lambda *= self.config.lambda_down;
                }
            }
            break;
        }

        let status = working[0].status;
        if status == PeakStatus::Error {
            debug_assert_eq!(n_add, 0, "error outcome left peaks in the residual");
        } else {
            debug_assert_eq!(n_add, nc as i64, "committed group missing from the residual");
        }

        // Commit with one status for the whole group.
        for (c, mut peak) in working.into_iter().enumerate() {
            peak.status = status;
            self.channels[c].peaks_mut()[i] = peak;
        }
    }

    /// One pass of the original clamped iteration over every running group:
    /// per-channel solves, a coordinated update, then a shared error and
    /// convergence pass.
    pub fn iterate_original(&mut self) {
        if !self.config.use_clamp {
            warn!("coordinated clamped iteration without clamping, mistake?");
        }
        for i in 0..self.n_fit() {
            if self.channels[0].peaks()[i].status != PeakStatus::Running {
                continue;
            }
            self.update_group_original(i);
        }
        for i in 0..self.n_fit() {
            if self.channels[0].peaks()[i].status != PeakStatus::Running {
                continue;
            }
            self.error_pass_group(i);
        }
    }

    fn update_group_original(&mut self, i: usize) {
        let nc = self.n_channels;
        let mut working: Vec<Peak> = Vec::with_capacity(nc);
        let mut deltas: Vec<DVector<f64>> = Vec::with_capacity(nc);
        let mut solver_failed = false;

        for c in 0..nc {
            let channel = &mut self.channels[c];
            let mut peak = channel.peaks()[i].clone();
            let mut jacobian = DVector::zeros(JAC_SIZE);
            let mut hessian = DMatrix::zeros(JAC_SIZE, JAC_SIZE);
            channel
                .model()
                .calc_jh(channel.image(), &peak, &mut jacobian, &mut hessian);
            channel.image_mut().subtract_peak(&mut peak);
            channel.stats_mut().n_iterations += 1;
            working.push(peak);
            match solver::solve_spd(hessian, &jacobian) {
                Some(d) => deltas.push(d),
                None => {
                    debug!(peak = i, channel = c, "group update system not positive definite");
                    channel.stats_mut().n_dposv += 1;
                    solver_failed = true;
                    break;
                }
            }
        }
        if solver_failed {
            self.commit_group_error(i, working);
            return;
        }

        self.update_working(&mut working, &deltas);

        let mut check_failed = false;
        for c in 0..nc {
            if self.channels[c].working_outside_margin(&working[c]) {
                working[c].status = PeakStatus::Error;
                self.channels[c].stats_mut().n_margin += 1;
            }
            if let Err(failure) = self.channels[c].model().check(&working[c]) {
                working[c].status = PeakStatus::Error;
                self.channels[c].stats_mut().record(failure);
            }
            if working[c].status == PeakStatus::Error {
                check_failed = true;
            }
        }
        if check_failed {
            self.commit_group_error(i, working);
            return;
        }

        for (c, mut peak) in working.into_iter().enumerate() {
            let channel = &mut self.channels[c];
            let config = self.config.clone();
            channel.model().update_bounds(&mut peak, &config);
            channel.model().calc_shape(&mut peak);
            channel.image_mut().add_peak(&mut peak);
            channel.peaks_mut()[i] = peak;
        }
    }

    /// Commit a group whose update failed mid-flight: every peak to error,
    /// residual contributions already removed for the channels processed so
    /// far and removed here for the rest.
    fn commit_group_error(&mut self, i: usize, working: Vec<Peak>) {
        let processed = working.len();
        for (c, mut peak) in working.into_iter().enumerate() {
            peak.status = PeakStatus::Error;
            self.channels[c].peaks_mut()[i] = peak;
        }
        for c in processed..self.n_channels {
            let channel = &mut self.channels[c];
            let mut peak = channel.peaks()[i].clone();
            if peak.added {
                channel.image_mut().subtract_peak(&mut peak);
            }
            peak.status = PeakStatus::Error;
            channel.peaks_mut()[i] = peak;
        }
    }

    fn error_pass_group(&mut self, i: usize) {
        let nc = self.n_channels;
        let mut any_bad = false;
        let mut all_converged = true;
        for c in 0..nc {
            let channel = &mut self.channels[c];
            let mut peak = channel.peaks()[i].clone();
            if !channel.calc_error_convergence(&mut peak) {
                any_bad = true;
            }
            if peak.status != PeakStatus::Converged {
                all_converged = false;
            }
            channel.peaks_mut()[i] = peak;
        }

        if any_bad {
            for c in 0..nc {
                let channel = &mut self.channels[c];
                let mut peak = channel.peaks()[i].clone();
                if peak.added {
                    channel.image_mut().subtract_peak(&mut peak);
                }
                peak.status = PeakStatus::Error;
                channel.peaks_mut()[i] = peak;
            }
        } else if !all_converged {
            // The group converges as a unit.
            for c in 0..nc {
                self.channels[c].peaks_mut()[i].status = PeakStatus::Running;
            }
        }
    }
}

/// Analytic 2D/3D Gaussian PSF evaluator
///
/// The model over a peak's bounding box is the separable form
/// `h * exp(-xt^2 * wx) * exp(-yt^2 * wy)` with `wx = 1 / (2 * sigma_x^2)`.
/// Candidate records and result records carry sigma; the fit parameter is
/// the exponent coefficient. Four submodes select which parameters are
/// active: fixed widths, one shared width, independent widths, or widths
/// slaved to the axial coordinate through a calibration polynomial.
use nalgebra::{DMatrix, DVector};

use crate::fitter::FitConfig;
use crate::peak::{Peak, BACKGROUND, HEIGHT, XCENTER, XWIDTH, YCENTER, YWIDTH, ZCENTER};
use crate::psf_model::{GaussianShape, PeakFailure, PeakShape, PsfModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaussianMode {
    /// Heights, positions and background only (n = 4).
    FixedWidth,
    /// One width shared by both axes (n = 5).
    EqualWidth,
    /// Independent x and y widths (n = 6).
    FreeWidths,
    /// Widths are a function of z through the calibration polynomial (n = 5).
    ZCoupled,
}

/// Analytic Gaussian PSF family.
pub struct GaussianPsf {
    mode: GaussianMode,
    /// Sigma used for finder candidates that carry no width of their own.
    default_sigma: f64,
    /// Width-versus-z coefficients [w0^2, c, d, A, B]. The leading term is
    /// squared once at construction.
    wx_vs_z: [f64; 5],
    wy_vs_z: [f64; 5],
    min_z: f64,
    max_z: f64,
}

/// Exponent coefficient for a Gaussian of the given sigma.
fn width_param(sigma: f64) -> f64 {
    1.0 / (2.0 * sigma * sigma)
}

/// Bounding-box half-width for a width parameter: roughly four sigma, with
/// hysteresis against the previous value and capped by the fit margin.
fn half_width(width: f64, old_w: i64, config: &FitConfig) -> i64 {
    if width < 0.0 {
        return 1;
    }
    let mut new_w = old_w;
    let tmp = 4.0 * (1.0 / (2.0 * width)).sqrt();
    if (tmp - old_w as f64 - 0.5).abs() > config.hysteresis {
        new_w = tmp as i64;
    }
    new_w.clamp(1, config.margin as i64)
}

impl GaussianPsf {
    pub fn fixed_width(default_sigma: f64) -> Self {
        Self::lateral(GaussianMode::FixedWidth, default_sigma)
    }

    pub fn equal_width(default_sigma: f64) -> Self {
        Self::lateral(GaussianMode::EqualWidth, default_sigma)
    }

    pub fn free_widths(default_sigma: f64) -> Self {
        Self::lateral(GaussianMode::FreeWidths, default_sigma)
    }

    fn lateral(mode: GaussianMode, default_sigma: f64) -> Self {
        GaussianPsf {
            mode,
            default_sigma,
            wx_vs_z: [0.0; 5],
            wy_vs_z: [0.0; 5],
            // Effectively unbounded until a z calibration is supplied.
            min_z: -1.0e-6,
            max_z: 1.0e6,
        }
    }

    /// Z-coupled widths mode. The coefficient arrays are
    /// [w0, c, d, A, B] for `w(z') = w0 * sqrt(1 + z'^2 + A z'^3 + B z'^4)`
    /// with `z' = (z - c) / d`.
    pub fn z_coupled(wx_vs_z: [f64; 5], wy_vs_z: [f64; 5], z_range: (f64, f64)) -> Self {
        let mut wx = wx_vs_z;
        let mut wy = wy_vs_z;
        wx[0] *= wx[0];
        wy[0] *= wy[0];
        GaussianPsf {
            mode: GaussianMode::ZCoupled,
            default_sigma: 1.5,
            wx_vs_z: wx,
            wy_vs_z: wy,
            min_z: z_range.0,
            max_z: z_range.1,
        }
    }

    pub fn mode(&self) -> GaussianMode {
        self.mode
    }

    /// Set XWIDTH/YWIDTH from the current ZCENTER and retain the squared
    /// polynomial terms for the axial chain rule.
    fn widths_from_z(&self, peak: &mut Peak) {
        let z = peak.params[ZCENTER];

        let z0 = (z - self.wx_vs_z[1]) / self.wx_vs_z[2];
        let z1 = z0 * z0;
        let tmp = 1.0 + z1 + self.wx_vs_z[3] * z1 * z0 + self.wx_vs_z[4] * z1 * z1;
        peak.shape.as_gaussian_mut().wx_term = tmp * tmp;
        peak.params[XWIDTH] = 2.0 / (self.wx_vs_z[0] * tmp);

        let z0 = (z - self.wy_vs_z[1]) / self.wy_vs_z[2];
        let z1 = z0 * z0;
        let tmp = 1.0 + z1 + self.wy_vs_z[3] * z1 * z0 + self.wy_vs_z[4] * z1 * z1;
        peak.shape.as_gaussian_mut().wy_term = tmp * tmp;
        peak.params[YWIDTH] = 2.0 / (self.wy_vs_z[0] * tmp);
    }

    /// Chain-rule factors d(width)/d(z') for the ZCENTER Jacobian column.
    /// Note these are derivatives with respect to the scaled axial
    /// coordinate; the calibration convention bakes the 1/d factor into the
    /// fitted z units and we keep that convention.
    fn z_gradients(&self, peak: &Peak) -> (f64, f64) {
        let z = peak.params[ZCENTER];
        let shape = peak.shape.as_gaussian();

        let z0 = (z - self.wx_vs_z[1]) / self.wx_vs_z[2];
        let z1 = z0 * z0;
        let zt = 2.0 * z0 + 3.0 * self.wx_vs_z[3] * z1 + 4.0 * self.wx_vs_z[4] * z1 * z0;
        let gx = -2.0 * zt / (self.wx_vs_z[0] * shape.wx_term);

        let z0 = (z - self.wy_vs_z[1]) / self.wy_vs_z[2];
        let z1 = z0 * z0;
        let zt = 2.0 * z0 + 3.0 * self.wy_vs_z[3] * z1 + 4.0 * self.wy_vs_z[4] * z1 * z0;
        let gy = -2.0 * zt / (self.wy_vs_z[0] * shape.wy_term);

        (gx, gy)
    }
}

impl PsfModel for GaussianPsf {
    fn jac_size(&self) -> usize {
        match self.mode {
            GaussianMode::FixedWidth => 4,
            GaussianMode::EqualWidth => 5,
            GaussianMode::FreeWidths => 6,
            GaussianMode::ZCoupled => 5,
        }
    }

    fn five_param_convention(&self) -> bool {
        self.mode == GaussianMode::ZCoupled
    }

    fn init_peak(&self, peak: &mut Peak, sigmas: Option<(f64, f64)>, config: &FitConfig) {
        let len = 2 * config.margin + 1;
        peak.shape = PeakShape::Gaussian(GaussianShape {
            xt: vec![0.0; len],
            ext: vec![0.0; len],
            yt: vec![0.0; len],
            eyt: vec![0.0; len],
            wx_term: 0.0,
            wy_term: 0.0,
        });
        if self.mode == GaussianMode::ZCoupled {
            self.widths_from_z(peak);
        } else {
            let (sx, sy) = sigmas.unwrap_or((self.default_sigma, self.default_sigma));
            peak.params[XWIDTH] = width_param(sx);
            peak.params[YWIDTH] = width_param(sy);
        }
        peak.wx = half_width(peak.params[XWIDTH], -10, config);
        peak.wy = half_width(peak.params[YWIDTH], -10, config);
    }

    fn calc_shape(&self, peak: &mut Peak) {
        let (xi, yi) = (peak.xi, peak.yi);
        let (wx, wy) = (peak.wx, peak.wy);
        let xc = peak.params[XCENTER];
        let yc = peak.params[YCENTER];
        let xw = peak.params[XWIDTH];
        let yw = peak.params[YWIDTH];
        let shape = peak.shape.as_gaussian_mut();
        for j in -wx..=wx {
            let n = (j + wx) as usize;
            let xt = (xi + j) as f64 - xc;
            shape.xt[n] = xt;
            shape.ext[n] = (-xt * xt * xw).exp();
        }
        for j in -wy..=wy {
            let n = (j + wy) as usize;
            let yt = (yi + j) as f64 - yc;
            shape.yt[n] = yt;
            shape.eyt[n] = (-yt * yt * yw).exp();
        }
    }

    fn calc_jh(
        &self,
        image: &crate::residual::ResidualImage,
        peak: &Peak,
        jacobian: &mut DVector<f64>,
        hessian: &mut DMatrix<f64>,
    ) {
        let n = self.jac_size();
        jacobian.fill(0.0);
        hessian.fill(0.0);

        let h = peak.params[HEIGHT];
        let xw = peak.params[XWIDTH];
        let yw = peak.params[YWIDTH];
        let (gx, gy) = if self.mode == GaussianMode::ZCoupled {
            self.z_gradients(peak)
        } else {
            (0.0, 0.0)
        };
        let shape = peak.shape.as_gaussian();
        let mut jt = [0.0_f64; 6];

        for j in -peak.wy..=peak.wy {
            let yt = shape.yt[(j + peak.wy) as usize];
            let eyt = shape.eyt[(j + peak.wy) as usize];
            for k in -peak.wx..=peak.wx {
                let m = image.index(peak.xi + k, peak.yi + j);
                let fi = image.model_rate(m);
                let xi = image.observed(m);
                let xt = shape.xt[(k + peak.wx) as usize];
                let e_t = shape.ext[(k + peak.wx) as usize] * eyt;

                match self.mode {
                    GaussianMode::FixedWidth => {
                        jt[0] = e_t;
                        jt[1] = 2.0 * h * xw * xt * e_t;
                        jt[2] = 2.0 * h * xw * yt * e_t;
                        jt[3] = 1.0;
                    }
                    GaussianMode::EqualWidth => {
                        jt[0] = e_t;
                        jt[1] = 2.0 * h * xw * xt * e_t;
                        jt[2] = 2.0 * h * xw * yt * e_t;
                        jt[3] = -h * xt * xt * e_t - h * yt * yt * e_t;
                        jt[4] = 1.0;
                    }
                    GaussianMode::FreeWidths => {
                        jt[0] = e_t;
                        jt[1] = 2.0 * h * xw * xt * e_t;
                        jt[2] = -h * xt * xt * e_t;
                        jt[3] = 2.0 * h * yw * yt * e_t;
                        jt[4] = -h * yt * yt * e_t;
                        jt[5] = 1.0;
                    }
                    GaussianMode::ZCoupled => {
                        jt[0] = e_t;
                        jt[1] = 2.0 * h * xw * xt * e_t;
                        jt[2] = 2.0 * h * yw * yt * e_t;
                        jt[3] = -h * xt * xt * gx * e_t - h * yt * yt * gy * e_t;
                        jt[4] = 1.0;
                    }
                }

                let t1 = 2.0 * (1.0 - xi / fi);
                let t2 = 2.0 * xi / (fi * fi);
                for a in 0..n {
                    jacobian[a] += t1 * jt[a];
                    for b in a..n {
                        hessian[(a, b)] += t2 * jt[a] * jt[b];
                    }
                }
            }
        }
        // Mirror the accumulated upper triangle.
        for a in 0..n {
            for b in 0..a {
                hessian[(a, b)] = hessian[(b, a)];
            }
        }
    }

    fn apply_deltas(&self, peak: &mut Peak, deltas: &DVector<f64>, use_clamp: bool) {
        match self.mode {
            GaussianMode::FixedWidth => {
                peak.update_param(HEIGHT, deltas[0], use_clamp);
                peak.update_param(XCENTER, deltas[1], use_clamp);
                peak.update_param(YCENTER, deltas[2], use_clamp);
                peak.update_param(BACKGROUND, deltas[3], use_clamp);
            }
            GaussianMode::EqualWidth => {
                peak.update_param(HEIGHT, deltas[0], use_clamp);
                peak.update_param(XCENTER, deltas[1], use_clamp);
                peak.update_param(YCENTER, deltas[2], use_clamp);
                peak.update_param(XWIDTH, deltas[3], use_clamp);
                peak.update_param(YWIDTH, deltas[3], use_clamp);
                peak.update_param(BACKGROUND, deltas[4], use_clamp);
            }
            GaussianMode::FreeWidths => {
                peak.update_param(HEIGHT, deltas[0], use_clamp);
                peak.update_param(XCENTER, deltas[1], use_clamp);
                peak.update_param(XWIDTH, deltas[2], use_clamp);
                peak.update_param(YCENTER, deltas[3], use_clamp);
                peak.update_param(YWIDTH, deltas[4], use_clamp);
                peak.update_param(BACKGROUND, deltas[5], use_clamp);
            }
            GaussianMode::ZCoupled => {
                peak.update_param(HEIGHT, deltas[0], use_clamp);
                peak.update_param(XCENTER, deltas[1], use_clamp);
                peak.update_param(YCENTER, deltas[2], use_clamp);
                peak.update_param(ZCENTER, deltas[3], use_clamp);
                peak.update_param(BACKGROUND, deltas[4], use_clamp);
            }
        }
    }

    fn check(&self, peak: &Peak) -> Result<(), PeakFailure> {
        if peak.params[HEIGHT] <= 0.0 {
            return Err(PeakFailure::NegativeHeight);
        }
        if peak.params[XWIDTH] <= 0.0 || peak.params[YWIDTH] <= 0.0 {
            return Err(PeakFailure::NegativeWidth);
        }
        Ok(())
    }

    fn clamp_z(&self, peak: &mut Peak) {
        if self.mode == GaussianMode::ZCoupled {
            peak.params[ZCENTER] = peak.params[ZCENTER].clamp(self.min_z, self.max_z);
        }
    }

    fn update_bounds(&self, peak: &mut Peak, config: &FitConfig) {
        match self.mode {
            GaussianMode::FixedWidth => {}
            GaussianMode::EqualWidth => {
                peak.wx = half_width(peak.params[XWIDTH], peak.wx, config);
                peak.wy = peak.wx;
            }
            GaussianMode::FreeWidths => {
                peak.wx = half_width(peak.params[XWIDTH], peak.wx, config);
                peak.wy = half_width(peak.params[YWIDTH], peak.wy, config);
            }
            GaussianMode::ZCoupled => {
                self.widths_from_z(peak);
                peak.wx = half_width(peak.params[XWIDTH], peak.wx, config);
                peak.wy = half_width(peak.params[YWIDTH], peak.wy, config);
            }
        }
    }

    fn report_width(&self, width_param: f64) -> f64 {
        if width_param > 0.0 {
            (1.0 / (2.0 * width_param)).sqrt()
        } else {
            0.0
        }
    }
}

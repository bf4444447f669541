/// Sampled PSF evaluator backed by a tricubic spline table
///
/// The table is built upstream from calibration data and consumed here
/// read-only. Each cell of the (z, y, x) grid carries 64 polynomial
/// coefficients; evaluation at a sample point yields the PSF value and its
/// three partial derivatives in one pass. Per peak we cache the shape grid
/// and the derivative grids over the bounding box, exactly the scratch
/// layout the pupil-function and FFT variants would use, so the drivers see
/// one uniform sampled-model surface.
use anyhow::{anyhow, Result};

use nalgebra::{DMatrix, DVector};

use crate::fitter::FitConfig;
use crate::peak::{Peak, BACKGROUND, HEIGHT, XCENTER, XWIDTH, YCENTER, YWIDTH, ZCENTER};
use crate::psf_model::{PeakFailure, PeakShape, PsfModel, SampledShape};

/// Pre-built tricubic coefficient table. Coefficients are stored cell-major
/// over (z, y, x), 64 values per cell ordered by z power, then y, then x.
pub struct SplineTable {
    coeffs: Vec<f64>,
    xsize: usize,
    ysize: usize,
    zsize: usize,
}

impl SplineTable {
    pub fn new(coeffs: Vec<f64>, xsize: usize, ysize: usize, zsize: usize) -> Result<Self> {
        if xsize < 5 || ysize < 5 || zsize < 1 {
            return Err(anyhow!(
                "spline table {}x{}x{} is too small to cover a fit area",
                zsize,
                ysize,
                xsize
            ));
        }
        if coeffs.len() != 64 * xsize * ysize * zsize {
            return Err(anyhow!(
                "spline table length {} does not match {}x{}x{} cells",
                coeffs.len(),
                zsize,
                ysize,
                xsize
            ));
        }
        Ok(SplineTable {
            coeffs,
            xsize,
            ysize,
            zsize,
        })
    }

    #[inline]
    fn cell(&self, iz: usize, iy: usize, ix: usize) -> &[f64] {
        let start = 64 * ((iz * self.ysize + iy) * self.xsize + ix);
        &self.coeffs[start..start + 64]
    }

    /// Value and gradient at a point in table coordinates. Coordinates are
    /// nudged inside the valid range so boundary samples stay in the last
    /// cell.
    fn evaluate(&self, x: f64, y: f64, z: f64) -> (f64, f64, f64, f64) {
        let x = x.clamp(0.0, self.xsize as f64 - 1e-9);
        let y = y.clamp(0.0, self.ysize as f64 - 1e-9);
        let z = z.clamp(0.0, self.zsize as f64 - 1e-9);
        let (ix, iy, iz) = (x as usize, y as usize, z as usize);
        let (tx, ty, tz) = (x - ix as f64, y - iy as f64, z - iz as f64);

        let px = [1.0, tx, tx * tx, tx * tx * tx];
        let py = [1.0, ty, ty * ty, ty * ty * ty];
        let pz = [1.0, tz, tz * tz, tz * tz * tz];
        let dpx = [0.0, 1.0, 2.0 * tx, 3.0 * tx * tx];
        let dpy = [0.0, 1.0, 2.0 * ty, 3.0 * ty * ty];
        let dpz = [0.0, 1.0, 2.0 * tz, 3.0 * tz * tz];

        let cell = self.cell(iz, iy, ix);
        let (mut v, mut gx, mut gy, mut gz) = (0.0, 0.0, 0.0, 0.0);
        let mut i = 0;
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    let co = cell[i];
                    i += 1;
                    v += co * pz[a] * py[b] * px[c];
                    gx += co * pz[a] * py[b] * dpx[c];
                    gy += co * pz[a] * dpy[b] * px[c];
                    gz += co * dpz[a] * py[b] * px[c];
                }
            }
        }
        (v, gx, gy, gz)
    }
}

/// Spline-sampled PSF family. Active parameters are height, lateral
/// position, axial position and background; the PSF extent is fixed by the
/// table.
pub struct SplinePsf {
    table: SplineTable,
    min_z: f64,
    max_z: f64,
    /// Scale from caller z units to table cells.
    z_scale: f64,
}

impl SplinePsf {
    /// Wrap a table, mapping the caller's [min_z, max_z] axial range across
    /// the table's z extent.
    pub fn new(table: SplineTable, min_z: f64, max_z: f64) -> Result<Self> {
        if !(max_z > min_z) {
            return Err(anyhow!("empty z range [{}, {}]", min_z, max_z));
        }
        let z_scale = table.zsize as f64 / (max_z - min_z);
        Ok(SplinePsf {
            table,
            min_z,
            max_z,
            z_scale,
        })
    }

    /// Half-width of the fit area, limited by both the table extent and the
    /// image margin.
    fn fit_half_width(&self, config: &FitConfig) -> i64 {
        let from_table = ((self.table.xsize.min(self.table.ysize) as i64) - 3) / 2;
        from_table.clamp(1, config.margin as i64)
    }

    /// Table coordinate of the box origin for the given half-width.
    fn origin(&self, size: usize, w: i64) -> f64 {
        size as f64 / 2.0 - w as f64
    }
}

impl PsfModel for SplinePsf {
    fn jac_size(&self) -> usize {
        5
    }

    fn five_param_convention(&self) -> bool {
        true
    }

    fn init_peak(&self, peak: &mut Peak, _sigmas: Option<(f64, f64)>, config: &FitConfig) {
        let w = self.fit_half_width(config);
        peak.wx = w;
        peak.wy = w;
        // Width slots are carried but not fitted for sampled models.
        peak.params[XWIDTH] = 1.0;
        peak.params[YWIDTH] = 1.0;
        peak.params[ZCENTER] = peak.params[ZCENTER].clamp(self.min_z, self.max_z);
        let len = ((2 * w + 1) * (2 * w + 1)) as usize;
        peak.shape = PeakShape::Sampled(SampledShape {
            shape: vec![0.0; len],
            dx: vec![0.0; len],
            dy: vec![0.0; len],
            dz: vec![0.0; len],
        });
    }

    fn calc_shape(&self, peak: &mut Peak) {
        let (wx, wy) = (peak.wx, peak.wy);
        let dx = peak.params[XCENTER] - peak.xi as f64;
        let dy = peak.params[YCENTER] - peak.yi as f64;
        let zc = (peak.params[ZCENTER] - self.min_z) * self.z_scale;
        let ox = self.origin(self.table.xsize, wx);
        let oy = self.origin(self.table.ysize, wy);
        let row_len = (2 * wx + 1) as usize;
        let z_scale = self.z_scale;

        // Moving the center by +dx shifts the sample point by -dx.
        for j in 0..=(2 * wy) as usize {
            let sy = oy + j as f64 - dy;
            for k in 0..row_len {
                let sx = ox + k as f64 - dx;
                let (v, gx, gy, gz) = self.table.evaluate(sx, sy, zc);
                let idx = j * row_len + k;
                let shape = peak.shape.as_sampled_mut();
                shape.shape[idx] = v;
                shape.dx[idx] = gx;
                shape.dy[idx] = gy;
                // Fold the unit conversion into the cached z derivative.
                shape.dz[idx] = gz * z_scale;
            }
        }
    }

    fn calc_jh(
        &self,
        image: &crate::residual::ResidualImage,
        peak: &Peak,
        jacobian: &mut DVector<f64>,
        hessian: &mut DMatrix<f64>,
    ) {
        let n = 5;
        jacobian.fill(0.0);
        hessian.fill(0.0);

        let h = peak.params[HEIGHT];
        let shape = peak.shape.as_sampled();
        let row_len = (2 * peak.wx + 1) as usize;
        let mut jt = [0.0_f64; 5];

        for j in -peak.wy..=peak.wy {
            for k in -peak.wx..=peak.wx {
                let m = image.index(peak.xi + k, peak.yi + j);
                let fi = image.model_rate(m);
                let xi = image.observed(m);
                let idx = (j + peak.wy) as usize * row_len + (k + peak.wx) as usize;

                jt[0] = shape.shape[idx];
                jt[1] = -h * shape.dx[idx];
                jt[2] = -h * shape.dy[idx];
                jt[3] = h * shape.dz[idx];
                jt[4] = 1.0;

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
        for a in 0..n {
            for b in 0..a {
                hessian[(a, b)] = hessian[(b, a)];
            }
        }
    }

    fn apply_deltas(&self, peak: &mut Peak, deltas: &DVector<f64>, use_clamp: bool) {
        peak.update_param(HEIGHT, deltas[0], use_clamp);
        peak.update_param(XCENTER, deltas[1], use_clamp);
        peak.update_param(YCENTER, deltas[2], use_clamp);
        peak.update_param(ZCENTER, deltas[3], use_clamp);
        peak.update_param(BACKGROUND, deltas[4], use_clamp);
    }

    fn check(&self, peak: &Peak) -> Result<(), PeakFailure> {
        if peak.params[HEIGHT] <= 0.0 {
            return Err(PeakFailure::NegativeHeight);
        }
        Ok(())
    }

    fn clamp_z(&self, peak: &mut Peak) {
        peak.params[ZCENTER] = peak.params[ZCENTER].clamp(self.min_z, self.max_z);
    }

    fn update_bounds(&self, _peak: &mut Peak, _config: &FitConfig) {
        // The fit area is fixed by the table.
    }
}

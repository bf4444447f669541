/// Residual image store
///
/// Per-channel pixel arrays backing the fit: the observed frame, the
/// reconstructed foreground (sum of currently added peak shapes), the
/// background accumulator with its per-pixel coverage count, and the sCMOS
/// calibration term (variance / gain^2). Peaks are journalled in and out
/// with add/subtract so the store always reflects exactly the set of peaks
/// whose `added` bit is set; those two operations are the only place that
/// bit is toggled.
use anyhow::{anyhow, Result};
use tracing::debug;

use crate::peak::{Peak, BACKGROUND, HEIGHT};

pub struct ResidualImage {
    width: usize,
    height: usize,
    x_data: Vec<f64>,
    f_data: Vec<f64>,
    bg_data: Vec<f64>,
    bg_counts: Vec<i32>,
    scmos_term: Vec<f64>,
}

impl ResidualImage {
    /// Create a store for `width` x `height` frames with the given sCMOS
    /// calibration term per pixel.
    pub fn new(scmos_term: &[f64], width: usize, height: usize) -> Result<Self> {
        if scmos_term.len() != width * height {
            return Err(anyhow!(
                "sCMOS calibration size {} does not match {}x{} image",
                scmos_term.len(),
                width,
                height
            ));
        }
        Ok(ResidualImage {
            width,
            height,
            x_data: vec![0.0; width * height],
            f_data: vec![0.0; width * height],
            bg_data: vec![0.0; width * height],
            bg_counts: vec![0; width * height],
            scmos_term: scmos_term.to_vec(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Load the next frame, resetting the foreground and background
    /// accumulators.
    pub fn new_image(&mut self, pixels: &[f64]) -> Result<()> {
        if pixels.len() != self.width * self.height {
            return Err(anyhow!(
                "image size {} does not match {}x{} store",
                pixels.len(),
                self.width,
                self.height
            ));
        }
        self.x_data.copy_from_slice(pixels);
        self.f_data.fill(0.0);
        self.bg_data.fill(0.0);
        self.bg_counts.fill(0);
        Ok(())
    }

    #[inline]
    pub(crate) fn index(&self, x: i64, y: i64) -> usize {
        (y * self.width as i64 + x) as usize
    }

    /// Modeled rate at pixel `m`: foreground plus the average background of
    /// the peaks covering it.
    #[inline]
    pub(crate) fn model_rate(&self, m: usize) -> f64 {
        self.f_data[m] + self.bg_data[m] / self.bg_counts[m].max(1) as f64
    }

    /// Effective observation at pixel `m`, with the sCMOS term folded in.
    #[inline]
    pub(crate) fn observed(&self, m: usize) -> f64 {
        self.x_data[m] + self.scmos_term[m]
    }

    /// Sum the peak's shape into the foreground and its background estimate
    /// into the background accumulator over the bounding box.
    pub fn add_peak(&mut self, peak: &mut Peak) {
        debug_assert!(!peak.added, "peak added twice");
        let mag = peak.params[HEIGHT];
        let bg = peak.params[BACKGROUND];
        let row_len = (2 * peak.wx + 1) as usize;
        for j in 0..=(2 * peak.wy) as usize {
            let y = peak.yi + j as i64 - peak.wy;
            for k in 0..row_len {
                let m = self.index(peak.xi + k as i64 - peak.wx, y);
                self.f_data[m] += mag * peak.shape.value(j, k, row_len);
                self.bg_counts[m] += 1;
                self.bg_data[m] += bg + self.scmos_term[m];
            }
        }
        peak.added = true;
    }

    /// Undo [`ResidualImage::add_peak`]. The peak's shape scratch and
    /// parameters must not have changed in between.
    pub fn subtract_peak(&mut self, peak: &mut Peak) {
        debug_assert!(peak.added, "peak subtracted while absent");
        let mag = peak.params[HEIGHT];
        let bg = peak.params[BACKGROUND];
        let row_len = (2 * peak.wx + 1) as usize;
        for j in 0..=(2 * peak.wy) as usize {
            let y = peak.yi + j as i64 - peak.wy;
            for k in 0..row_len {
                let m = self.index(peak.xi + k as i64 - peak.wx, y);
                self.f_data[m] -= mag * peak.shape.value(j, k, row_len);
                self.bg_counts[m] -= 1;
                self.bg_data[m] -= bg + self.scmos_term[m];
            }
        }
        peak.added = false;
    }

    /// Poisson log-likelihood surrogate over the peak's bounding box,
    /// following Laurence and Chromy. On success the previous error is
    /// retired into `error_old` and the new value stored. Returns false if
    /// any modeled rate is non-positive, which leaves the peak's errors
    /// untouched.
    pub fn calc_error(&self, peak: &mut Peak) -> bool {
        let mut err = 0.0;
        for j in -peak.wy..=peak.wy {
            for k in -peak.wx..=peak.wx {
                let m = self.index(peak.xi + k, peak.yi + j);
                let fi = self.model_rate(m);
                if fi <= 0.0 {
                    debug!(
                        fi,
                        x = peak.params[crate::peak::XCENTER],
                        y = peak.params[crate::peak::YCENTER],
                        "non-positive model rate"
                    );
                    return false;
                }
                let xi = self.observed(m);
                if xi > 0.0 {
                    err += 2.0 * ((fi - xi) - xi * (fi / xi).ln());
                } else {
                    err += 2.0 * fi;
                }
            }
        }
        peak.error_old = peak.error;
        peak.error = err;
        true
    }

    /// Minimum observed value over a bounding box, used to seed background
    /// estimates for finder candidates.
    pub(crate) fn box_min_observed(&self, xi: i64, yi: i64, wx: i64, wy: i64) -> f64 {
        let mut min = f64::INFINITY;
        for j in -wy..=wy {
            for k in -wx..=wx {
                let v = self.x_data[self.index(xi + k, yi + j)];
                if v < min {
                    min = v;
                }
            }
        }
        min
    }

    pub(crate) fn observed_raw(&self, xi: i64, yi: i64) -> f64 {
        self.x_data[self.index(xi, yi)]
    }

    /// Current residual: observed data minus the reconstructed foreground.
    pub fn residual(&self) -> Vec<f64> {
        self.x_data
            .iter()
            .zip(self.f_data.iter())
            .map(|(x, f)| x - f)
            .collect()
    }

    /// Number of added peaks covering pixel `m`.
    pub fn bg_count(&self, m: usize) -> i32 {
        self.bg_counts[m]
    }
}

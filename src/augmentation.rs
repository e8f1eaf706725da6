//! Random geometric augmentation.
//!
//! Rotation, shift, shear and zoom are folded into one affine map centred on
//! the image and resampled bilinearly; coordinates falling outside the source
//! are clamped to the nearest edge pixel. A horizontal flip is applied last.

use anyhow::{bail, Result};
use image::{Rgb, Rgb32FImage, RgbImage};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Maximum rotation in degrees, drawn from `[-r, r]`.
    pub rotation_range: f64,
    /// Maximum horizontal shift as a fraction of the width.
    pub width_shift_range: f64,
    /// Maximum vertical shift as a fraction of the height.
    pub height_shift_range: f64,
    /// Maximum shear angle in degrees.
    pub shear_range: f64,
    /// Zoom factors are drawn per axis from `[1 - z, 1 + z]`.
    pub zoom_range: f64,
    pub horizontal_flip: bool,
    /// Multiplier applied to raw 0..=255 intensities.
    pub rescale: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 30.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
            rescale: 1.0 / 255.0,
        }
    }
}

impl AugmentationConfig {
    /// No geometric change, rescaling only.
    pub fn rescale_only(&self) -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            shear_range: 0.0,
            zoom_range: 0.0,
            horizontal_flip: false,
            rescale: self.rescale,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ranges = [
            ("rotation_range", self.rotation_range),
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
            ("shear_range", self.shear_range),
            ("zoom_range", self.zoom_range),
        ];
        for (name, value) in ranges {
            if !(value >= 0.0) {
                bail!("augmentation.{name} must be >= 0 (got {value})");
            }
        }
        if self.zoom_range >= 1.0 {
            bail!("augmentation.zoom_range must be < 1 (got {})", self.zoom_range);
        }
        if !(self.rescale > 0.0 && self.rescale <= 1.0 / 255.0 + f32::EPSILON) {
            bail!(
                "augmentation.rescale must be in (0, 1/255] to keep pixels in [0, 1] (got {})",
                self.rescale
            );
        }
        Ok(())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, height: u32, width: u32) -> RandomTransform {
        let theta = symmetric(rng, self.rotation_range);
        let shift_rows = symmetric(rng, self.height_shift_range) * height as f64;
        let shift_cols = symmetric(rng, self.width_shift_range) * width as f64;
        let shear = symmetric(rng, self.shear_range);
        let (zoom_rows, zoom_cols) = if self.zoom_range > 0.0 {
            let lo = 1.0 - self.zoom_range;
            let hi = 1.0 + self.zoom_range;
            (rng.gen_range(lo..hi), rng.gen_range(lo..hi))
        } else {
            (1.0, 1.0)
        };
        let flip_horizontal = self.horizontal_flip && rng.gen_bool(0.5);

        RandomTransform {
            theta,
            shift_rows,
            shift_cols,
            shear,
            zoom_rows,
            zoom_cols,
            flip_horizontal,
        }
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f64) -> f64 {
    if range > 0.0 {
        rng.gen_range(-range..range)
    } else {
        0.0
    }
}

type Mat3 = [[f64; 3]; 3];

const IDENTITY: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

fn matmul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// One concrete draw from an [`AugmentationConfig`]. Angles are in degrees,
/// shifts in pixels; rows are the first image axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomTransform {
    pub theta: f64,
    pub shift_rows: f64,
    pub shift_cols: f64,
    pub shear: f64,
    pub zoom_rows: f64,
    pub zoom_cols: f64,
    pub flip_horizontal: bool,
}

impl RandomTransform {
    pub fn identity() -> Self {
        Self {
            theta: 0.0,
            shift_rows: 0.0,
            shift_cols: 0.0,
            shear: 0.0,
            zoom_rows: 1.0,
            zoom_cols: 1.0,
            flip_horizontal: false,
        }
    }

    /// Maps output (row, col, 1) to input coordinates, or `None` when the
    /// geometry is unchanged.
    fn affine(&self, height: u32, width: u32) -> Option<Mat3> {
        let mut m = IDENTITY;
        let mut touched = false;

        if self.theta != 0.0 {
            let t = self.theta.to_radians();
            m = [[t.cos(), -t.sin(), 0.0], [t.sin(), t.cos(), 0.0], [0.0, 0.0, 1.0]];
            touched = true;
        }
        if self.shift_rows != 0.0 || self.shift_cols != 0.0 {
            let shift = [
                [1.0, 0.0, self.shift_rows],
                [0.0, 1.0, self.shift_cols],
                [0.0, 0.0, 1.0],
            ];
            m = matmul(&m, &shift);
            touched = true;
        }
        if self.shear != 0.0 {
            let s = self.shear.to_radians();
            let shear = [[1.0, -s.sin(), 0.0], [0.0, s.cos(), 0.0], [0.0, 0.0, 1.0]];
            m = matmul(&m, &shear);
            touched = true;
        }
        if self.zoom_rows != 1.0 || self.zoom_cols != 1.0 {
            let zoom = [
                [self.zoom_rows, 0.0, 0.0],
                [0.0, self.zoom_cols, 0.0],
                [0.0, 0.0, 1.0],
            ];
            m = matmul(&m, &zoom);
            touched = true;
        }
        if !touched {
            return None;
        }

        let o_r = height as f64 / 2.0 - 0.5;
        let o_c = width as f64 / 2.0 - 0.5;
        let offset = [[1.0, 0.0, o_r], [0.0, 1.0, o_c], [0.0, 0.0, 1.0]];
        let reset = [[1.0, 0.0, -o_r], [0.0, 1.0, -o_c], [0.0, 0.0, 1.0]];
        Some(matmul(&matmul(&offset, &m), &reset))
    }

    /// Returns a float image with the same dimensions and intensity range as
    /// `img`.
    pub fn apply(&self, img: &RgbImage) -> Rgb32FImage {
        let (width, height) = img.dimensions();
        let affine = self.affine(height, width);

        Rgb32FImage::from_fn(width, height, |x, y| {
            let col = if self.flip_horizontal { width - 1 - x } else { x };
            match &affine {
                None => {
                    let p = img.get_pixel(col, y);
                    Rgb([p[0] as f32, p[1] as f32, p[2] as f32])
                }
                Some(m) => {
                    let (r, c) = (y as f64, col as f64);
                    let src_r = m[0][0] * r + m[0][1] * c + m[0][2];
                    let src_c = m[1][0] * r + m[1][1] * c + m[1][2];
                    sample_bilinear(img, src_r, src_c)
                }
            }
        })
    }
}

fn sample_bilinear(img: &RgbImage, row: f64, col: f64) -> Rgb<f32> {
    let (width, height) = img.dimensions();
    let row = row.clamp(0.0, (height - 1) as f64);
    let col = col.clamp(0.0, (width - 1) as f64);

    let r0 = row.floor() as u32;
    let c0 = col.floor() as u32;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let fr = (row - r0 as f64) as f32;
    let fc = (col - c0 as f64) as f32;

    let p00 = img.get_pixel(c0, r0);
    let p01 = img.get_pixel(c1, r0);
    let p10 = img.get_pixel(c0, r1);
    let p11 = img.get_pixel(c1, r1);

    let mut out = [0.0f32; 3];
    for (ch, value) in out.iter_mut().enumerate() {
        let top = p00[ch] as f32 * (1.0 - fc) + p01[ch] as f32 * fc;
        let bottom = p10[ch] as f32 * (1.0 - fc) + p11[ch] as f32 * fc;
        *value = top * (1.0 - fr) + bottom * fr;
    }
    Rgb(out)
}

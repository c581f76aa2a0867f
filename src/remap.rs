//! Dense undistortion map computation.
//!
//! For every corrected output pixel the engine finds the source location the
//! lens actually imaged it at: normalize through the intrinsics, push the
//! point through the forward Brown-Conrady distortion polynomial, project
//! back through the same intrinsics. Using one intrinsic matrix for both the
//! ideal and the distorted view sidesteps inverting the polynomial; the
//! shortcut holds because focal length and principal point are unchanged
//! between the two views.

use rayon::prelude::*;

use crate::camera::CameraModel;

/// Backward mapping from corrected pixels to source-image coordinates.
///
/// Entry (x, y) holds the source location to sample when producing corrected
/// pixel (x, y). Stored row-major as two f32 planes; the polynomial itself is
/// evaluated in f64, which keeps the map smooth out at the image corners
/// where r^6 terms dominate.
#[derive(Debug, Clone, PartialEq)]
pub struct UndistortionMap {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl UndistortionMap {
    /// Compute the map for `model` at the model's own resolution.
    ///
    /// Rows are independent, so they are filled in parallel; the result is
    /// identical to the sequential computation.
    pub fn compute(model: &CameraModel) -> Self {
        let width = model.width();
        let height = model.height();
        let w = width as usize;
        let len = w * height as usize;

        let mut map_x = vec![0.0f32; len];
        let mut map_y = vec![0.0f32; len];

        map_x
            .par_chunks_mut(w)
            .zip(map_y.par_chunks_mut(w))
            .enumerate()
            .for_each(|(y, (row_x, row_y))| {
                for x in 0..w {
                    let (sx, sy) = distort_pixel(model, x as f64, y as f64);
                    row_x[x] = sx as f32;
                    row_y[x] = sy as f32;
                }
            });

        Self {
            width,
            height,
            map_x,
            map_y,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Source coordinate for corrected pixel (x, y).
    #[inline]
    pub fn source(&self, x: u32, y: u32) -> (f32, f32) {
        let idx = y as usize * self.width as usize + x as usize;
        (self.map_x[idx], self.map_y[idx])
    }

    #[cfg(test)]
    pub(crate) fn from_raw(width: u32, height: u32, map_x: Vec<f32>, map_y: Vec<f32>) -> Self {
        assert_eq!(map_x.len(), width as usize * height as usize);
        assert_eq!(map_y.len(), map_x.len());
        Self {
            width,
            height,
            map_x,
            map_y,
        }
    }
}

/// Where the lens imaged the content of ideal pixel (u, v).
#[inline]
fn distort_pixel(model: &CameraModel, u: f64, v: f64) -> (f64, f64) {
    let (fx, fy) = model.focal();
    let (cx, cy) = model.principal_point();
    let [k1, k2, p1, p2, k3] = *model.distortion();

    // Normalized camera coordinates.
    let x = (u - cx) / fx;
    let y = (v - cy) / fy;

    let r2 = x * x + y * y;
    let r4 = r2 * r2;
    let r6 = r2 * r4;

    let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
    let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
    let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

    // Back to pixel coordinates through the same intrinsics.
    (fx * xd + cx, fy * yd + cy)
}

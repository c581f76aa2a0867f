//! Bilinear resampling of an image through an undistortion map.

use image::RgbImage;
use rayon::prelude::*;

use crate::error::DewarpError;
use crate::remap::UndistortionMap;

/// Resample `src` so that output pixel (x, y) takes its value from the
/// source location the map points at, with bilinear interpolation.
///
/// Source taps outside the image contribute black, matching the constant
/// zero border of the reference remap. The map must have been computed for
/// exactly this resolution.
pub fn remap(src: &RgbImage, map: &UndistortionMap) -> Result<RgbImage, DewarpError> {
    let (width, height) = src.dimensions();
    if (map.width(), map.height()) != (width, height) {
        return Err(DewarpError::DimensionMismatch {
            map_width: map.width(),
            map_height: map.height(),
            image_width: width,
            image_height: height,
        });
    }

    let w = width as usize;
    let mut out = RgbImage::new(width, height);

    let buffer: &mut [u8] = &mut out;
    buffer
        .par_chunks_mut(w * 3)
        .enumerate()
        .for_each(|(y, out_row)| {
            for x in 0..w {
                let (sx, sy) = map.source(x as u32, y as u32);
                let pixel = sample_bilinear(src, sx, sy);
                out_row[x * 3..x * 3 + 3].copy_from_slice(&pixel);
            }
        });

    Ok(out)
}

/// Bilinear interpolation at (x, y) with a black border.
#[inline]
fn sample_bilinear(src: &RgbImage, x: f32, y: f32) -> [u8; 3] {
    let x = x as f64;
    let y = y as f64;

    let fx = x - x.floor();
    let fy = y - y.floor();
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;

    let weights = [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ];

    let mut acc = [0.0f64; 3];
    for (dx, dy, weight) in weights {
        if let Some(p) = fetch(src, x0 + dx, y0 + dy) {
            acc[0] += weight * p[0] as f64;
            acc[1] += weight * p[1] as f64;
            acc[2] += weight * p[2] as f64;
        }
    }

    [
        acc[0].round().clamp(0.0, 255.0) as u8,
        acc[1].round().clamp(0.0, 255.0) as u8,
        acc[2].round().clamp(0.0, 255.0) as u8,
    ]
}

/// Pixel at integer coordinates, or `None` outside the image.
#[inline]
fn fetch(src: &RgbImage, x: i64, y: i64) -> Option<[u8; 3]> {
    if x < 0 || y < 0 || x >= src.width() as i64 || y >= src.height() as i64 {
        return None;
    }
    Some(src.get_pixel(x as u32, y as u32).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationRecord;
    use crate::camera::CameraModel;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 16) as u8, (y * 16) as u8, (x + y) as u8])
        })
    }

    fn identity_model(width: u32, height: u32) -> CameraModel {
        let record = CalibrationRecord {
            capture_date: "2020-01-01".to_string(),
            fx: 1024.0,
            fy: 1024.0,
            cx: 0.0,
            cy: 0.0,
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
        };
        CameraModel::new(&record, width, height)
    }

    #[test]
    fn identity_map_reproduces_source_exactly() {
        let src = gradient(16, 12);
        let map = UndistortionMap::compute(&identity_model(16, 12));
        let out = remap(&src, &map).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let src = gradient(16, 12);
        let map = UndistortionMap::compute(&identity_model(8, 8));
        let err = remap(&src, &map).unwrap_err();
        assert!(matches!(
            err,
            DewarpError::DimensionMismatch {
                map_width: 8,
                map_height: 8,
                image_width: 16,
                image_height: 12,
            }
        ));
    }

    #[test]
    fn out_of_bounds_taps_are_black() {
        let src = RgbImage::from_pixel(2, 1, image::Rgb([200, 100, 50]));
        // One entry far outside, one entirely in bounds.
        let map = UndistortionMap::from_raw(2, 1, vec![10.0, 1.0], vec![0.0, 0.0]);
        let out = remap(&src, &map).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(1, 0).0, [200, 100, 50]);
    }

    #[test]
    fn half_pixel_coordinates_interpolate() {
        let mut src = RgbImage::new(2, 1);
        src.put_pixel(0, 0, image::Rgb([0, 0, 0]));
        src.put_pixel(1, 0, image::Rgb([100, 200, 40]));

        let map = UndistortionMap::from_raw(2, 1, vec![0.5, 0.5], vec![0.0, 0.0]);
        let out = remap(&src, &map).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [50, 100, 20]);
        assert_eq!(out.get_pixel(1, 0).0, [50, 100, 20]);
    }

    #[test]
    fn border_rows_blend_with_black() {
        // A tap straddling the bottom edge: the out-of-image half contributes
        // zero rather than clamping to the edge row.
        let src = RgbImage::from_pixel(1, 1, image::Rgb([100, 100, 100]));
        let map = UndistortionMap::from_raw(1, 1, vec![0.0], vec![0.5]);
        let out = remap(&src, &map).unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [50, 50, 50]);
    }
}

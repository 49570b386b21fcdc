//! Raster helpers: intensity conversion, resampling and integral images.

use image::{GrayImage, RgbImage};

// ITU-R BT.601 luma weights in 14-bit fixed point.
const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;
const LUMA_ROUND: u32 = 1 << (LUMA_SHIFT - 1);

/// Convert an RGB image to single-channel intensity.
///
/// Uses BT.601 weights with fixed-point rounding so the result is bit-exact
/// across platforms. The input is left untouched.
pub fn to_intensity(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let data = image
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            let y = (LUMA_R * u32::from(r) + LUMA_G * u32::from(g) + LUMA_B * u32::from(b)
                + LUMA_ROUND)
                >> LUMA_SHIFT;
            y.min(255) as u8
        })
        .collect();
    // Buffer length always matches width * height.
    GrayImage::from_raw(width, height, data).unwrap_or_else(|| GrayImage::new(width, height))
}

/// Resize with bilinear interpolation (pixel-center aligned).
pub fn resize_bilinear(gray: &GrayImage, new_width: u32, new_height: u32) -> GrayImage {
    let (width, height) = (gray.width() as usize, gray.height() as usize);
    let (new_w, new_h) = (new_width as usize, new_height as usize);
    if width == 0 || height == 0 || new_w == 0 || new_h == 0 {
        return GrayImage::new(new_width, new_height);
    }
    if (width, height) == (new_w, new_h) {
        return gray.clone();
    }

    let frame = gray.as_raw();
    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;
    let mut resized = vec![0u8; new_w * new_h];

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayImage::from_raw(new_width, new_height, resized)
        .unwrap_or_else(|| GrayImage::new(new_width, new_height))
}

/// Resize with area interpolation.
///
/// When shrinking in both directions every output pixel is the
/// coverage-weighted mean of the source pixels it spans. Otherwise each
/// output pixel blends two source pixels per axis with OpenCV's area-mode
/// coefficients: the blend weight is the fractional overlap at the source
/// pixel boundary, so integer enlargements replicate pixels.
pub fn resize_area(gray: &GrayImage, new_width: u32, new_height: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 || new_width == 0 || new_height == 0 {
        return GrayImage::new(new_width, new_height);
    }
    if new_width > width || new_height > height {
        return resize_area_enlarge(gray, new_width, new_height);
    }
    if (width, height) == (new_width, new_height) {
        return gray.clone();
    }

    let cols = area_taps(width, new_width);
    let rows = area_taps(height, new_height);
    let src = gray.as_raw();
    let stride = width as usize;
    let mut out = Vec::with_capacity(new_width as usize * new_height as usize);

    for row_taps in &rows {
        for col_taps in &cols {
            let mut acc = 0.0f64;
            for &(sy, wy) in row_taps {
                let line = &src[sy * stride..(sy + 1) * stride];
                for &(sx, wx) in col_taps {
                    acc += f64::from(line[sx]) * wy * wx;
                }
            }
            out.push(acc.round().clamp(0.0, 255.0) as u8);
        }
    }

    GrayImage::from_raw(new_width, new_height, out)
        .unwrap_or_else(|| GrayImage::new(new_width, new_height))
}

fn resize_area_enlarge(gray: &GrayImage, new_width: u32, new_height: u32) -> GrayImage {
    let cols = area_mode_coeffs(gray.width(), new_width);
    let rows = area_mode_coeffs(gray.height(), new_height);
    let src = gray.as_raw();
    let stride = gray.width() as usize;
    let last_col = stride - 1;
    let last_row = gray.height() as usize - 1;
    let mut out = Vec::with_capacity(new_width as usize * new_height as usize);

    for &(sy, fy) in &rows {
        let top = &src[sy * stride..(sy + 1) * stride];
        let bottom_row = (sy + 1).min(last_row);
        let bottom = &src[bottom_row * stride..(bottom_row + 1) * stride];
        for &(sx, fx) in &cols {
            let sx1 = (sx + 1).min(last_col);
            let upper = f32::from(top[sx]) * (1.0 - fx) + f32::from(top[sx1]) * fx;
            let lower = f32::from(bottom[sx]) * (1.0 - fx) + f32::from(bottom[sx1]) * fx;
            let val = upper * (1.0 - fy) + lower * fy;
            out.push(val.round().clamp(0.0, 255.0) as u8);
        }
    }

    GrayImage::from_raw(new_width, new_height, out)
        .unwrap_or_else(|| GrayImage::new(new_width, new_height))
}

/// Per-destination `(left source index, weight of the right neighbour)`.
fn area_mode_coeffs(src: u32, dst: u32) -> Vec<(usize, f32)> {
    let scale = f64::from(src) / f64::from(dst);
    let inv_scale = f64::from(dst) / f64::from(src);
    let last = i64::from(src) - 1;
    (0..dst)
        .map(|d| {
            let mut s = (f64::from(d) * scale).floor() as i64;
            let mut f = (f64::from(d + 1) - (s + 1) as f64 * inv_scale) as f32;
            f = if f <= 0.0 { 0.0 } else { f - f.floor() };
            if s >= last {
                s = last;
                f = 0.0;
            }
            (s.max(0) as usize, f)
        })
        .collect()
}

/// Per-destination-index list of `(source index, weight)` with weights summing to 1.
fn area_taps(src: u32, dst: u32) -> Vec<Vec<(usize, f64)>> {
    let scale = f64::from(src) / f64::from(dst);
    (0..dst)
        .map(|d| {
            let start = f64::from(d) * scale;
            let end = (start + scale).min(f64::from(src));
            let mut taps = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src as usize {
                let lo = start.max(s as f64);
                let hi = end.min(s as f64 + 1.0);
                let weight = (hi - lo) / scale;
                if weight > 1e-9 {
                    taps.push((s, weight));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Summed-area tables of pixel values and squared pixel values.
pub struct IntegralImage {
    width: usize,
    sum: Vec<i64>,
    sq_sum: Vec<f64>,
}

impl IntegralImage {
    pub fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0i64; stride * (h + 1)];
        let mut sq_sum = vec![0f64; stride * (h + 1)];
        let src = gray.as_raw();

        for y in 0..h {
            let mut row = 0i64;
            let mut row_sq = 0f64;
            for x in 0..w {
                let v = i64::from(src[y * w + x]);
                row += v;
                row_sq += (v * v) as f64;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }

        Self { width: stride, sum, sq_sum }
    }

    /// Sum of pixels in the rectangle; the rectangle must lie inside the image.
    pub fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let s = self.width;
        self.sum[y1 * s + x1] - self.sum[y0 * s + x1] - self.sum[y1 * s + x0] + self.sum[y0 * s + x0]
    }

    /// Sum of squared pixels in the rectangle.
    pub fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let s = self.width;
        self.sq_sum[y1 * s + x1] - self.sq_sum[y0 * s + x1] - self.sq_sum[y1 * s + x0]
            + self.sq_sum[y0 * s + x0]
    }
}

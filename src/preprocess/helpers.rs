//! Shared pixel math: luminance projection, Sobel gradients, histograms.

use super::types::PixelBuffer;

/// ITU-R BT.601 luminance weights.
pub const LUMA_R: f32 = 0.299;
pub const LUMA_G: f32 = 0.587;
pub const LUMA_B: f32 = 0.114;

/// Sobel magnitude at or above which a pixel counts as an edge.
pub const EDGE_THRESHOLD: f32 = 30.0;

#[inline]
pub fn luminance(r: u8, g: u8, b: u8) -> f32 {
    LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32
}

/// Round and clamp a float sample back into a channel value.
#[inline]
pub fn clamp_channel(v: f32) -> u8 {
    if v.is_nan() {
        return 0;
    }
    v.round().clamp(0.0, 255.0) as u8
}

/// Grayscale projection of the buffer, one float per pixel.
pub fn luminance_plane(buf: &PixelBuffer) -> Vec<f32> {
    buf.data()
        .chunks_exact(4)
        .map(|p| luminance(p[0], p[1], p[2]))
        .collect()
}

/// 256-bin histogram of rounded luminance.
pub fn luminance_histogram(buf: &PixelBuffer) -> [u32; 256] {
    let mut hist = [0u32; 256];
    for p in buf.data().chunks_exact(4) {
        hist[clamp_channel(luminance(p[0], p[1], p[2])) as usize] += 1;
    }
    hist
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &v in values {
        let v = v as f64;
        sum += v;
        sum_sq += v * v;
    }
    let n = values.len() as f64;
    let mean = sum / n;
    let variance = (sum_sq / n) - mean * mean;
    (mean, variance.max(0.0).sqrt())
}

/// Sobel gradient magnitude over a grayscale plane. The one-pixel border is zero.
pub fn sobel_magnitude(plane: &[f32], width: u32, height: u32) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0.0f32; w * h];
    if w < 3 || h < 3 || plane.len() != w * h {
        return out;
    }
    for y in 1..h - 1 {
        let up = (y - 1) * w;
        let mid = y * w;
        let down = (y + 1) * w;
        for x in 1..w - 1 {
            let gx = -plane[up + x - 1] + plane[up + x + 1] - 2.0 * plane[mid + x - 1]
                + 2.0 * plane[mid + x + 1]
                - plane[down + x - 1]
                + plane[down + x + 1];
            let gy = -plane[up + x - 1] - 2.0 * plane[up + x] - plane[up + x + 1]
                + plane[down + x - 1]
                + 2.0 * plane[down + x]
                + plane[down + x + 1];
            out[mid + x] = (gx * gx + gy * gy).sqrt();
        }
    }
    out
}

/// Binary edge map: Sobel magnitude thresholded at [`EDGE_THRESHOLD`].
pub fn edge_map(buf: &PixelBuffer) -> Vec<bool> {
    let plane = luminance_plane(buf);
    sobel_magnitude(&plane, buf.width(), buf.height())
        .into_iter()
        .map(|m| m >= EDGE_THRESHOLD)
        .collect()
}

/// Fraction of pixels that are edges.
pub fn edge_ratio(buf: &PixelBuffer) -> f32 {
    let edges = edge_map(buf);
    if edges.is_empty() {
        return 0.0;
    }
    edges.iter().filter(|&&e| e).count() as f32 / edges.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half_split(width: u32, height: u32) -> PixelBuffer {
        let mut buf = PixelBuffer::filled(width, height, [255, 255, 255, 255]);
        for y in 0..height {
            for x in 0..width / 2 {
                buf.set_pixel(x, y, [0, 0, 0, 255]);
            }
        }
        buf
    }

    #[test]
    fn luminance_of_white_is_255() {
        assert!((luminance(255, 255, 255) - 255.0).abs() < 0.01);
        assert_eq!(luminance(0, 0, 0), 0.0);
    }

    #[test]
    fn clamp_channel_bounds() {
        assert_eq!(clamp_channel(-12.0), 0);
        assert_eq!(clamp_channel(300.0), 255);
        assert_eq!(clamp_channel(127.5), 128);
        assert_eq!(clamp_channel(f32::NAN), 0);
    }

    #[test]
    fn mean_std_of_constant_is_zero_spread() {
        let (mean, std) = mean_std(&[5.0; 10]);
        assert!((mean - 5.0).abs() < 1e-9);
        assert!(std < 1e-9);
        assert_eq!(mean_std(&[]), (0.0, 0.0));
    }

    #[test]
    fn sobel_flat_image_has_no_edges() {
        let buf = PixelBuffer::filled(20, 20, [128, 128, 128, 255]);
        assert_eq!(edge_ratio(&buf), 0.0);
    }

    #[test]
    fn sobel_detects_vertical_boundary() {
        let buf = half_split(20, 20);
        let edges = edge_map(&buf);
        // Columns 9 and 10 straddle the boundary on interior rows.
        assert!(edges[10 * 20 + 9]);
        assert!(edges[10 * 20 + 10]);
        assert!(!edges[10 * 20 + 2]);
        assert!(edge_ratio(&buf) > 0.0);
    }

    #[test]
    fn histogram_counts_every_pixel() {
        let buf = half_split(10, 10);
        let hist = luminance_histogram(&buf);
        assert_eq!(hist[0], 50);
        assert_eq!(hist[255], 50);
        assert_eq!(hist.iter().sum::<u32>(), 100);
    }
}

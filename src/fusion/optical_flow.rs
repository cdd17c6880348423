//! Optical Flow Computer
//! Mission: Derive per-frame horizontal camera motion from streamed video
//!
//! Dense two-frame flow in the Farneback parameterization (pyramid scale
//! 0.5, 3 levels, 15-pixel window, 3 iterations, 5-tap polynomial
//! neighborhood with sigma 1.2). The scalar output is the mean absolute
//! horizontal component, a proxy for camera pan velocity.

use nalgebra::{Matrix2, Vector2};
use tracing::{debug, warn};

const PYRAMID_LEVELS: usize = 3;
const WINDOW_SIZE: usize = 15;
const ITERATIONS: usize = 3;
const POLY_N: usize = 5;
const POLY_SIGMA: f64 = 1.2;
/// Levels smaller than this are dropped from the pyramid.
const MIN_LEVEL_DIM: usize = 16;

/// Grayscale frame as row-major f32 intensities in [0, 255].
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Frame {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn from_luma8(img: &image::GrayImage) -> Self {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let data = img.as_raw().iter().map(|&p| p as f32).collect();
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample with clamped coordinates.
    fn sample(&self, x: f64, y: f64) -> f32 {
        let x = x.clamp(0.0, (self.width - 1) as f64);
        let y = y.clamp(0.0, (self.height - 1) as f64);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;

        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x1, y0) * fx;
        let bottom = self.at(x0, y1) * (1.0 - fx) + self.at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Gaussian pre-smoothing with the polynomial-neighborhood kernel.
    fn smoothed(&self) -> Frame {
        let kernel = gaussian_kernel(POLY_N, POLY_SIGMA);
        let half = POLY_N / 2;

        // Separable: horizontal pass then vertical pass.
        let mut horizontal = vec![0.0f32; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0f32;
                for (k, &w) in kernel.iter().enumerate() {
                    let sx = (x + k).saturating_sub(half).min(self.width - 1);
                    acc += self.at(sx, y) * w;
                }
                horizontal[y * self.width + x] = acc;
            }
        }

        let mut out = vec![0.0f32; self.data.len()];
        for y in 0..self.height {
            for x in 0..self.width {
                let mut acc = 0.0f32;
                for (k, &w) in kernel.iter().enumerate() {
                    let sy = (y + k).saturating_sub(half).min(self.height - 1);
                    acc += horizontal[sy * self.width + x] * w;
                }
                out[y * self.width + x] = acc;
            }
        }

        Frame::new(self.width, self.height, out)
    }

    /// Half-resolution frame by 2x2 averaging (pyramid scale 0.5).
    fn downsampled(&self) -> Frame {
        let width = self.width / 2;
        let height = self.height / 2;
        let mut data = vec![0.0f32; width * height];

        for y in 0..height {
            for x in 0..width {
                let sum = self.at(2 * x, 2 * y)
                    + self.at(2 * x + 1, 2 * y)
                    + self.at(2 * x, 2 * y + 1)
                    + self.at(2 * x + 1, 2 * y + 1);
                data[y * width + x] = sum / 4.0;
            }
        }

        Frame::new(width, height, data)
    }
}

fn gaussian_kernel(n: usize, sigma: f64) -> Vec<f32> {
    let half = (n / 2) as f64;
    let mut kernel: Vec<f32> = (0..n)
        .map(|i| {
            let d = i as f64 - half;
            (-d * d / (2.0 * sigma * sigma)).exp() as f32
        })
        .collect();

    let sum: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// Dense flow field for one frame pair.
struct FlowField {
    width: usize,
    height: usize,
    u: Vec<f32>,
    v: Vec<f32>,
}

impl FlowField {
    fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            u: vec![0.0; width * height],
            v: vec![0.0; width * height],
        }
    }

    /// Upsample to the next-finer level, doubling displacements.
    fn upsampled(&self, width: usize, height: usize) -> Self {
        let mut out = FlowField::zeros(width, height);
        for y in 0..height {
            for x in 0..width {
                let sx = (x / 2).min(self.width - 1);
                let sy = (y / 2).min(self.height - 1);
                out.u[y * width + x] = self.u[sy * self.width + sx] * 2.0;
                out.v[y * width + x] = self.v[sy * self.width + sx] * 2.0;
            }
        }
        out
    }
}

/// Summed-area table for fast window sums.
struct Integral {
    width: usize,
    table: Vec<f64>,
}

impl Integral {
    fn build(width: usize, height: usize, values: &[f32]) -> Self {
        let w1 = width + 1;
        let mut table = vec![0.0f64; w1 * (height + 1)];
        for y in 0..height {
            let mut row = 0.0f64;
            for x in 0..width {
                row += values[y * width + x] as f64;
                table[(y + 1) * w1 + (x + 1)] = table[y * w1 + (x + 1)] + row;
            }
        }
        Self { width: w1, table }
    }

    /// Sum over the inclusive rectangle [x0, x1] x [y0, y1].
    fn sum(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let w = self.width;
        self.table[(y1 + 1) * w + (x1 + 1)] - self.table[y0 * w + (x1 + 1)]
            - self.table[(y1 + 1) * w + x0]
            + self.table[y0 * w + x0]
    }
}

/// Stateful optical-flow engine holding the previous grayscale frame.
pub struct OpticalFlowEngine {
    prev: Option<Frame>,
}

impl OpticalFlowEngine {
    pub fn new() -> Self {
        Self { prev: None }
    }

    /// Decode an incoming chunk and fold it into the flow state.
    /// Returns the mean absolute horizontal flow, or `None` while
    /// bootstrapping or when the chunk does not decode.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Option<f64> {
        let decoded = match image::load_from_memory(chunk) {
            Ok(img) => img.to_luma8(),
            Err(e) => {
                warn!(error = %e, chunk_bytes = chunk.len(), "Failed to decode video frame");
                return None;
            }
        };

        self.push_frame(Frame::from_luma8(&decoded))
    }

    /// Advance the engine by one already-decoded grayscale frame.
    pub fn push_frame(&mut self, frame: Frame) -> Option<f64> {
        let prev = match self.prev.take() {
            Some(prev) => prev,
            None => {
                self.prev = Some(frame);
                return None;
            }
        };

        let magnitude = if prev.width == frame.width && prev.height == frame.height {
            let flow = compute_dense_flow(&prev, &frame);
            Some(mean_abs_horizontal(&flow))
        } else {
            warn!(
                prev_dims = ?(prev.width, prev.height),
                next_dims = ?(frame.width, frame.height),
                "Frame dimensions changed mid-stream; skipping pair"
            );
            None
        };

        self.prev = Some(frame);
        magnitude
    }

    /// Clear state at session end.
    pub fn reset(&mut self) {
        self.prev = None;
        debug!("Optical flow engine reset");
    }
}

impl Default for OpticalFlowEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse-to-fine dense flow between two equally-sized frames.
fn compute_dense_flow(prev: &Frame, next: &Frame) -> FlowField {
    let prev_smooth = prev.smoothed();
    let next_smooth = next.smoothed();

    // Build pyramids, coarsest last.
    let mut prev_pyramid = vec![prev_smooth];
    let mut next_pyramid = vec![next_smooth];
    for _ in 1..PYRAMID_LEVELS {
        let top = prev_pyramid.last().unwrap();
        if top.width / 2 < MIN_LEVEL_DIM || top.height / 2 < MIN_LEVEL_DIM {
            break;
        }
        let prev_down = top.downsampled();
        let next_down = next_pyramid.last().unwrap().downsampled();
        prev_pyramid.push(prev_down);
        next_pyramid.push(next_down);
    }

    let coarsest = prev_pyramid.len() - 1;
    let mut flow = FlowField::zeros(prev_pyramid[coarsest].width, prev_pyramid[coarsest].height);

    for level in (0..prev_pyramid.len()).rev() {
        let p = &prev_pyramid[level];
        let n = &next_pyramid[level];

        if flow.width != p.width || flow.height != p.height {
            flow = flow.upsampled(p.width, p.height);
        }

        for _ in 0..ITERATIONS {
            refine_flow(p, n, &mut flow);
        }
    }

    flow
}

/// One window-averaged least-squares refinement pass over the whole field.
fn refine_flow(prev: &Frame, next: &Frame, flow: &mut FlowField) {
    let (w, h) = (prev.width, prev.height);
    let half = WINDOW_SIZE / 2;

    // Spatial gradients of the previous frame (central differences).
    let mut ix = vec![0.0f32; w * h];
    let mut iy = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let xl = x.saturating_sub(1);
            let xr = (x + 1).min(w - 1);
            let yu = y.saturating_sub(1);
            let yd = (y + 1).min(h - 1);
            ix[y * w + x] = (prev.at(xr, y) - prev.at(xl, y)) / 2.0;
            iy[y * w + x] = (prev.at(x, yd) - prev.at(x, yu)) / 2.0;
        }
    }

    // Temporal difference against the warped next frame.
    let mut it = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let warped = next.sample(x as f64 + flow.u[i] as f64, y as f64 + flow.v[i] as f64);
            it[i] = warped - prev.at(x, y);
        }
    }

    // Window sums of the normal-equation terms via integral images.
    let products: Vec<Vec<f32>> = vec![
        ix.iter().map(|g| g * g).collect(),
        ix.iter().zip(&iy).map(|(gx, gy)| gx * gy).collect(),
        iy.iter().map(|g| g * g).collect(),
        ix.iter().zip(&it).map(|(gx, t)| gx * t).collect(),
        iy.iter().zip(&it).map(|(gy, t)| gy * t).collect(),
    ];
    let integrals: Vec<Integral> = products
        .iter()
        .map(|p| Integral::build(w, h, p))
        .collect();

    for y in 0..h {
        for x in 0..w {
            let x0 = x.saturating_sub(half);
            let y0 = y.saturating_sub(half);
            let x1 = (x + half).min(w - 1);
            let y1 = (y + half).min(h - 1);

            let sxx = integrals[0].sum(x0, y0, x1, y1);
            let sxy = integrals[1].sum(x0, y0, x1, y1);
            let syy = integrals[2].sum(x0, y0, x1, y1);
            let sxt = integrals[3].sum(x0, y0, x1, y1);
            let syt = integrals[4].sum(x0, y0, x1, y1);

            let a = Matrix2::new(sxx, sxy, sxy, syy);
            if a.determinant().abs() < 1e-6 {
                continue;
            }

            let b = Vector2::new(-sxt, -syt);
            if let Some(inv) = a.try_inverse() {
                let d = inv * b;
                let i = y * w + x;
                flow.u[i] += d.x as f32;
                flow.v[i] += d.y as f32;
            }
        }
    }
}

/// Mean absolute horizontal component over the interior (window margin
/// excluded; border estimates are unreliable).
fn mean_abs_horizontal(flow: &FlowField) -> f64 {
    let half = WINDOW_SIZE / 2;
    if flow.width <= 2 * half || flow.height <= 2 * half {
        let sum: f64 = flow.u.iter().map(|u| u.abs() as f64).sum();
        return sum / flow.u.len().max(1) as f64;
    }

    let mut sum = 0.0f64;
    let mut count = 0usize;
    for y in half..flow.height - half {
        for x in half..flow.width - half {
            sum += flow.u[y * flow.width + x].abs() as f64;
            count += 1;
        }
    }
    sum / count.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth synthetic texture with structure in both axes.
    fn test_pattern(width: usize, height: usize, shift_x: f64) -> Frame {
        let mut data = vec![0.0f32; width * height];
        for y in 0..height {
            for x in 0..width {
                let fx = (x as f64 - shift_x) * 0.22;
                let fy = y as f64 * 0.19;
                let value = 128.0 + 60.0 * fx.sin() + 40.0 * fy.cos() + 20.0 * (fx + fy).sin();
                data[y * width + x] = value as f32;
            }
        }
        Frame::new(width, height, data)
    }

    #[test]
    fn test_first_frame_bootstraps() {
        let mut engine = OpticalFlowEngine::new();
        assert!(engine.push_frame(test_pattern(64, 64, 0.0)).is_none());
    }

    #[test]
    fn test_no_motion_yields_near_zero_flow() {
        let mut engine = OpticalFlowEngine::new();
        engine.push_frame(test_pattern(64, 64, 0.0));
        let magnitude = engine.push_frame(test_pattern(64, 64, 0.0)).unwrap();

        assert!(magnitude < 0.05, "expected ~0 flow, got {magnitude}");
    }

    #[test]
    fn test_horizontal_shift_detected() {
        let mut engine = OpticalFlowEngine::new();
        engine.push_frame(test_pattern(64, 64, 0.0));
        let magnitude = engine.push_frame(test_pattern(64, 64, 2.0)).unwrap();

        assert!(
            magnitude > 0.5,
            "expected noticeable horizontal flow, got {magnitude}"
        );
    }

    #[test]
    fn test_larger_shift_larger_flow() {
        let mut small = OpticalFlowEngine::new();
        small.push_frame(test_pattern(64, 64, 0.0));
        let m_small = small.push_frame(test_pattern(64, 64, 1.0)).unwrap();

        let mut large = OpticalFlowEngine::new();
        large.push_frame(test_pattern(64, 64, 0.0));
        let m_large = large.push_frame(test_pattern(64, 64, 3.0)).unwrap();

        assert!(m_large > m_small);
    }

    #[test]
    fn test_undecodable_chunk_yields_none() {
        let mut engine = OpticalFlowEngine::new();
        assert!(engine.process_chunk(&[0x00, 0x01, 0x02, 0x03]).is_none());
    }

    #[test]
    fn test_decode_roundtrip_via_png() {
        use image::{GrayImage, Luma};

        let mut img = GrayImage::new(48, 48);
        for y in 0..48 {
            for x in 0..48 {
                let v = ((x as f64 * 0.3).sin() * 100.0 + 128.0) as u8;
                img.put_pixel(x, y, Luma([v]));
            }
        }

        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();

        let mut engine = OpticalFlowEngine::new();
        assert!(engine.process_chunk(&bytes).is_none()); // bootstrap
        let magnitude = engine.process_chunk(&bytes).unwrap();
        assert!(magnitude < 0.1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut engine = OpticalFlowEngine::new();
        engine.push_frame(test_pattern(32, 32, 0.0));
        engine.reset();
        assert!(engine.push_frame(test_pattern(32, 32, 0.0)).is_none());
    }

    #[test]
    fn test_dimension_change_skips_pair() {
        let mut engine = OpticalFlowEngine::new();
        engine.push_frame(test_pattern(64, 64, 0.0));
        assert!(engine.push_frame(test_pattern(32, 32, 0.0)).is_none());
    }
}

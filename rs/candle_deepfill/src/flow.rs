//! Flow visualisation
//!
//! Renders a displacement field with the Middlebury colour wheel: direction
//! picks the hue, length picks the saturation, zero displacement is white.

use candle_core::{DType, Result, Tensor};
use image::RgbImage;

/// Components larger than this are treated as unknown flow
pub const UNKNOWN_FLOW_THRESHOLD: f32 = 1e7;

const RY: usize = 15;
const YG: usize = 6;
const GC: usize = 4;
const CB: usize = 11;
const BM: usize = 13;
const MR: usize = 6;

/// The 55 hues of the Middlebury colour wheel, RGB in [0, 255].
pub fn color_wheel() -> Vec<[f32; 3]> {
    let mut wheel = Vec::with_capacity(RY + YG + GC + CB + BM + MR);
    let ramp = |i: usize, n: usize| 255.0 * i as f32 / n as f32;
    for i in 0..RY {
        wheel.push([255.0, ramp(i, RY), 0.0]);
    }
    for i in 0..YG {
        wheel.push([255.0 - ramp(i, YG), 255.0, 0.0]);
    }
    for i in 0..GC {
        wheel.push([0.0, 255.0, ramp(i, GC)]);
    }
    for i in 0..CB {
        wheel.push([0.0, 255.0 - ramp(i, CB), 255.0]);
    }
    for i in 0..BM {
        wheel.push([ramp(i, BM), 0.0, 255.0]);
    }
    for i in 0..MR {
        wheel.push([255.0, 0.0, 255.0 - ramp(i, MR)]);
    }
    wheel
}

/// Colour of one normalised displacement `(u, v)` (columns, rows), in [0, 1].
fn compute_color(wheel: &[[f32; 3]], u: f32, v: f32) -> [f32; 3] {
    let ncols = wheel.len();
    let rad = (u * u + v * v).sqrt();
    let angle = (-v).atan2(-u) / std::f32::consts::PI;
    let fk = (angle + 1.0) / 2.0 * (ncols - 1) as f32;
    let k0 = (fk.floor() as usize).min(ncols - 1);
    let k1 = if k0 + 1 == ncols { 0 } else { k0 + 1 };
    let f = fk - k0 as f32;

    let mut rgb = [0f32; 3];
    for (c, out) in rgb.iter_mut().enumerate() {
        let col0 = wheel[k0][c] / 255.0;
        let col1 = wheel[k1][c] / 255.0;
        let col = (1.0 - f) * col0 + f * col1;
        *out = if rad <= 1.0 {
            1.0 - rad * (1.0 - col)
        } else {
            col * 0.75
        };
    }
    rgb
}

/// Render a [B, 2, H, W] flow (channel 0 rows, channel 1 columns) as
/// [B, 3, H, W] colours in [0, 1].
///
/// Lengths are normalised by the longest vector in the whole batch.
pub fn flow_to_rgb(flow: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = flow.dims4()?;
    if c != 2 {
        candle_core::bail!("flow must have two channels, got {c}");
    }
    let values: Vec<f32> = flow.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let plane = h * w;

    let component = |bi: usize, ch: usize, i: usize| {
        let v = values[(bi * 2 + ch) * plane + i];
        if v.abs() > UNKNOWN_FLOW_THRESHOLD || !v.is_finite() {
            None
        } else {
            Some(v)
        }
    };
    let vector = |bi: usize, i: usize| match (component(bi, 0, i), component(bi, 1, i)) {
        (Some(dy), Some(dx)) => (dy, dx),
        _ => (0.0, 0.0),
    };

    let mut max_rad = 0f32;
    for bi in 0..b {
        for i in 0..plane {
            let (dy, dx) = vector(bi, i);
            max_rad = max_rad.max((dy * dy + dx * dx).sqrt());
        }
    }
    let scale = if max_rad > 0.0 { 1.0 / max_rad } else { 0.0 };

    let wheel = color_wheel();
    let mut rgb = vec![0f32; b * 3 * plane];
    for bi in 0..b {
        for i in 0..plane {
            let (dy, dx) = vector(bi, i);
            let color = compute_color(&wheel, dx * scale, dy * scale);
            for (ch, value) in color.iter().enumerate() {
                rgb[(bi * 3 + ch) * plane + i] = *value;
            }
        }
    }
    Tensor::from_vec(rgb, (b, 3, h, w), flow.device())
}

/// Render the flow of batch element `index` as an 8-bit image.
pub fn flow_to_image(flow: &Tensor, index: usize) -> Result<RgbImage> {
    let (b, _, h, w) = flow.dims4()?;
    if index >= b {
        candle_core::bail!("batch index {index} out of range for {b} flows");
    }
    let rgb = flow_to_rgb(&flow.narrow(0, index, 1)?)?;
    // [1, 3, H, W] -> [H, W, 3] bytes
    let bytes: Vec<u8> = rgb
        .squeeze(0)?
        .permute((1, 2, 0))?
        .affine(255.0, 0.0)?
        .round()?
        .clamp(0.0, 255.0)?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1()?;
    RgbImage::from_raw(w as u32, h as u32, bytes)
        .ok_or_else(|| candle_core::Error::Msg("flow image buffer size mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn single_vector(dy: f32, dx: f32) -> Tensor {
        Tensor::new(&[dy, dx], &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 1))
            .unwrap()
    }

    fn pixel(flow: &Tensor) -> [f32; 3] {
        let values: Vec<f32> = flow_to_rgb(flow)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        [values[0], values[1], values[2]]
    }

    #[test]
    fn test_color_wheel_has_55_hues() {
        let wheel = color_wheel();
        assert_eq!(wheel.len(), 55);
        assert_eq!(wheel[0], [255.0, 0.0, 0.0]);
        // Start of the yellow-green segment
        assert_eq!(wheel[15], [255.0, 255.0, 0.0]);
    }

    #[test]
    fn test_zero_flow_is_white() {
        let rgb = pixel(&single_vector(0.0, 0.0));
        for c in rgb {
            assert!((c - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rightward_flow_is_red() {
        // Full-length vector pointing along +columns lands on the first hue
        let rgb = pixel(&single_vector(0.0, 3.0));
        assert!((rgb[0] - 1.0).abs() < 1e-5, "{rgb:?}");
        assert!(rgb[1].abs() < 1e-5, "{rgb:?}");
        assert!(rgb[2].abs() < 1e-5, "{rgb:?}");
    }

    #[test]
    fn test_unknown_flow_renders_as_zero() {
        let rgb = pixel(&single_vector(1e8, 2.0));
        for c in rgb {
            assert!((c - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_flow_to_image() {
        let device = Device::Cpu;
        let flow = Tensor::zeros((2, 2, 3, 5), DType::F32, &device).unwrap();
        let img = flow_to_image(&flow, 1).unwrap();
        assert_eq!(img.dimensions(), (5, 3));
        assert_eq!(img.get_pixel(4, 2).0, [255, 255, 255]);
        assert!(flow_to_image(&flow, 2).is_err());
    }

    #[test]
    fn test_flow_to_rgb_rejects_wrong_channels() {
        let device = Device::Cpu;
        let flow = Tensor::zeros((1, 3, 2, 2), DType::F32, &device).unwrap();
        assert!(flow_to_rgb(&flow).is_err());
    }
}

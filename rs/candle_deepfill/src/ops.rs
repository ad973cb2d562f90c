//! Small tensor helpers shared by the operator, the model and the CLI.

use candle_core::{Result, Tensor};

/// Resize a [B, 1, H, W] mask to `(height, width)`.
///
/// Integer downscales average each block (so partially covered cells keep a
/// fractional value), everything else uses nearest neighbour.
pub fn resize_mask(mask: &Tensor, height: usize, width: usize) -> Result<Tensor> {
    let (_, _, mh, mw) = mask.dims4()?;
    if (mh, mw) == (height, width) {
        return Ok(mask.clone());
    }
    if mh >= height && mw >= width && mh % height == 0 && mw % width == 0 {
        mask.avg_pool2d((mh / height, mw / width))
    } else {
        mask.upsample_nearest2d(height, width)
    }
}

/// Resize a mask to the spatial size of `like`.
pub fn resize_mask_like(mask: &Tensor, like: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = like.dims4()?;
    resize_mask(mask, h, w)
}

/// Map values linearly from `from` to `to`, e.g. pixels (0, 255) -> (-1, 1).
pub fn normalize_range(xs: &Tensor, from: (f64, f64), to: (f64, f64)) -> Result<Tensor> {
    let scale = (to.1 - to.0) / (from.1 - from.0);
    xs.affine(scale, to.0 - from.0 * scale)
}

/// Keep `original` outside the hole and take `prediction` inside it.
pub fn composite(prediction: &Tensor, original: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let keep = mask.affine(-1.0, 1.0)?;
    prediction
        .broadcast_mul(mask)?
        .add(&original.broadcast_mul(&keep)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_resize_mask_area_downscale() {
        let device = Device::Cpu;
        // Top-left 2x2 block fully masked, top-right block half masked
        let mask = Tensor::new(
            &[
                [1.0f32, 1.0, 1.0, 0.0],
                [1.0, 1.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
            ],
            &device,
        )
        .unwrap()
        .reshape((1, 1, 4, 4))
        .unwrap();
        let resized = resize_mask(&mask, 2, 2).unwrap();
        let values: Vec<f32> = resized.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_resize_mask_upscale() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[1.0f32, 0.0], [0.0, 0.0]], &device)
            .unwrap()
            .reshape((1, 1, 2, 2))
            .unwrap();
        let resized = resize_mask(&mask, 4, 4).unwrap();
        assert_eq!(resized.dims(), &[1, 1, 4, 4]);
        let sum = resized.sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 4.0);
    }

    #[test]
    fn test_resize_mask_like() {
        let device = Device::Cpu;
        let mask = Tensor::ones((2, 1, 16, 16), DType::F32, &device).unwrap();
        let features = Tensor::zeros((2, 8, 4, 4), DType::F32, &device).unwrap();
        let resized = resize_mask_like(&mask, &features).unwrap();
        assert_eq!(resized.dims(), &[2, 1, 4, 4]);
    }

    #[test]
    fn test_normalize_range() {
        let device = Device::Cpu;
        let pixels = Tensor::new(&[0.0f32, 127.5, 255.0], &device).unwrap();
        let normalized = normalize_range(&pixels, (0.0, 255.0), (-1.0, 1.0)).unwrap();
        let values: Vec<f32> = normalized.to_vec1().unwrap();
        assert!((values[0] + 1.0).abs() < 1e-6);
        assert!(values[1].abs() < 1e-6);
        assert!((values[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_composite() {
        let device = Device::Cpu;
        let prediction = Tensor::full(7.0f32, (1, 3, 1, 2), &device).unwrap();
        let original = Tensor::full(2.0f32, (1, 3, 1, 2), &device).unwrap();
        let mask = Tensor::new(&[1.0f32, 0.0], &device)
            .unwrap()
            .reshape((1, 1, 1, 2))
            .unwrap();
        let out = composite(&prediction, &original, &mask).unwrap();
        let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![7.0, 2.0, 7.0, 2.0, 7.0, 2.0]);
    }
}

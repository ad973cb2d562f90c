//! Image Preprocessing for inpainting
//!
//! Converts between `image` buffers and tensors:
//! 1. RGB images become [3, H, W] tensors in [0, 1]
//! 2. Mask images and generated masks become [1, H, W] tensors in {0, 1}
//! 3. Network outputs are mapped back to 8-bit RGB images

use candle_core::{DType, Device, Result, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use inpaint_masks::{Mask, MASK_IMAGE_THRESHOLD};

/// Load an image from disk and return it as a DynamicImage
pub fn load_image(path: &str) -> anyhow::Result<DynamicImage> {
    let img = image::open(path)?;
    Ok(img)
}

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1]
///
/// # Arguments
/// * `img` - Input image
/// * `device` - Device to create tensor on
///
/// # Returns
/// Tensor of shape [3, H, W] with values in [0.0, 1.0]
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let (h, w) = (height as usize, width as usize);

    // HWC bytes -> CHW floats
    let raw = img.into_raw();
    let mut chw = vec![0.0f32; 3 * h * w];
    for (i, pixel) in raw.chunks_exact(3).enumerate() {
        for (c, &value) in pixel.iter().enumerate() {
            chw[c * h * w + i] = value as f32 / 255.0;
        }
    }
    Tensor::from_vec(chw, (3, h, w), device)
}

/// Convert a mask image to a binary [1, H, W] tensor.
///
/// The image is reduced to luma; pixels at or above [`MASK_IMAGE_THRESHOLD`]
/// become 1.
pub fn mask_image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let luma = img.to_luma8();
    let (width, height) = luma.dimensions();
    let data: Vec<f32> = luma
        .into_raw()
        .into_iter()
        .map(|v| if v >= MASK_IMAGE_THRESHOLD { 1.0 } else { 0.0 })
        .collect();
    Tensor::from_vec(data, (1, height as usize, width as usize), device)
}

/// Convert a generated mask to a [1, H, W] tensor.
pub fn mask_to_tensor(mask: &Mask, device: &Device) -> Result<Tensor> {
    Tensor::from_slice(&mask.data, (1, mask.height, mask.width), device)
}

/// Convert a [3, H, W] tensor with values in [0, 1] to an RGB image.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let (c, h, w) = tensor.dims3()?;
    if c != 3 {
        candle_core::bail!("expected 3 channels, got {c}");
    }
    let bytes: Vec<u8> = tensor
        .to_dtype(DType::F32)?
        .clamp(0.0, 1.0)?
        .affine(255.0, 0.0)?
        .round()?
        .permute((1, 2, 0))?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1()?;
    RgbImage::from_raw(w as u32, h as u32, bytes)
        .ok_or_else(|| candle_core::Error::Msg("image buffer size mismatch".to_string()))
}

/// Largest size not above `(width, height)` whose sides are multiples of
/// `multiple`, at least one multiple each.
pub fn fit_to_multiple(width: u32, height: u32, multiple: u32) -> (u32, u32) {
    let fit = |v: u32| ((v / multiple) * multiple).max(multiple);
    (fit(width), fit(height))
}

/// Resize an image so both sides are multiples of `multiple`.
pub fn resize_to_multiple(img: &DynamicImage, multiple: u32) -> DynamicImage {
    let (width, height) = fit_to_multiple(img.width(), img.height(), multiple);
    if (width, height) == (img.width(), img.height()) {
        img.clone()
    } else {
        img.resize_exact(width, height, FilterType::Triangle)
    }
}

/// Add batch dimension to a preprocessed image tensor
///
/// # Arguments
/// * `tensor` - Tensor of shape [C, H, W]
///
/// # Returns
/// Tensor of shape [1, C, H, W]
pub fn add_batch_dim(tensor: &Tensor) -> Result<Tensor> {
    tensor.unsqueeze(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb};

    #[test]
    fn test_image_to_tensor_layout() {
        let device = Device::Cpu;
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 51]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));
        let tensor = image_to_tensor(&DynamicImage::ImageRgb8(img), &device).unwrap();
        assert_eq!(tensor.dims(), &[3, 1, 2]);

        let data: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        // R plane, G plane, B plane
        assert!((data[0] - 1.0).abs() < 1e-6);
        assert!(data[1].abs() < 1e-6);
        assert!((data[3] - 1.0).abs() < 1e-6);
        assert!((data[4] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_mask_image_threshold() {
        let device = Device::Cpu;
        let mut img = GrayImage::new(3, 1);
        img.put_pixel(0, 0, Luma([0]));
        img.put_pixel(1, 0, Luma([127]));
        img.put_pixel(2, 0, Luma([128]));
        let tensor = mask_image_to_tensor(&DynamicImage::ImageLuma8(img), &device).unwrap();
        let data: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(data, vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_mask_to_tensor() {
        let device = Device::Cpu;
        let mut mask = Mask::new(4, 2);
        mask.data[5] = 1.0;
        let tensor = mask_to_tensor(&mask, &device).unwrap();
        assert_eq!(tensor.dims(), &[1, 2, 4]);
        let rows: Vec<Vec<f32>> = tensor.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[1][1], 1.0);
    }

    #[test]
    fn test_tensor_to_image_round_trip() {
        let device = Device::Cpu;
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, Rgb([10, 200, 99]));
        let tensor = image_to_tensor(&DynamicImage::ImageRgb8(img.clone()), &device).unwrap();
        let back = tensor_to_image(&tensor).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn test_tensor_to_image_clamps() {
        let device = Device::Cpu;
        let tensor = Tensor::new(&[[[-0.5f32]], [[0.5]], [[1.5]]], &device).unwrap();
        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0, 128, 255]);
    }

    #[test]
    fn test_fit_to_multiple() {
        assert_eq!(fit_to_multiple(640, 480, 8), (640, 480));
        assert_eq!(fit_to_multiple(645, 487, 8), (640, 480));
        assert_eq!(fit_to_multiple(5, 3, 8), (8, 8));
    }

    #[test]
    fn test_resize_to_multiple() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(21, 17));
        let resized = resize_to_multiple(&img, 8);
        assert_eq!((resized.width(), resized.height()), (16, 16));
    }

    #[test]
    fn test_add_batch_dim() {
        let device = Device::Cpu;
        let input = Tensor::zeros((3, 8, 8), DType::F32, &device).unwrap();
        assert_eq!(add_batch_dim(&input).unwrap().dims(), &[1, 3, 8, 8]);
    }
}

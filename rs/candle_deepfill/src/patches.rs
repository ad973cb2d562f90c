//! Patch primitives behind contextual attention
//!
//! Matching and pasting are split into three plain tensor operations so each
//! can be checked on its own:
//!
//! - [`extract_patches`]: sliding-window patch bank, `(B, C, H, W) -> (B, L, C, k, k)`
//! - [`correlate`]: batched inner products between query and candidate vectors
//! - [`fold_patches`]: weighted scatter-accumulate of a patch bank back onto a grid
//!
//! Windows are enumerated row-major over the window grid, so candidate `l`
//! sits at grid position `(l / Lw, l % Lw)`.

use candle_core::{Device, Tensor, D};

use crate::error::{shape_bail, Result};

/// How the border is filled before windows are taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchPadding {
    /// Pad with zeros, matching a "same" convolution
    #[default]
    Zeros,
    /// Repeat the edge row/column outward
    Replicate,
}

impl PatchPadding {
    fn apply(self, xs: &Tensor, padding: usize) -> candle_core::Result<Tensor> {
        if padding == 0 {
            return Ok(xs.clone());
        }
        match self {
            PatchPadding::Zeros => xs
                .pad_with_zeros(2, padding, padding)?
                .pad_with_zeros(3, padding, padding),
            PatchPadding::Replicate => xs
                .pad_with_same(2, padding, padding)?
                .pad_with_same(3, padding, padding),
        }
    }
}

/// Number of windows along one axis, or `None` when no window fits.
pub fn window_count(len: usize, ksize: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = len + 2 * padding;
    if ksize == 0 || stride == 0 || padded < ksize {
        return None;
    }
    Some((padded - ksize) / stride + 1)
}

fn strided_index(count: usize, stride: usize, device: &Device) -> candle_core::Result<Tensor> {
    let index: Vec<u32> = (0..count).map(|i| (i * stride) as u32).collect();
    Tensor::from_vec(index, count, device)
}

/// Extract every `ksize x ksize` window of `xs` at the given stride.
///
/// # Arguments
/// * `xs` - Input of shape [B, C, H, W]
/// * `ksize` - Window side length
/// * `stride` - Step between window origins
/// * `padding` - Border added on every side before extraction
/// * `mode` - How the border is filled
///
/// # Returns
/// Patch bank of shape [B, L, C, ksize, ksize] with `L = Lh * Lw`
pub fn extract_patches(
    xs: &Tensor,
    ksize: usize,
    stride: usize,
    padding: usize,
    mode: PatchPadding,
) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    let (Some(lh), Some(lw)) = (
        window_count(h, ksize, stride, padding),
        window_count(w, ksize, stride, padding),
    ) else {
        shape_bail!(
            "cannot take {ksize}x{ksize} windows with stride {stride} from a {h}x{w} map padded by {padding}"
        );
    };

    let padded = mode.apply(xs, padding)?;
    let span_h = (lh - 1) * stride + 1;
    let span_w = (lw - 1) * stride + 1;
    let subsample = if stride > 1 {
        Some((
            strided_index(lh, stride, xs.device())?,
            strided_index(lw, stride, xs.device())?,
        ))
    } else {
        None
    };

    // One shifted view per kernel tap, each [B, C, Lh, Lw]
    let mut taps = Vec::with_capacity(ksize * ksize);
    for dy in 0..ksize {
        for dx in 0..ksize {
            let tap = padded.narrow(2, dy, span_h)?.narrow(3, dx, span_w)?;
            let tap = match &subsample {
                Some((rows, cols)) => tap
                    .contiguous()?
                    .index_select(rows, 2)?
                    .index_select(cols, 3)?,
                None => tap,
            };
            taps.push(tap);
        }
    }

    // [B, C, k*k, Lh, Lw] -> [B, Lh, Lw, C, k*k] -> [B, L, C, k, k]
    let patches = Tensor::stack(&taps, 2)?
        .permute((0, 3, 4, 1, 2))?
        .contiguous()?
        .reshape((b, lh * lw, c, ksize, ksize))?;
    Ok(patches)
}

/// Scale every vector along the last axis to unit length.
///
/// `eps` is added under the square root so all-zero vectors come out as zeros
/// instead of NaN.
pub fn l2_normalize(vectors: &Tensor, eps: f64) -> Result<Tensor> {
    let norms = (vectors.sqr()?.sum_keepdim(D::Minus1)? + eps)?.sqrt()?;
    Ok(vectors.broadcast_div(&norms)?)
}

/// Batched inner products between queries and candidates.
///
/// # Arguments
/// * `queries` - Shape [B, P, D]
/// * `candidates` - Shape [B, L, D]
///
/// # Returns
/// Scores of shape [B, L, P], `scores[b, l, p] = <candidates[b, l], queries[b, p]>`
pub fn correlate(queries: &Tensor, candidates: &Tensor) -> Result<Tensor> {
    let (b, p, d) = queries.dims3()?;
    let (cb, l, cd) = candidates.dims3()?;
    if b != cb || d != cd {
        shape_bail!(
            "cannot correlate queries [{b}, {p}, {d}] with candidates [{cb}, {l}, {cd}]"
        );
    }
    let queries_t = queries.transpose(1, 2)?.contiguous()?;
    Ok(candidates.contiguous()?.matmul(&queries_t)?)
}

/// Paste weighted patches onto an output grid and average the overlaps.
///
/// Query cell `(i, j)` pastes `sum_l weights[b, l, i, j] * bank[b, l]` with its
/// top-left corner at `(i * stride - padding, j * stride - padding)`. Each
/// output pixel is then divided by the number of pastes covering it, so when
/// the weights of every query sum to one the result is a convex combination of
/// bank values.
///
/// # Arguments
/// * `weights` - Shape [B, L, Qh, Qw]
/// * `bank` - Shape [B, L, C, K, K]
/// * `stride` - Distance between neighbouring pastes
/// * `padding` - Cropped from every side of the output
///
/// # Returns
/// Tensor of shape [B, C, (Qh - 1) * stride + K - 2 * padding, ...]
pub fn fold_patches(
    weights: &Tensor,
    bank: &Tensor,
    stride: usize,
    padding: usize,
) -> Result<Tensor> {
    let (b, l, qh, qw) = weights.dims4()?;
    let (bb, bl, _c, kh, kw) = bank.dims5()?;
    if b != bb || l != bl {
        shape_bail!(
            "weights [{b}, {l}, {qh}, {qw}] do not match a bank of {bl} patches for batch {bb}"
        );
    }
    if qh == 0 || qw == 0 {
        shape_bail!("empty query grid {qh}x{qw}");
    }
    if kh != kw {
        shape_bail!("patches must be square, got {kh}x{kw}");
    }
    if stride == 0 || kh < stride {
        shape_bail!("patch side {kh} leaves gaps at stride {stride}");
    }
    if 2 * padding >= (qh - 1) * stride + kh || 2 * padding >= (qw - 1) * stride + kw {
        shape_bail!("padding {padding} crops the whole {qh}x{qw} output");
    }

    // Transposed convolution takes the kernel as [C_in, C_out, K, K]; the bank
    // differs per batch element so each element gets its own call.
    let mut pasted = Vec::with_capacity(b);
    for i in 0..b {
        let weights_i = weights.narrow(0, i, 1)?.contiguous()?;
        let bank_i = bank.get(i)?.contiguous()?;
        pasted.push(weights_i.conv_transpose2d(&bank_i, padding, 0, stride, 1)?);
    }
    let pasted = Tensor::cat(&pasted, 0)?;

    let ones = Tensor::ones((1, 1, qh, qw), weights.dtype(), weights.device())?;
    let footprint = Tensor::ones((1, 1, kh, kw), weights.dtype(), weights.device())?;
    let coverage = ones.conv_transpose2d(&footprint, padding, 0, stride, 1)?;

    Ok(pasted.broadcast_div(&coverage)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use candle_core::DType;

    fn ramp(h: usize, w: usize) -> Tensor {
        let data: Vec<f32> = (0..h * w).map(|v| v as f32).collect();
        Tensor::from_vec(data, (1, 1, h, w), &Device::Cpu).unwrap()
    }

    fn patch_values(patches: &Tensor, b: usize, l: usize) -> Vec<f32> {
        patches
            .get(b)
            .unwrap()
            .get(l)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_window_count() {
        assert_eq!(window_count(4, 3, 1, 1), Some(4));
        assert_eq!(window_count(4, 3, 2, 1), Some(2));
        assert_eq!(window_count(8, 6, 2, 2), Some(4));
        assert_eq!(window_count(2, 3, 1, 0), None);
        assert_eq!(window_count(4, 0, 1, 0), None);
    }

    #[test]
    fn test_extract_patches_same_padding() {
        let xs = ramp(4, 4);
        let patches = extract_patches(&xs, 3, 1, 1, PatchPadding::Zeros).unwrap();
        assert_eq!(patches.dims(), &[1, 16, 1, 3, 3]);

        // Window centred on (1, 1)
        assert_eq!(
            patch_values(&patches, 0, 5),
            vec![0.0, 1.0, 2.0, 4.0, 5.0, 6.0, 8.0, 9.0, 10.0]
        );
        // Window centred on (0, 0) reaches into the zero border
        assert_eq!(
            patch_values(&patches, 0, 0),
            vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 4.0, 5.0]
        );
    }

    #[test]
    fn test_extract_patches_replicate_padding() {
        let xs = ramp(4, 4);
        let patches = extract_patches(&xs, 3, 1, 1, PatchPadding::Replicate).unwrap();
        assert_eq!(
            patch_values(&patches, 0, 15),
            vec![10.0, 11.0, 11.0, 14.0, 15.0, 15.0, 14.0, 15.0, 15.0]
        );
    }

    #[test]
    fn test_extract_patches_with_stride() {
        let xs = ramp(4, 4);
        let patches = extract_patches(&xs, 2, 2, 0, PatchPadding::Zeros).unwrap();
        assert_eq!(patches.dims(), &[1, 4, 1, 2, 2]);
        assert_eq!(patch_values(&patches, 0, 0), vec![0.0, 1.0, 4.0, 5.0]);
        assert_eq!(patch_values(&patches, 0, 1), vec![2.0, 3.0, 6.0, 7.0]);
        assert_eq!(patch_values(&patches, 0, 3), vec![10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn test_extract_patches_strided_with_padding() {
        let xs = ramp(4, 4);
        let patches = extract_patches(&xs, 3, 2, 1, PatchPadding::Replicate).unwrap();
        assert_eq!(patches.dims(), &[1, 4, 1, 3, 3]);
        assert_eq!(
            patch_values(&patches, 0, 0),
            vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 4.0, 4.0, 5.0]
        );
        assert_eq!(
            patch_values(&patches, 0, 3),
            vec![5.0, 6.0, 7.0, 9.0, 10.0, 11.0, 13.0, 14.0, 15.0]
        );
    }

    #[test]
    fn test_extract_patches_keeps_channels_together() {
        let data: Vec<f32> = (0..2 * 2 * 2).map(|v| v as f32).collect();
        let xs = Tensor::from_vec(data, (1, 2, 2, 2), &Device::Cpu).unwrap();
        let patches = extract_patches(&xs, 1, 1, 0, PatchPadding::Zeros).unwrap();
        assert_eq!(patches.dims(), &[1, 4, 2, 1, 1]);
        // Pixel (0, 1) holds 1.0 in channel 0 and 5.0 in channel 1
        assert_eq!(patch_values(&patches, 0, 1), vec![1.0, 5.0]);
    }

    #[test]
    fn test_extract_patches_rejects_oversized_window() {
        let xs = ramp(2, 2);
        let result = extract_patches(&xs, 3, 1, 0, PatchPadding::Zeros);
        assert!(matches!(result, Err(Error::Shape(_))));
    }

    #[test]
    fn test_l2_normalize() {
        let xs = Tensor::new(&[[[3.0f32, 4.0], [0.0, 0.0]]], &Device::Cpu).unwrap();
        let normed = l2_normalize(&xs, 1e-4).unwrap();
        let values: Vec<f32> = normed.flatten_all().unwrap().to_vec1().unwrap();
        assert!((values[0] - 0.6).abs() < 1e-4);
        assert!((values[1] - 0.8).abs() < 1e-4);
        // Zero vectors stay finite
        assert_eq!(values[2], 0.0);
        assert_eq!(values[3], 0.0);
    }

    #[test]
    fn test_correlate() {
        let device = Device::Cpu;
        let queries = Tensor::new(&[[[1.0f32, 0.0], [0.0, 2.0], [1.0, 1.0]]], &device).unwrap();
        let candidates = Tensor::new(&[[[1.0f32, 1.0], [2.0, -1.0]]], &device).unwrap();
        let scores = correlate(&queries, &candidates).unwrap();
        assert_eq!(scores.dims(), &[1, 2, 3]);
        let scores: Vec<Vec<f32>> = scores.get(0).unwrap().to_vec2().unwrap();
        assert_eq!(scores[0], vec![1.0, 2.0, 2.0]);
        assert_eq!(scores[1], vec![2.0, -2.0, 1.0]);
    }

    #[test]
    fn test_correlate_rejects_mismatched_vectors() {
        let device = Device::Cpu;
        let queries = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let candidates = Tensor::zeros((1, 2, 5), DType::F32, &device).unwrap();
        assert!(matches!(
            correlate(&queries, &candidates),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_fold_one_hot_weights_copy_patches() {
        let device = Device::Cpu;
        // Two 2x2 patches, constant 1 and constant 5
        let bank = Tensor::new(&[1.0f32, 5.0], &device)
            .unwrap()
            .reshape((1, 2, 1, 1, 1))
            .unwrap()
            .broadcast_as((1, 2, 1, 2, 2))
            .unwrap()
            .contiguous()
            .unwrap();
        // Query grid 1x2: left cell takes patch 1, right cell takes patch 0
        let weights = Tensor::new(&[[[0.0f32, 1.0]], [[1.0, 0.0]]], &device)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let folded = fold_patches(&weights, &bank, 2, 0).unwrap();
        assert_eq!(folded.dims(), &[1, 1, 2, 4]);
        let rows: Vec<Vec<f32>> = folded.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0], vec![5.0, 5.0, 1.0, 1.0]);
        assert_eq!(rows[1], vec![5.0, 5.0, 1.0, 1.0]);
    }

    #[test]
    fn test_fold_averages_overlaps() {
        let device = Device::Cpu;
        // A single 3x3 patch of ones pasted by every cell of a 4x4 grid with
        // "same" padding: every output pixel must come back as exactly one.
        let bank = Tensor::ones((1, 1, 1, 3, 3), DType::F32, &device).unwrap();
        let weights = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let folded = fold_patches(&weights, &bank, 1, 1).unwrap();
        assert_eq!(folded.dims(), &[1, 1, 4, 4]);
        let values: Vec<f32> = folded.flatten_all().unwrap().to_vec1().unwrap();
        for v in values {
            assert!((v - 1.0).abs() < 1e-6, "expected 1.0, got {v}");
        }
    }

    #[test]
    fn test_fold_rejects_gaps() {
        let device = Device::Cpu;
        let bank = Tensor::ones((1, 1, 1, 1, 1), DType::F32, &device).unwrap();
        let weights = Tensor::ones((1, 1, 2, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            fold_patches(&weights, &bank, 2, 0),
            Err(Error::Shape(_))
        ));
    }
}

//! Contextual attention
//!
//! Fills the hole in a feature map by borrowing patches from the rest of the
//! same (or another) map:
//!
//! 1. Foreground and background are average-pooled by `rate`.
//! 2. Every `k x k` background window becomes a candidate and is scaled to unit
//!    length, so scoring a foreground window against it is cosine similarity up
//!    to the foreground norm.
//! 3. Candidates touching the hole get a large negative bias, then a softmax
//!    over candidates (temperature `softmax_scale`) yields attention weights.
//! 4. The matching full-resolution background windows are pasted back with
//!    those weights and the overlaps averaged.
//!
//! Alongside the reconstruction a flow field records, for every location, the
//! offset to its most attended candidate.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::config::ContextualAttentionConfig;
use crate::error::{shape_bail, Result};
use crate::ops::resize_mask;
use crate::patches::{
    correlate, extract_patches, fold_patches, l2_normalize, window_count, PatchPadding,
};

/// Added under the square root when normalising candidate patches
pub const NORM_EPSILON: f64 = 1e-4;

/// Logit offset for candidates inside the hole
pub const MASKED_LOGIT_BIAS: f64 = -1e9;

/// Candidate norms below this are reported as degenerate
const DEGENERATE_NORM: f32 = 1e-3;

/// Everything computed by one attention pass
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Same shape as the foreground, [B, C, H, W]
    pub reconstructed: Tensor,
    /// Offset to the best candidate in full-resolution pixels, [B, 2, H, W]
    /// (channel 0 rows, channel 1 columns)
    pub flow: Tensor,
    /// Softmax weights over candidates, [B, L, H / rate, W / rate]
    pub weights: Tensor,
}

/// Patch-matching attention between a foreground and a background map
#[derive(Debug, Clone)]
pub struct ContextualAttention {
    config: ContextualAttentionConfig,
}

impl ContextualAttention {
    pub fn new(config: ContextualAttentionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ContextualAttentionConfig {
        &self.config
    }

    /// Reconstruct `foreground` from `background` patches.
    ///
    /// # Arguments
    /// * `foreground` - Feature map [B, C, H, W] containing the hole
    /// * `background` - Feature map [B, C, H, W] providing the patches
    /// * `mask` - Optional [B or 1, 1, Hm, Wm] hole mask, 1 inside the hole;
    ///   `None` means nothing is masked
    ///
    /// # Returns
    /// `(reconstructed, flow)` with shapes [B, C, H, W] and [B, 2, H, W]
    pub fn attend(
        &self,
        foreground: &Tensor,
        background: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let out = self.attend_detailed(foreground, background, mask)?;
        Ok((out.reconstructed, out.flow))
    }

    /// Same as [`ContextualAttention::attend`] but also returns the weights.
    pub fn attend_detailed(
        &self,
        foreground: &Tensor,
        background: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<AttentionOutput> {
        let (b, c, h, w) = self.check_inputs(foreground, background, mask)?;
        let ContextualAttentionConfig {
            kernel_size: ksize,
            stride,
            rate,
            softmax_scale,
            fuse,
            fuse_kernel_size,
            ..
        } = self.config;
        let half = ksize / 2;
        let (hs, ws) = (h / rate, w / rate);
        // check_inputs guarantees at least one window
        let lh = window_count(hs, ksize, stride, half).unwrap_or(1);
        let lw = window_count(ws, ksize, stride, half).unwrap_or(1);
        let l = lh * lw;
        debug!(
            batch = b,
            channels = c,
            height = h,
            width = w,
            candidates = l,
            "contextual attention"
        );

        let foreground_small = downsample(foreground, rate)?;
        let background_small = downsample(background, rate)?;

        // Candidate bank at working resolution, one unit vector per window
        let bank = extract_patches(&background_small, ksize, stride, half, PatchPadding::Zeros)?
            .reshape((b, l, c * ksize * ksize))?;
        report_degenerate_patches(&bank)?;
        let bank = l2_normalize(&bank, NORM_EPSILON)?;

        // Every foreground location as a query window: [B, Hs * Ws, C * k * k]
        let queries = extract_patches(&foreground_small, ksize, 1, half, PatchPadding::Zeros)?
            .reshape((b, hs * ws, c * ksize * ksize))?;
        let scores = correlate(&queries, &bank)?;

        let scores = if fuse {
            fuse_scores(&scores, (lh, lw), (hs, ws), fuse_kernel_size)?
        } else {
            scores
        };

        // [B, L, 1], 1 for candidates whose window touches the hole
        let holes = self.hole_map(mask, b, (hs, ws), foreground.dtype(), foreground.device())?;
        let invalid = extract_patches(&holes, ksize, stride, half, PatchPadding::Zeros)?
            .reshape((b, l, ksize * ksize))?
            .max_keepdim(2)?;
        // Logits stay in f32, the bias overflows half precision
        let logits = scores
            .to_dtype(DType::F32)?
            .affine(softmax_scale, 0.0)?
            .broadcast_add(&invalid.to_dtype(DType::F32)?.affine(MASKED_LOGIT_BIAS, 0.0)?)?;
        let weights = candle_nn::ops::softmax(&logits, 1)?
            .to_dtype(foreground.dtype())?
            .reshape((b, l, hs, ws))?;

        // Full-resolution bank covering the same footprint as each candidate
        let raw_bank = extract_patches(
            background,
            ksize * rate,
            stride * rate,
            half * rate,
            PatchPadding::Replicate,
        )?;
        let reconstructed = fold_patches(&weights, &raw_bank, rate, half * rate)?;

        let flow = self.flow_field(&weights, lw, (h, w))?;

        Ok(AttentionOutput {
            reconstructed,
            flow,
            weights,
        })
    }

    fn check_inputs(
        &self,
        foreground: &Tensor,
        background: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(usize, usize, usize, usize)> {
        let (b, c, h, w) = foreground.dims4()?;
        let background_dims = background.dims4()?;
        if background_dims != (b, c, h, w) {
            shape_bail!(
                "foreground {:?} and background {:?} differ",
                foreground.dims(),
                background.dims()
            );
        }
        let rate = self.config.rate;
        if h == 0 || w == 0 || h % rate != 0 || w % rate != 0 {
            shape_bail!("spatial size {h}x{w} is not divisible by rate {rate}");
        }
        let (hs, ws) = (h / rate, w / rate);
        if let Some(mask) = mask {
            let (mb, mc, mh, mw) = mask.dims4()?;
            if mc != 1 {
                shape_bail!("mask must have one channel, got {mc}");
            }
            if mb != b && mb != 1 {
                shape_bail!("mask batch {mb} does not match feature batch {b}");
            }
            let downscale = mh >= hs && mw >= ws && mh % hs == 0 && mw % ws == 0;
            let upscale = mh > 0 && mw > 0 && mh <= hs && mw <= ws && hs % mh == 0 && ws % mw == 0;
            if !downscale && !upscale {
                shape_bail!("mask size {mh}x{mw} does not divide working size {hs}x{ws}");
            }
        }
        Ok((b, c, h, w))
    }

    /// Binary hole map at working resolution, [B, 1, Hs, Ws].
    fn hole_map(
        &self,
        mask: Option<&Tensor>,
        batch: usize,
        (hs, ws): (usize, usize),
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let Some(mask) = mask else {
            return Ok(Tensor::zeros((batch, 1, hs, ws), dtype, device)?);
        };
        let resized = resize_mask(&mask.to_dtype(dtype)?, hs, ws)?;
        let resized = if resized.dim(0)? != batch {
            resized.broadcast_as((batch, 1, hs, ws))?.contiguous()?
        } else {
            resized
        };
        Ok(resized.ge(self.config.mask_threshold)?.to_dtype(dtype)?)
    }

    /// Offset from every location to its most attended candidate.
    fn flow_field(&self, weights: &Tensor, lw: usize, (h, w): (usize, usize)) -> Result<Tensor> {
        let (b, _, hs, ws) = weights.dims4()?;
        let stride = self.config.stride;
        let rate = self.config.rate as f32;
        let best: Vec<Vec<Vec<u32>>> = weights.argmax(1)?.to_vec3()?;

        let plane = hs * ws;
        let mut offsets = vec![0f32; b * 2 * plane];
        for (bi, rows) in best.iter().enumerate() {
            for (y, row) in rows.iter().enumerate() {
                for (x, &index) in row.iter().enumerate() {
                    let index = index as usize;
                    let source_y = (index / lw) * stride;
                    let source_x = (index % lw) * stride;
                    let base = bi * 2 * plane + y * ws + x;
                    offsets[base] = (source_y as f32 - y as f32) * rate;
                    offsets[base + plane] = (source_x as f32 - x as f32) * rate;
                }
            }
        }
        let flow = Tensor::from_vec(offsets, (b, 2, hs, ws), weights.device())?
            .to_dtype(weights.dtype())?;
        Ok(flow.upsample_nearest2d(h, w)?)
    }
}

fn downsample(xs: &Tensor, rate: usize) -> Result<Tensor> {
    if rate == 1 {
        Ok(xs.clone())
    } else {
        Ok(xs.avg_pool2d(rate)?)
    }
}

/// Identity-kernel smoothing of the [B, L, P] score matrix.
///
/// Summing along the diagonal of the score matrix adds the score of the
/// neighbouring query against the neighbouring candidate, which favours
/// candidates whose neighbours also match. The first pass works on row-major
/// order (horizontal neighbours), the second on column-major order of both
/// grids (vertical neighbours).
fn fuse_scores(
    scores: &Tensor,
    (lh, lw): (usize, usize),
    (hs, ws): (usize, usize),
    fuse_kernel_size: usize,
) -> Result<Tensor> {
    let (b, l, p) = scores.dims3()?;
    let eye: Vec<f32> = (0..fuse_kernel_size * fuse_kernel_size)
        .map(|i| {
            if i / fuse_kernel_size == i % fuse_kernel_size {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    let kernel = Tensor::from_vec(
        eye,
        (1, 1, fuse_kernel_size, fuse_kernel_size),
        scores.device(),
    )?
    .to_dtype(scores.dtype())?;
    let pad = fuse_kernel_size / 2;

    let xs = scores
        .reshape((b, 1, l, p))?
        .conv2d(&kernel, pad, 1, 1, 1)?;

    let xs = xs
        .reshape((b, lh, lw, hs, ws))?
        .permute((0, 2, 1, 4, 3))?
        .contiguous()?
        .reshape((b, 1, l, p))?
        .conv2d(&kernel, pad, 1, 1, 1)?;

    Ok(xs
        .reshape((b, lw, lh, ws, hs))?
        .permute((0, 2, 1, 4, 3))?
        .contiguous()?
        .reshape((b, l, p))?)
}

/// Log near-zero candidate norms; normalisation absorbs them through
/// [`NORM_EPSILON`].
fn report_degenerate_patches(bank: &Tensor) -> Result<()> {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return Ok(());
    }
    let norms = bank
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_keepdim(2)?
        .sqrt()?;
    let degenerate = norms
        .lt(DEGENERATE_NORM)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    if degenerate > 0.0 {
        debug!(
            count = degenerate as usize,
            "background patches with near-zero norm"
        );
    }
    Ok(())
}

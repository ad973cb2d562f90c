//! Model and operator configuration
//!
//! Configuration is plain data handed to constructors. Nothing here reads the
//! environment or selects a device.

use crate::error::{config_bail, Result};

/// Configuration for the contextual attention operator
#[derive(Debug, Clone, PartialEq)]
pub struct ContextualAttentionConfig {
    /// Side length of the matching patches at working resolution (odd)
    pub kernel_size: usize,
    /// Step between candidate patches at working resolution
    pub stride: usize,
    /// Downsampling factor applied before matching
    pub rate: usize,
    /// Multiplier applied to cosine scores before the softmax
    pub softmax_scale: f64,
    /// Smooth scores along patch diagonals before the softmax
    pub fuse: bool,
    /// Side length of the identity kernel used by the fuse pass (odd)
    pub fuse_kernel_size: usize,
    /// Working-resolution mask values at or above this mark a hole
    pub mask_threshold: f64,
}

impl Default for ContextualAttentionConfig {
    fn default() -> Self {
        Self {
            kernel_size: 3,
            stride: 1,
            rate: 2,
            softmax_scale: 10.0,
            fuse: true,
            fuse_kernel_size: 3,
            mask_threshold: 0.5,
        }
    }
}

impl ContextualAttentionConfig {
    /// Per-pixel matching: 1x1 patches, no pooling, no fusing.
    pub fn pixelwise() -> Self {
        Self {
            kernel_size: 1,
            rate: 1,
            fuse: false,
            ..Self::default()
        }
    }

    pub fn with_kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_rate(mut self, rate: usize) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_softmax_scale(mut self, softmax_scale: f64) -> Self {
        self.softmax_scale = softmax_scale;
        self
    }

    pub fn with_fuse(mut self, fuse: bool) -> Self {
        self.fuse = fuse;
        self
    }

    pub fn with_mask_threshold(mut self, mask_threshold: f64) -> Self {
        self.mask_threshold = mask_threshold;
        self
    }

    /// Reject settings the operator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            config_bail!(
                "kernel_size must be odd and positive, got {}",
                self.kernel_size
            );
        }
        if self.stride == 0 {
            config_bail!("stride must be positive");
        }
        if self.rate == 0 {
            config_bail!("rate must be positive");
        }
        if self.fuse_kernel_size == 0 || self.fuse_kernel_size % 2 == 0 {
            config_bail!(
                "fuse_kernel_size must be odd and positive, got {}",
                self.fuse_kernel_size
            );
        }
        if !self.softmax_scale.is_finite() || self.softmax_scale <= 0.0 {
            config_bail!(
                "softmax_scale must be finite and positive, got {}",
                self.softmax_scale
            );
        }
        if !(self.mask_threshold > 0.0 && self.mask_threshold <= 1.0) {
            config_bail!(
                "mask_threshold must lie in (0, 1], got {}",
                self.mask_threshold
            );
        }
        Ok(())
    }
}

/// Configuration for the inpainting generator and discriminator
#[derive(Debug, Clone)]
pub struct InpaintConfig {
    /// Square input resolution the weights were trained at
    pub image_size: usize,
    /// Base channel count of the generator
    pub gen_channels: usize,
    /// Base channel count of the discriminator
    pub dis_channels: usize,
    /// Input channels seen by the discriminator
    pub dis_in_channels: usize,
    /// Attention operator used in the refinement stage
    pub attention: ContextualAttentionConfig,
}

impl Default for InpaintConfig {
    fn default() -> Self {
        Self::toy()
    }
}

impl InpaintConfig {
    /// Small 64x64 model
    pub fn toy() -> Self {
        Self {
            image_size: 64,
            gen_channels: 32,
            dis_channels: 64,
            dis_in_channels: 3,
            attention: ContextualAttentionConfig::default(),
        }
    }

    /// Full-size 256x256 model
    pub fn places() -> Self {
        Self {
            image_size: 256,
            gen_channels: 48,
            dis_channels: 64,
            dis_in_channels: 3,
            attention: ContextualAttentionConfig::default(),
        }
    }

    /// Image sides must survive two stride-2 stages and the attention rate.
    pub fn size_multiple(&self) -> usize {
        4 * self.attention.rate
    }

    pub fn validate(&self) -> Result<()> {
        self.attention.validate()?;
        if self.gen_channels < 2 || self.gen_channels % 2 != 0 {
            config_bail!(
                "gen_channels must be even and at least 2, got {}",
                self.gen_channels
            );
        }
        if self.dis_channels == 0 || self.dis_in_channels == 0 {
            config_bail!("discriminator channel counts must be positive");
        }
        if self.image_size == 0 || self.image_size % self.size_multiple() != 0 {
            config_bail!(
                "image_size {} must be a positive multiple of {}",
                self.image_size,
                self.size_multiple()
            );
        }
        Ok(())
    }
}

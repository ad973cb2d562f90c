//! Two-stage inpainting generator
//!
//! Stage 1 is a coarse encoder/decoder of gated convolutions with a dilated
//! bottleneck. Its prediction is pasted into the hole and handed to stage 2,
//! which runs two encoders side by side:
//! - a dilated convolution branch (`xconv*`)
//! - an attention branch (`pmconv*`) that fills the hole with contextual
//!   attention over its own features
//!
//! The two feature maps are concatenated and decoded (`allconv*`).
//! Both stages end in `tanh`, images live in [-1, 1].

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use crate::config::InpaintConfig;
use crate::contextual_attention::ContextualAttention;
use crate::debug::log_tensor_stats;
use crate::model::layers::{Activation, GatedConv2d, GatedConvConfig, GatedDeconv2d};
use crate::ops::{composite, resize_mask_like};

/// Spatial reduction between the image and the bottleneck features
pub const FEATURE_STRIDE: usize = 4;

/// Everything produced by [`Generator::inpaint`]
#[derive(Debug, Clone)]
pub struct InpaintOutput {
    /// Stage 1 prediction, [B, 3, H, W] in [-1, 1]
    pub coarse: Tensor,
    /// Stage 2 prediction, [B, 3, H, W] in [-1, 1]
    pub refined: Tensor,
    /// Refined prediction inside the hole, input elsewhere
    pub completed: Tensor,
    /// Attention offsets in image pixels, [B, 2, H, W]
    pub flow: Tensor,
}

fn gated(vb: &VarBuilder, name: &str, cin: usize, cout: usize, config: GatedConvConfig) -> Result<GatedConv2d> {
    GatedConv2d::load(vb.pp(name), cin, cout, config)
}

/// Encoder shared in shape by all three downsampling paths:
/// 5x5 conv, stride-2 conv, conv, stride-2 conv.
struct Encoder {
    layers: [GatedConv2d; 4],
}

impl Encoder {
    fn load(vb: &VarBuilder, prefix: &str, channels: [usize; 4]) -> Result<Self> {
        let [c1, c2, c3, c4] = channels;
        Ok(Self {
            layers: [
                gated(vb, &format!("{prefix}1"), 5, c1, GatedConvConfig::kernel(5))?,
                gated(vb, &format!("{prefix}2_downsample"), c1, c2, GatedConvConfig::downsample())?,
                gated(vb, &format!("{prefix}3"), c2, c3, GatedConvConfig::default())?,
                gated(vb, &format!("{prefix}4_downsample"), c3, c4, GatedConvConfig::downsample())?,
            ],
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.layers.iter().try_fold(x.clone(), |x, layer| layer.forward(&x))
    }
}

/// Four dilated 3x3 convolutions with dilation 2, 4, 8, 16
struct AtrousBlock {
    layers: [GatedConv2d; 4],
}

impl AtrousBlock {
    fn load(vb: &VarBuilder, prefix: &str, first: usize, channels: usize) -> Result<Self> {
        let layer = |i: usize| {
            gated(
                vb,
                &format!("{prefix}{}_atrous", first + i),
                channels,
                channels,
                GatedConvConfig::atrous(2 << i),
            )
        };
        Ok(Self {
            layers: [layer(0)?, layer(1)?, layer(2)?, layer(3)?],
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.layers.iter().try_fold(x.clone(), |x, layer| layer.forward(&x))
    }
}

/// Decoder from 4c channels at 1/4 resolution to 3 channels at full resolution
struct Decoder {
    conv_a: GatedConv2d,
    conv_b: GatedConv2d,
    up1: GatedDeconv2d,
    conv_c: GatedConv2d,
    up2: GatedDeconv2d,
    conv_d: GatedConv2d,
    to_rgb: GatedConv2d,
}

impl Decoder {
    fn load(vb: &VarBuilder, prefix: &str, in_channels: usize, ch: usize) -> Result<Self> {
        let name = |i: usize| format!("{prefix}{i}");
        Ok(Self {
            conv_a: gated(vb, &name(11), in_channels, 4 * ch, GatedConvConfig::default())?,
            conv_b: gated(vb, &name(12), 4 * ch, 4 * ch, GatedConvConfig::default())?,
            up1: GatedDeconv2d::load(vb.pp(format!("{prefix}13_upsample")), 4 * ch, 2 * ch)?,
            conv_c: gated(vb, &name(14), 2 * ch, 2 * ch, GatedConvConfig::default())?,
            up2: GatedDeconv2d::load(vb.pp(format!("{prefix}15_upsample")), 2 * ch, ch)?,
            conv_d: gated(vb, &name(16), ch, ch / 2, GatedConvConfig::default())?,
            to_rgb: gated(
                vb,
                &name(17),
                ch / 2,
                3,
                GatedConvConfig::default().with_activation(Activation::Identity),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv_a.forward(x)?;
        let x = self.conv_b.forward(&x)?;
        let x = self.up1.forward(&x)?;
        let x = self.conv_c.forward(&x)?;
        let x = self.up2.forward(&x)?;
        let x = self.conv_d.forward(&x)?;
        self.to_rgb.forward(&x)?.tanh()
    }
}

/// Two-stage gated-convolution generator with contextual attention
pub struct Generator {
    pub config: InpaintConfig,
    // stage 1
    coarse_encoder: Encoder,
    conv5: GatedConv2d,
    conv6: GatedConv2d,
    coarse_atrous: AtrousBlock,
    coarse_decoder: Decoder,
    // stage 2, convolution branch
    x_encoder: Encoder,
    xconv5: GatedConv2d,
    xconv6: GatedConv2d,
    x_atrous: AtrousBlock,
    // stage 2, attention branch
    pm_encoder: Encoder,
    pmconv5: GatedConv2d,
    pmconv6: GatedConv2d,
    attention: ContextualAttention,
    pmconv9: GatedConv2d,
    pmconv10: GatedConv2d,
    // stage 2, merge
    refine_decoder: Decoder,
}

impl Generator {
    /// Load the generator.
    ///
    /// # Arguments
    /// * `vb` - Variables keyed `conv1`, `conv2_downsample`, ..., `allconv17`
    /// * `config` - Channel widths and attention settings
    pub fn load(vb: VarBuilder, config: &InpaintConfig) -> Result<Self> {
        config.validate().map_err(candle_core::Error::wrap)?;
        let ch = config.gen_channels;
        let attention =
            ContextualAttention::new(config.attention.clone()).map_err(candle_core::Error::wrap)?;

        Ok(Self {
            config: config.clone(),
            coarse_encoder: Encoder::load(&vb, "conv", [ch, 2 * ch, 2 * ch, 4 * ch])?,
            conv5: gated(&vb, "conv5", 4 * ch, 4 * ch, GatedConvConfig::default())?,
            conv6: gated(&vb, "conv6", 4 * ch, 4 * ch, GatedConvConfig::default())?,
            coarse_atrous: AtrousBlock::load(&vb, "conv", 7, 4 * ch)?,
            coarse_decoder: Decoder::load(&vb, "conv", 4 * ch, ch)?,

            x_encoder: Encoder::load(&vb, "xconv", [ch, ch, 2 * ch, 2 * ch])?,
            xconv5: gated(&vb, "xconv5", 2 * ch, 4 * ch, GatedConvConfig::default())?,
            xconv6: gated(&vb, "xconv6", 4 * ch, 4 * ch, GatedConvConfig::default())?,
            x_atrous: AtrousBlock::load(&vb, "xconv", 7, 4 * ch)?,

            pm_encoder: Encoder::load(&vb, "pmconv", [ch, ch, 2 * ch, 4 * ch])?,
            pmconv5: gated(&vb, "pmconv5", 4 * ch, 4 * ch, GatedConvConfig::default())?,
            pmconv6: gated(
                &vb,
                "pmconv6",
                4 * ch,
                4 * ch,
                GatedConvConfig::default().with_activation(Activation::Relu),
            )?,
            attention,
            pmconv9: gated(&vb, "pmconv9", 4 * ch, 4 * ch, GatedConvConfig::default())?,
            pmconv10: gated(&vb, "pmconv10", 4 * ch, 4 * ch, GatedConvConfig::default())?,

            refine_decoder: Decoder::load(&vb, "allconv", 8 * ch, ch)?,
        })
    }

    fn check_input(&self, x: &Tensor, mask: &Tensor) -> Result<()> {
        let (_, c, h, w) = x.dims4()?;
        let multiple = self.config.size_multiple();
        if c != 3 {
            candle_core::bail!("generator expects 3 input channels, got {c}");
        }
        if h % multiple != 0 || w % multiple != 0 {
            candle_core::bail!("image size {h}x{w} must be a multiple of {multiple}");
        }
        let (_, mc, mh, mw) = mask.dims4()?;
        if mc != 1 || (mh, mw) != (h, w) {
            candle_core::bail!(
                "mask {:?} does not match image {:?}",
                mask.dims(),
                x.dims()
            );
        }
        Ok(())
    }

    /// Run both stages.
    ///
    /// # Arguments
    /// * `x` - Image with the hole erased, [B, 3, H, W] in [-1, 1]
    /// * `mask` - Hole mask, [B, 1, H, W], 1 inside the hole
    ///
    /// # Returns
    /// `(stage1, stage2, flow)` where the flow is at bottleneck resolution
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        self.check_input(x, mask)?;
        let ones = x.narrow(1, 0, 1)?.ones_like()?;
        let hole = ones.broadcast_mul(mask)?;
        let input = Tensor::cat(&[x, &ones, &hole], 1)?;

        // stage 1
        let h = self.coarse_encoder.forward(&input)?;
        let h = self.conv5.forward(&h)?;
        let h = self.conv6.forward(&h)?;
        let mask_small = resize_mask_like(mask, &h)?;
        let h = self.coarse_atrous.forward(&h)?;
        let stage1 = self.coarse_decoder.forward(&h)?;
        log_tensor_stats(&stage1, "stage1")?;

        let coarse_filled = composite(&stage1, x, mask)?;
        let input = Tensor::cat(&[&coarse_filled, &ones, &hole], 1)?;

        // stage 2, convolution branch
        let h = self.x_encoder.forward(&input)?;
        let h = self.xconv5.forward(&h)?;
        let h = self.xconv6.forward(&h)?;
        let x_conv = self.x_atrous.forward(&h)?;

        // stage 2, attention branch
        let h = self.pm_encoder.forward(&input)?;
        let h = self.pmconv5.forward(&h)?;
        let h = self.pmconv6.forward(&h)?;
        let (h, flow) = self
            .attention
            .attend(&h, &h, Some(&mask_small))
            .map_err(candle_core::Error::wrap)?;
        let h = self.pmconv9.forward(&h)?;
        let x_att = self.pmconv10.forward(&h)?;
        debug!(features = ?x_att.dims(), "attention branch");

        let merged = Tensor::cat(&[&x_conv, &x_att], 1)?;
        let stage2 = self.refine_decoder.forward(&merged)?;
        log_tensor_stats(&stage2, "stage2")?;

        Ok((stage1, stage2, flow))
    }

    /// Fill the hole of `image`.
    ///
    /// # Arguments
    /// * `image` - Complete or partially known image, [B, 3, H, W] in [-1, 1]
    /// * `mask` - Hole mask, [B, 1, H, W], 1 inside the hole
    pub fn inpaint(&self, image: &Tensor, mask: &Tensor) -> Result<InpaintOutput> {
        let keep = mask.affine(-1.0, 1.0)?;
        let incomplete = image.broadcast_mul(&keep)?;
        let (coarse, refined, flow) = self.forward(&incomplete, mask)?;
        let completed = composite(&refined, &incomplete, mask)?;

        let (_, _, h, w) = image.dims4()?;
        let flow = flow
            .affine(FEATURE_STRIDE as f64, 0.0)?
            .upsample_nearest2d(h, w)?;
        Ok(InpaintOutput {
            coarse,
            refined,
            completed,
            flow,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> InpaintConfig {
        InpaintConfig {
            image_size: 32,
            gen_channels: 4,
            ..InpaintConfig::toy()
        }
    }

    fn square_mask(device: &Device) -> Tensor {
        let mut data = vec![0f32; 32 * 32];
        for y in 8..20 {
            for x in 10..24 {
                data[y * 32 + x] = 1.0;
            }
        }
        Tensor::from_vec(data, (1, 1, 32, 32), device).unwrap()
    }

    #[test]
    fn test_generator_shapes() {
        let device = Device::Cpu;
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &device);
        let generator = Generator::load(vb, &tiny_config()).unwrap();

        let image = Tensor::rand(-1f32, 1.0, (1, 3, 32, 32), &device).unwrap();
        let mask = square_mask(&device);
        let (stage1, stage2, flow) = generator.forward(&image, &mask).unwrap();
        assert_eq!(stage1.dims(), &[1, 3, 32, 32]);
        assert_eq!(stage2.dims(), &[1, 3, 32, 32]);
        assert_eq!(flow.dims(), &[1, 2, 8, 8]);

        for t in [&stage1, &stage2] {
            let values: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
            assert!(values.iter().all(|v| v.is_finite() && v.abs() <= 1.0));
        }
    }

    #[test]
    fn test_inpaint_keeps_known_pixels() {
        let device = Device::Cpu;
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &device);
        let generator = Generator::load(vb, &tiny_config()).unwrap();

        let image = Tensor::rand(-1f32, 1.0, (1, 3, 32, 32), &device).unwrap();
        let mask = square_mask(&device);
        let out = generator.inpaint(&image, &mask).unwrap();
        assert_eq!(out.flow.dims(), &[1, 2, 32, 32]);

        let image: Vec<f32> = image.flatten_all().unwrap().to_vec1().unwrap();
        let completed: Vec<f32> = out.completed.flatten_all().unwrap().to_vec1().unwrap();
        let refined: Vec<f32> = out.refined.flatten_all().unwrap().to_vec1().unwrap();
        // (0, 0) is outside the hole, (10, 12) inside, for every channel
        for c in 0..3 {
            let outside = c * 1024;
            let inside = c * 1024 + 10 * 32 + 12;
            assert_eq!(completed[outside], image[outside]);
            assert_eq!(completed[inside], refined[inside]);
        }
    }

    #[test]
    fn test_generator_weight_names() {
        let device = Device::Cpu;
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &device);
        let _ = Generator::load(vb, &tiny_config()).unwrap();

        let data = vs.data().lock().unwrap();
        for key in [
            "conv1.conv.weight",
            "conv4_downsample.conv.weight",
            "conv10_atrous.conv.weight",
            "conv13_upsample.conv.conv.weight",
            "conv17.conv.weight",
            "xconv2_downsample.conv.weight",
            "xconv10_atrous.conv.weight",
            "pmconv6.conv.weight",
            "pmconv10.conv.weight",
            "allconv11.conv.weight",
            "allconv15_upsample.conv.conv.weight",
            "allconv17.conv.weight",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
        // allconv11 merges both branches: 8c in, 2 * 4c out
        assert_eq!(data["allconv11.conv.weight"].dims(), &[32, 32, 3, 3]);
        assert_eq!(data["conv17.conv.weight"].dims(), &[6, 2, 3, 3]);
    }

    #[test]
    fn test_generator_rejects_bad_size() {
        let device = Device::Cpu;
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &device);
        let generator = Generator::load(vb, &tiny_config()).unwrap();

        let image = Tensor::zeros((1, 3, 36, 36), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 1, 36, 36), DType::F32, &device).unwrap();
        assert!(generator.forward(&image, &mask).is_err());
    }

    #[test]
    fn test_generator_rejects_bad_config() {
        let device = Device::Cpu;
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &device);
        let config = InpaintConfig {
            gen_channels: 3,
            ..tiny_config()
        };
        assert!(Generator::load(vb, &config).is_err());
    }
}

//! SN-PatchGAN discriminator
//!
//! Six spectral-normalised 5x5 stride-2 convolutions; every output position
//! scores one patch of the input. The map is flattened per image.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::InpaintConfig;
use crate::model::layers::SpectralNormConv2d;

pub struct Discriminator {
    layers: Vec<SpectralNormConv2d>,
}

impl Discriminator {
    pub const NUM_LAYERS: usize = 6;

    /// Load layers `conv1` .. `conv6`.
    pub fn load(vb: VarBuilder, config: &InpaintConfig) -> Result<Self> {
        let cnum = config.dis_channels;
        let widths = [
            config.dis_in_channels,
            cnum,
            2 * cnum,
            4 * cnum,
            4 * cnum,
            4 * cnum,
            4 * cnum,
        ];
        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, pair)| SpectralNormConv2d::load(vb.pp(format!("conv{}", i + 1)), pair[0], pair[1]))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Output features per image: `4 * cnum * (H / 64) * (W / 64)`.
    pub fn output_len(config: &InpaintConfig, height: usize, width: usize) -> usize {
        let shrink = |v: usize| (0..Self::NUM_LAYERS).fold(v, |v, _| (v + 1) / 2);
        4 * config.dis_channels * shrink(height) * shrink(width)
    }
}

impl Module for Discriminator {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self
            .layers
            .iter()
            .try_fold(x.clone(), |x, layer| layer.forward(&x))?;
        x.flatten_from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_discriminator_shape() {
        let device = Device::Cpu;
        let vs = VarMap::new();
        let vb = VarBuilder::from_varmap(&vs, DType::F32, &device);
        let config = InpaintConfig {
            dis_channels: 4,
            ..InpaintConfig::toy()
        };
        let dis = Discriminator::load(vb, &config).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 3, 128, 64), &device).unwrap();
        let out = dis.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 32]);
        assert_eq!(Discriminator::output_len(&config, 128, 64), 32);

        let data = vs.data().lock().unwrap();
        assert_eq!(data["conv1.weight_orig"].dims(), &[4, 3, 5, 5]);
        assert_eq!(data["conv6.weight_u"].dims(), &[16]);
    }
}

//! Gated and spectral-normalised convolutions
//!
//! - `GatedConv2d`: one convolution producing features and a soft gate,
//!   `act(features) * sigmoid(gate)`
//! - `GatedDeconv2d`: nearest-neighbour x2 upsampling followed by a gated 3x3 convolution
//! - `SpectralNormConv2d`: 5x5 stride-2 convolution whose weight is divided by
//!   its largest singular value, estimated with one power iteration

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

/// Activation applied to the feature half of a gated convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Elu,
    Relu,
    Identity,
}

impl Activation {
    fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Elu => xs.elu(1.0),
            Activation::Relu => xs.relu(),
            Activation::Identity => Ok(xs.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GatedConvConfig {
    pub kernel_size: usize,
    pub stride: usize,
    pub dilation: usize,
    pub activation: Activation,
}

impl Default for GatedConvConfig {
    fn default() -> Self {
        Self {
            kernel_size: 3,
            stride: 1,
            dilation: 1,
            activation: Activation::Elu,
        }
    }
}

impl GatedConvConfig {
    pub fn kernel(kernel_size: usize) -> Self {
        Self {
            kernel_size,
            ..Default::default()
        }
    }

    pub fn downsample() -> Self {
        Self {
            stride: 2,
            ..Default::default()
        }
    }

    pub fn atrous(dilation: usize) -> Self {
        Self {
            dilation,
            ..Default::default()
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

/// Gated convolution
///
/// Weight path: `{prefix}.conv.weight` with `2 * out_channels` output channels,
/// the first half features and the second half gate.
#[derive(Debug)]
pub struct GatedConv2d {
    conv: Conv2d,
    out_channels: usize,
    activation: Activation,
}

impl GatedConv2d {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        config: GatedConvConfig,
    ) -> Result<Self> {
        let conv_config = Conv2dConfig {
            padding: config.dilation * (config.kernel_size - 1) / 2,
            stride: config.stride,
            dilation: config.dilation,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(
            in_channels,
            2 * out_channels,
            config.kernel_size,
            conv_config,
            vb.pp("conv"),
        )?;
        Ok(Self {
            conv,
            out_channels,
            activation: config.activation,
        })
    }
}

impl Module for GatedConv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(&x.contiguous()?)?;
        let features = x.narrow(1, 0, self.out_channels)?;
        let gate = x.narrow(1, self.out_channels, self.out_channels)?;
        self.activation
            .apply(&features)?
            .mul(&candle_nn::ops::sigmoid(&gate)?)
    }
}

/// Upsampling gated convolution
#[derive(Debug)]
pub struct GatedDeconv2d {
    conv: GatedConv2d,
}

impl GatedDeconv2d {
    pub fn load(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let conv = GatedConv2d::load(
            vb.pp("conv"),
            in_channels,
            out_channels,
            GatedConvConfig::default(),
        )?;
        Ok(Self { conv })
    }
}

impl Module for GatedDeconv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(2 * h, 2 * w)?;
        self.conv.forward(&x)
    }
}

/// Largest singular value of `weight` ([out, ...]) after one power iteration
/// started from `u` ([out]).
pub fn spectral_norm(weight: &Tensor, u: &Tensor, eps: f64) -> Result<Tensor> {
    let out = weight.dim(0)?;
    let w = weight.reshape((out, ()))?;
    let u = u.reshape((1, out))?;

    let v = l2_normalize_row(&u.matmul(&w)?, eps)?;
    let u = l2_normalize_row(&v.matmul(&w.t()?.contiguous()?)?, eps)?;
    // u W v^T
    u.matmul(&w)?.matmul(&v.t()?.contiguous()?)?.reshape(())
}

fn l2_normalize_row(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.affine(1.0, eps)?;
    xs.broadcast_div(&norm)
}

/// Spectral-normalised convolution followed by leaky ReLU
///
/// Weight path: `{prefix}.weight_orig`, `{prefix}.weight_u`, `{prefix}.bias`.
#[derive(Debug)]
pub struct SpectralNormConv2d {
    weight: Tensor,
    bias: Tensor,
    config: Conv2dConfig,
}

impl SpectralNormConv2d {
    pub const KERNEL_SIZE: usize = 5;
    const EPS: f64 = 1e-12;

    pub fn load(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let k = Self::KERNEL_SIZE;
        let weight_orig = vb.get_with_hints(
            (out_channels, in_channels, k, k),
            "weight_orig",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let weight_u = vb.get_with_hints(
            out_channels,
            "weight_u",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;

        // Normalised once at load time
        let sigma = spectral_norm(&weight_orig, &weight_u, Self::EPS)?;
        let weight = weight_orig.broadcast_div(&sigma)?;
        Ok(Self {
            weight,
            bias,
            config: Conv2dConfig {
                padding: 2,
                stride: 2,
                ..Default::default()
            },
        })
    }
}

impl Module for SpectralNormConv2d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.contiguous()?.conv2d(
            &self.weight,
            self.config.padding,
            self.config.stride,
            self.config.dilation,
            self.config.groups,
        )?;
        let x = x.broadcast_add(&self.bias.reshape((1, (), 1, 1))?)?;
        candle_nn::ops::leaky_relu(&x, 0.2)
    }
}

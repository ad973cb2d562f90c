//! Inpaint subcommand: fill a hole with the two-stage generator.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use clap::{Args, ValueEnum};

use candle_deepfill::debug::log_tensor_stats;
use candle_deepfill::model::Generator;
use candle_deepfill::{flow, ops, preprocess, InpaintConfig};

use crate::cmd_mask::MaskSource;

/// Generator variants
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum Which {
    /// 64x64 model, 32 base channels
    Toy,
    /// 256x256 model, 48 base channels
    Places,
}

impl Which {
    fn config(&self) -> InpaintConfig {
        match self {
            Which::Toy => InpaintConfig::toy(),
            Which::Places => InpaintConfig::places(),
        }
    }

    fn default_weights(&self) -> &'static str {
        match self {
            Which::Toy => "deepfill-toy.safetensors",
            Which::Places => "deepfill-places.safetensors",
        }
    }
}

/// Arguments for the inpaint subcommand
#[derive(Args, Debug)]
pub struct InpaintArgs {
    /// Input image to process.
    pub image: String,

    /// Path to generator weights, in safetensors format.
    #[arg(long)]
    pub model: Option<PathBuf>,

    /// Which generator variant to use.
    #[arg(long, value_enum, default_value_t = Which::Toy)]
    pub which: Which,

    /// Resize the image to the resolution the weights were trained at.
    #[arg(long)]
    pub native_size: bool,

    #[command(flatten)]
    pub mask: MaskSource,

    /// Output directory for the completed image, the coarse stage and the flow.
    #[arg(long, short, default_value = "inpaint_output")]
    pub output_dir: PathBuf,
}

impl InpaintArgs {
    fn model_path(&self) -> PathBuf {
        self.model
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.which.default_weights()))
    }
}

pub fn run(args: &InpaintArgs, device: &Device) -> anyhow::Result<()> {
    let config = args.which.config();
    tracing::info!(
        which = ?args.which,
        image_size = config.image_size,
        gen_channels = config.gen_channels,
        "generator config"
    );

    let model_path = args.model_path();
    if !model_path.exists() {
        anyhow::bail!(
            "Model weights not found at {:?}. Please provide a valid model path with --model.",
            model_path
        );
    }
    let start = Instant::now();
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&model_path], DType::F32, device)? };
    let generator = Generator::load(vb, &config)?;
    tracing::info!(path = ?model_path, elapsed = ?start.elapsed(), "generator loaded");

    let img = preprocess::load_image(&args.image)?;
    let img = if args.native_size {
        let size = config.image_size as u32;
        img.resize_exact(size, size, image::imageops::FilterType::Triangle)
    } else {
        preprocess::resize_to_multiple(&img, config.size_multiple() as u32)
    };
    let (width, height) = (img.width(), img.height());
    tracing::info!(width, height, "loaded image");

    let image = preprocess::add_batch_dim(&preprocess::image_to_tensor(&img, device)?)?;
    let image = ops::normalize_range(&image, (0.0, 1.0), (-1.0, 1.0))?;
    let mask = args.mask.load(width, height, device)?;

    let start = Instant::now();
    let out = generator.inpaint(&image, &mask)?;
    tracing::info!(elapsed = ?start.elapsed(), "inpainting done");
    log_tensor_stats(&out.completed, "completed")?;

    let to_unit = |t: &candle_core::Tensor| ops::normalize_range(t, (-1.0, 1.0), (0.0, 1.0));
    let incomplete = to_unit(&image.broadcast_mul(&mask.affine(-1.0, 1.0)?)?)?;
    let coarse = to_unit(&ops::composite(&out.coarse, &image, &mask)?)?;
    let completed = to_unit(&out.completed)?;

    std::fs::create_dir_all(&args.output_dir)?;
    let outputs = [
        ("input.png", preprocess::tensor_to_image(&incomplete.squeeze(0)?)?),
        ("coarse.png", preprocess::tensor_to_image(&coarse.squeeze(0)?)?),
        ("completed.png", preprocess::tensor_to_image(&completed.squeeze(0)?)?),
        ("flow.png", flow::flow_to_image(&out.flow, 0)?),
    ];
    for (name, image) in outputs {
        let path = args.output_dir.join(name);
        image.save(&path)?;
        tracing::info!(path = ?path, "saved");
    }
    Ok(())
}

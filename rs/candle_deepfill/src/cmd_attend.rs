//! Attend subcommand: contextual attention straight on image pixels.
//!
//! The pixels themselves serve as features, so the hole is filled by pasting
//! the best-matching patches from the rest of the image.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::Device;
use clap::Args;

use candle_deepfill::{flow, ops, preprocess, ContextualAttention, ContextualAttentionConfig};

use crate::cmd_mask::MaskSource;

/// Arguments for the attend subcommand
#[derive(Args, Debug)]
pub struct AttendArgs {
    /// Input image to process.
    pub image: String,

    #[command(flatten)]
    pub mask: MaskSource,

    /// Side length of the matching patches at working resolution.
    #[arg(long, default_value_t = 3)]
    pub kernel_size: usize,

    /// Step between candidate patches at working resolution.
    #[arg(long, default_value_t = 1)]
    pub stride: usize,

    /// Downsampling factor applied before matching.
    #[arg(long, default_value_t = 2)]
    pub rate: usize,

    /// Softmax temperature multiplier.
    #[arg(long, default_value_t = 10.0)]
    pub softmax_scale: f64,

    /// Skip the score smoothing pass.
    #[arg(long)]
    pub no_fuse: bool,

    /// Output directory for the filled image, the masked input and the flow.
    #[arg(long, short, default_value = "attend_output")]
    pub output_dir: PathBuf,
}

impl AttendArgs {
    fn config(&self) -> ContextualAttentionConfig {
        ContextualAttentionConfig::default()
            .with_kernel_size(self.kernel_size)
            .with_stride(self.stride)
            .with_rate(self.rate)
            .with_softmax_scale(self.softmax_scale)
            .with_fuse(!self.no_fuse)
    }
}

pub fn run(args: &AttendArgs, device: &Device) -> anyhow::Result<()> {
    let config = args.config();
    let attention = ContextualAttention::new(config.clone())?;
    tracing::info!(?config, "contextual attention");

    let img = preprocess::load_image(&args.image)?;
    let img = preprocess::resize_to_multiple(&img, config.rate as u32);
    let (width, height) = (img.width(), img.height());
    tracing::info!(width, height, "loaded image");

    let image = preprocess::add_batch_dim(&preprocess::image_to_tensor(&img, device)?)?;
    let mask = args.mask.load(width, height, device)?;
    let keep = mask.affine(-1.0, 1.0)?;
    let incomplete = image.broadcast_mul(&keep)?;

    let start = Instant::now();
    let (reconstructed, flow_field) = attention.attend(&incomplete, &incomplete, Some(&mask))?;
    tracing::info!(elapsed = ?start.elapsed(), "attention done");

    let completed = ops::composite(&reconstructed, &incomplete, &mask)?;

    std::fs::create_dir_all(&args.output_dir)?;
    let outputs = [
        ("input.png", preprocess::tensor_to_image(&incomplete.squeeze(0)?)?),
        ("completed.png", preprocess::tensor_to_image(&completed.squeeze(0)?)?),
        ("flow.png", flow::flow_to_image(&flow_field, 0)?),
    ];
    for (name, image) in outputs {
        let path = args.output_dir.join(name);
        image.save(&path)?;
        tracing::info!(path = ?path, "saved");
    }
    Ok(())
}

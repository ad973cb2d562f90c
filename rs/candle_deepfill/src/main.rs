//! Image inpainting with contextual attention on candle
//!
//! This binary runs the attention operator on raw images, the full two-stage
//! generator from safetensors weights, and generates hole masks.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_attend;
mod cmd_inpaint;
mod cmd_mask;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fill a hole directly with contextual attention over the image pixels.
    Attend(cmd_attend::AttendArgs),
    /// Fill a hole with the two-stage generator.
    Inpaint(cmd_inpaint::InpaintArgs),
    /// Generate random hole masks.
    Mask(cmd_mask::MaskArgs),
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Attend(args) => {
            let device = candle_deepfill::device(cli.cpu)?;
            tracing::info!(?device, "using device");
            cmd_attend::run(args, &device)
        }
        Commands::Inpaint(args) => {
            let device = candle_deepfill::device(cli.cpu)?;
            tracing::info!(?device, "using device");
            cmd_inpaint::run(args, &device)
        }
        Commands::Mask(args) => cmd_mask::run(args),
    }
}

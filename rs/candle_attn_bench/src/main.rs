use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_deepfill::{ContextualAttention, ContextualAttentionConfig};
use clap::Parser;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Time the contextual attention operator", long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    #[arg(long, default_value_t = 64)]
    channels: usize,

    /// Feature map height and width.
    #[arg(long, default_value_t = 64)]
    size: usize,

    #[arg(long, default_value_t = 2)]
    rate: usize,

    /// Skip the score smoothing pass.
    #[arg(long)]
    no_fuse: bool,

    #[arg(long, default_value_t = 3)]
    warmup: usize,

    #[arg(long, default_value_t = 20)]
    runs: usize,
}

/// Create deterministic test tensor with given dimensions and device.
///
/// # Arguments
/// * `dims` - Tuple of dimensions (batch_size, channels, height, width)
/// * `device` - Device to place tensor on
///
/// # Returns
/// * `Result<Tensor>` - Deterministic tensor filled with structured pattern
fn test_tensor(dims: (usize, usize, usize, usize), device: &Device) -> Result<Tensor> {
    let (batch_size, channels, height, width) = dims;
    let mut data = vec![0.0f32; batch_size * channels * height * width];
    for b in 0..batch_size {
        for c in 0..channels {
            for h in 0..height {
                for w in 0..width {
                    // Channel-dependent waves so neighbouring patches differ in direction
                    let phase = (c + 1) as f32 * 0.37 + b as f32 * 0.11;
                    let value = (h as f32 * 0.21 * phase).sin() + (w as f32 * 0.13 + phase).cos();
                    data[((b * channels + c) * height + h) * width + w] = value;
                }
            }
        }
    }
    Ok(Tensor::from_vec(
        data,
        (batch_size, channels, height, width),
        device,
    )?)
}

/// Square hole covering the middle half of the map.
fn center_hole(batch_size: usize, size: usize, device: &Device) -> Result<Tensor> {
    let (lo, hi) = (size / 4, 3 * size / 4);
    let data: Vec<f32> = (0..size * size)
        .map(|i| {
            let (y, x) = (i / size, i % size);
            if (lo..hi).contains(&y) && (lo..hi).contains(&x) {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    let mask = Tensor::from_vec(data, (1, 1, size, size), device)?;
    Ok(mask.repeat((batch_size, 1, 1, 1))?)
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let device = candle_deepfill::device(args.cpu)?;
    tracing::info!(?device, "using device");

    let config = ContextualAttentionConfig::default()
        .with_rate(args.rate)
        .with_fuse(!args.no_fuse);
    let attention = ContextualAttention::new(config)?;

    let dims = (args.batch_size, args.channels, args.size, args.size);
    let features = test_tensor(dims, &device)?;
    let mask = center_hole(args.batch_size, args.size, &device)?;

    for _ in 0..args.warmup {
        let _ = attention.attend(&features, &features, Some(&mask))?;
    }
    device.synchronize()?;

    let start = Instant::now();
    let mut output = None;
    for _ in 0..args.runs {
        output = Some(attention.attend_detailed(&features, &features, Some(&mask))?);
    }
    device.synchronize()?;
    let elapsed = start.elapsed();
    let Some(output) = output else {
        bail!("no timed runs, pass --runs 1 or more");
    };
    tracing::info!(
        runs = args.runs,
        avg_ms = elapsed.as_secs_f64() * 1e3 / args.runs as f64,
        "contextual attention timing"
    );

    // Shapes
    let flow_shape = [args.batch_size, 2, args.size, args.size];
    if output.reconstructed.dims() != features.dims() || output.flow.dims() != flow_shape {
        bail!(
            "unexpected output shapes: reconstructed {:?}, flow {:?}",
            output.reconstructed.dims(),
            output.flow.dims()
        );
    }

    // Finite values
    let values = output.reconstructed.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    if let Some(i) = values.iter().position(|v| !v.is_finite()) {
        bail!("non-finite reconstruction value {} at index {}", values[i], i);
    }

    // Weights form a distribution at every location
    let sums = output.weights.sum(1)?;
    let max_err = sums.affine(1.0, -1.0)?.abs()?.max_all()?.to_scalar::<f32>()?;
    if max_err > 1e-4 {
        bail!("attention weights do not sum to one, max error {max_err}");
    }

    // Determinism
    let again = attention.attend_detailed(&features, &features, Some(&mask))?;
    let max_diff = output
        .reconstructed
        .sub(&again.reconstructed)?
        .abs()?
        .max_all()?
        .to_scalar::<f32>()?;
    if max_diff > 1e-6 {
        bail!("output is not deterministic, max difference {max_diff}");
    }

    tracing::info!(
        mean = output.reconstructed.mean_all()?.to_scalar::<f32>()?,
        min = output.reconstructed.min_all()?.to_scalar::<f32>()?,
        max = output.reconstructed.max_all()?.to_scalar::<f32>()?,
        "all checks passed"
    );
    Ok(())
}

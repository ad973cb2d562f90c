//! Mask subcommand: random hole masks written as PNG files plus a JSON manifest.
//!
//! Also hosts the mask options shared by the `attend` and `inpaint` subcommands.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::{Args, ValueEnum};
use image::imageops::FilterType;
use inpaint_masks::{
    bbox_to_mask, brush_stroke_mask, random_bbox, BBox, BBoxConfig, BrushStrokeConfig, Mask,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use candle_deepfill::preprocess;

/// Kind of generated hole
#[derive(Clone, Copy, ValueEnum, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    /// Random rectangle
    Bbox,
    /// Free-form brush strokes
    Brush,
    /// Union of a rectangle and brush strokes
    Both,
}

/// Arguments for the mask subcommand
#[derive(Args, Debug)]
pub struct MaskArgs {
    /// Mask width in pixels.
    #[arg(long, default_value_t = 256)]
    pub width: usize,

    /// Mask height in pixels.
    #[arg(long, default_value_t = 256)]
    pub height: usize,

    /// Kind of hole to generate.
    #[arg(long, value_enum, default_value_t = MaskKind::Brush)]
    pub kind: MaskKind,

    /// Number of masks to generate.
    #[arg(long, default_value_t = 1)]
    pub count: usize,

    /// Seed of the random number generator.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Largest total shrink of a box hole, per direction.
    #[arg(long, default_value_t = 32)]
    pub max_delta: usize,

    /// Output directory for the PNG files and manifest.json.
    #[arg(long, short, default_value = "masks")]
    pub output_dir: PathBuf,
}

/// One generated mask in manifest.json
#[derive(Debug, Serialize)]
struct ManifestEntry {
    file: String,
    kind: MaskKind,
    width: usize,
    height: usize,
    bbox: Option<BBox>,
    coverage: f32,
}

#[derive(Debug, Serialize)]
struct Manifest {
    seed: u64,
    masks: Vec<ManifestEntry>,
}

/// Generate one mask of the requested kind.
pub fn generate(
    rng: &mut StdRng,
    kind: MaskKind,
    width: usize,
    height: usize,
    max_delta: usize,
) -> (Mask, Option<BBox>) {
    match kind {
        MaskKind::Bbox => {
            let (mask, bbox) = boxed_mask(rng, width, height, max_delta);
            (mask, Some(bbox))
        }
        MaskKind::Brush => (
            brush_stroke_mask(rng, &BrushStrokeConfig::for_image(width, height)),
            None,
        ),
        MaskKind::Both => {
            let (mask, bbox) = boxed_mask(rng, width, height, max_delta);
            let strokes = brush_stroke_mask(rng, &BrushStrokeConfig::for_image(width, height));
            // Both masks share the image size
            let union = mask.union(&strokes).unwrap_or(mask);
            (union, Some(bbox))
        }
    }
}

fn boxed_mask(rng: &mut StdRng, width: usize, height: usize, max_delta: usize) -> (Mask, BBox) {
    let bbox = random_bbox(rng, &BBoxConfig::for_image(width, height));
    let mask = bbox_to_mask(rng, &bbox, max_delta, max_delta, height, width);
    (mask, bbox)
}

pub fn run(args: &MaskArgs) -> anyhow::Result<()> {
    if args.width == 0 || args.height == 0 {
        anyhow::bail!("mask size must be positive, got {}x{}", args.width, args.height);
    }
    std::fs::create_dir_all(&args.output_dir)?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut masks = Vec::with_capacity(args.count);
    for index in 0..args.count {
        let (mask, bbox) = generate(&mut rng, args.kind, args.width, args.height, args.max_delta);
        let file = format!("mask_{index:04}.png");
        mask.to_image().save(args.output_dir.join(&file))?;
        tracing::info!(file = %file, coverage = mask.coverage(), "wrote mask");
        masks.push(ManifestEntry {
            file,
            kind: args.kind,
            width: mask.width,
            height: mask.height,
            bbox,
            coverage: mask.coverage(),
        });
    }

    let manifest = Manifest {
        seed: args.seed,
        masks,
    };
    let manifest_path = args.output_dir.join("manifest.json");
    std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
    tracing::info!(path = ?manifest_path, count = args.count, "wrote manifest");
    Ok(())
}

/// Mask options shared by the `attend` and `inpaint` subcommands
#[derive(Args, Debug)]
pub struct MaskSource {
    /// Mask image, white marks the hole. A random mask is generated when absent.
    #[arg(long)]
    pub mask: Option<PathBuf>,

    /// Kind of hole to generate when no mask image is given.
    #[arg(long, value_enum, default_value_t = MaskKind::Bbox)]
    pub mask_kind: MaskKind,

    /// Seed used to generate the mask.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

impl MaskSource {
    /// Hole mask of size `width x height` as a [1, 1, H, W] tensor.
    pub fn load(&self, width: u32, height: u32, device: &Device) -> anyhow::Result<Tensor> {
        let mask = match &self.mask {
            Some(path) => {
                let img = image::open(path)?;
                let img = if (img.width(), img.height()) != (width, height) {
                    img.resize_exact(width, height, FilterType::Nearest)
                } else {
                    img
                };
                preprocess::mask_image_to_tensor(&img, device)?
            }
            None => {
                let mut rng = StdRng::seed_from_u64(self.seed);
                let (w, h) = (width as usize, height as usize);
                let (mask, _) = generate(&mut rng, self.mask_kind, w, h, w.min(h) / 8);
                preprocess::mask_to_tensor(&mask, device)?
            }
        };
        let coverage = mask.mean_all()?.to_scalar::<f32>()?;
        tracing::info!(coverage, "hole mask");
        Ok(preprocess::add_batch_dim(&mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_kinds() {
        let mut rng = StdRng::seed_from_u64(3);
        let (bbox_mask, bbox) = generate(&mut rng, MaskKind::Bbox, 64, 64, 8);
        let bbox = bbox.unwrap();
        assert_eq!((bbox.height, bbox.width), (32, 32));
        assert!(bbox_mask.coverage() > 0.0);

        let (brush, bbox) = generate(&mut rng, MaskKind::Brush, 64, 64, 8);
        assert!(bbox.is_none());
        assert_eq!((brush.width, brush.height), (64, 64));

        let (both, bbox) = generate(&mut rng, MaskKind::Both, 64, 64, 8);
        assert!(bbox.is_some());
        assert!(both.coverage() >= 12.0 * 12.0 / (64.0 * 64.0));
    }

    #[test]
    fn test_generated_mask_source_is_seeded() {
        let device = Device::Cpu;
        let source = MaskSource {
            mask: None,
            mask_kind: MaskKind::Both,
            seed: 5,
        };
        let a = source.load(48, 32, &device).unwrap();
        let b = source.load(48, 32, &device).unwrap();
        assert_eq!(a.dims(), &[1, 1, 32, 48]);
        let diff = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(diff, 0.0);
    }
}

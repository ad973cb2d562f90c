//! Hole masks for inpainting.
//!
//! This crate provides:
//! - Random rectangular holes (`random_bbox` + `bbox_to_mask`)
//! - Free-form brush-stroke holes (`brush_stroke_mask`)
//! - A small row-major [`Mask`] buffer with conversions to and from grayscale images
//!
//! Every generator takes the random number generator explicitly, so a seeded
//! `StdRng` reproduces the same masks.

use image::{GrayImage, Luma};
use rand::Rng;
use rand_distr::{Distribution, Normal};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Grayscale values at or above this mark the hole when reading mask images.
pub const MASK_IMAGE_THRESHOLD: u8 = 128;

/// Binary hole mask, row-major, 1.0 inside the hole.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl Mask {
    /// Mask without any hole.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// Fraction of pixels inside the hole.
    pub fn coverage(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let holes = self.data.iter().filter(|&&v| v >= 0.5).count();
        holes as f32 / self.data.len() as f32
    }

    /// Pixel-wise union of two holes, `None` when the sizes differ.
    pub fn union(&self, other: &Mask) -> Option<Mask> {
        if (self.width, self.height) != (other.width, other.height) {
            return None;
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a.max(*b))
            .collect();
        Some(Mask {
            width: self.width,
            height: self.height,
            data,
        })
    }

    /// Mirror top to bottom.
    pub fn flip_vertical(&mut self) {
        let w = self.width;
        for y in 0..self.height / 2 {
            let opposite = self.height - 1 - y;
            for x in 0..w {
                self.data.swap(y * w + x, opposite * w + x);
            }
        }
    }

    /// Mirror left to right.
    pub fn flip_horizontal(&mut self) {
        for row in self.data.chunks_exact_mut(self.width.max(1)) {
            row.reverse();
        }
    }

    /// Grayscale image with the hole drawn white.
    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let v = self.get(x as usize, y as usize);
            Luma([if v >= 0.5 { 255 } else { 0 }])
        })
    }

    /// Read a hole from a grayscale image, see [`MASK_IMAGE_THRESHOLD`].
    pub fn from_image(img: &GrayImage) -> Self {
        let (width, height) = img.dimensions();
        let data = img
            .pixels()
            .map(|p| if p.0[0] >= MASK_IMAGE_THRESHOLD { 1.0 } else { 0.0 })
            .collect();
        Self {
            width: width as usize,
            height: height as usize,
            data,
        }
    }

    fn from_gray(img: GrayImage) -> Self {
        let (width, height) = img.dimensions();
        let data = img
            .into_raw()
            .into_iter()
            .map(|v| if v > 0 { 1.0 } else { 0.0 })
            .collect();
        Self {
            width: width as usize,
            height: height as usize,
            data,
        }
    }
}

/// Rectangle in pixel coordinates.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BBox {
    pub top: usize,
    pub left: usize,
    pub height: usize,
    pub width: usize,
}

/// Placement rules for random boxes.
#[derive(Debug, Clone)]
pub struct BBoxConfig {
    pub image_height: usize,
    pub image_width: usize,
    pub box_height: usize,
    pub box_width: usize,
    pub vertical_margin: usize,
    pub horizontal_margin: usize,
}

impl Default for BBoxConfig {
    fn default() -> Self {
        Self {
            image_height: 256,
            image_width: 256,
            box_height: 128,
            box_width: 128,
            vertical_margin: 0,
            horizontal_margin: 0,
        }
    }
}

impl BBoxConfig {
    /// Box half the image size in each direction.
    pub fn for_image(image_width: usize, image_height: usize) -> Self {
        Self {
            image_height,
            image_width,
            box_height: image_height / 2,
            box_width: image_width / 2,
            ..Self::default()
        }
    }
}

/// Draw a box of the configured size at a random position inside the margins.
///
/// When the box does not fit, it is pinned to the top/left margin.
pub fn random_bbox<R: Rng + ?Sized>(rng: &mut R, config: &BBoxConfig) -> BBox {
    let top = random_start(
        rng,
        config.vertical_margin,
        config.image_height,
        config.box_height,
    );
    let left = random_start(
        rng,
        config.horizontal_margin,
        config.image_width,
        config.box_width,
    );
    BBox {
        top,
        left,
        height: config.box_height,
        width: config.box_width,
    }
}

fn random_start<R: Rng + ?Sized>(rng: &mut R, margin: usize, image: usize, extent: usize) -> usize {
    let max = image.saturating_sub(margin + extent);
    if max > margin {
        rng.gen_range(margin..max)
    } else {
        margin
    }
}

/// Hole covering `bbox` shrunk on every side by a random amount.
///
/// The vertical shrink is drawn from `[0, max_delta_height / 2]`, the
/// horizontal one from `[0, max_delta_width / 2]`. The rectangle is clipped to
/// the image.
pub fn bbox_to_mask<R: Rng + ?Sized>(
    rng: &mut R,
    bbox: &BBox,
    max_delta_height: usize,
    max_delta_width: usize,
    height: usize,
    width: usize,
) -> Mask {
    let mut mask = Mask::new(width, height);
    let dh = rng.gen_range(0..=max_delta_height / 2);
    let dw = rng.gen_range(0..=max_delta_width / 2);

    let y0 = bbox.top + dh;
    let y1 = (bbox.top + bbox.height).saturating_sub(dh).min(height);
    let x0 = bbox.left + dw;
    let x1 = (bbox.left + bbox.width).saturating_sub(dw).min(width);
    for y in y0..y1 {
        for x in x0..x1 {
            mask.set(x, y, 1.0);
        }
    }
    mask
}

/// Parameters of the free-form stroke generator.
#[derive(Debug, Clone)]
pub struct BrushStrokeConfig {
    pub width: usize,
    pub height: usize,
    pub min_num_vertex: usize,
    pub max_num_vertex: usize,
    pub min_line_width: f32,
    pub max_line_width: f32,
}

impl Default for BrushStrokeConfig {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            min_num_vertex: 4,
            max_num_vertex: 12,
            min_line_width: 12.0,
            max_line_width: 40.0,
        }
    }
}

impl BrushStrokeConfig {
    pub fn for_image(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }
}

/// Paint a thick segment with round caps by stamping discs along it.
fn draw_thick_segment(img: &mut GrayImage, from: (i32, i32), to: (i32, i32), radius: i32) {
    let (dx, dy) = ((to.0 - from.0) as f32, (to.1 - from.1) as f32);
    let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as i32;
    for i in 0..=steps {
        let t = i as f32 / steps as f32;
        let x = from.0 + (dx * t).round() as i32;
        let y = from.1 + (dy * t).round() as i32;
        imageproc::drawing::draw_filled_circle_mut(img, (x, y), radius, Luma([255u8]));
    }
}

/// Free-form mask made of one to three random zig-zag brush strokes.
///
/// Each stroke has between `min_num_vertex` and `max_num_vertex - 1`
/// vertices. Turning angles alternate around `2π/5`, segment lengths follow a
/// normal distribution around an eighth of the image diagonal, and every
/// stroke has a uniformly drawn width. The result is randomly mirrored
/// vertically and horizontally.
pub fn brush_stroke_mask<R: Rng + ?Sized>(rng: &mut R, config: &BrushStrokeConfig) -> Mask {
    let (w, h) = (config.width, config.height);
    if w == 0 || h == 0 {
        return Mask::new(w, h);
    }
    let mean_angle = 2.0 * std::f32::consts::PI / 5.0;
    let angle_range = 2.0 * std::f32::consts::PI / 15.0;
    let average_radius = ((h * h + w * w) as f32).sqrt() / 8.0;
    let Ok(radius_dist) = Normal::new(average_radius, (average_radius / 2.0).floor()) else {
        return Mask::new(w, h);
    };

    let mut img = GrayImage::new(w as u32, h as u32);
    let num_strokes = rng.gen_range(1..4);
    for _ in 0..num_strokes {
        let num_vertex = if config.max_num_vertex > config.min_num_vertex {
            rng.gen_range(config.min_num_vertex..config.max_num_vertex)
        } else {
            config.min_num_vertex
        };
        let angle_min = mean_angle - rng.gen_range(0.0..angle_range);
        let angle_max = mean_angle + rng.gen_range(0.0..angle_range);
        let angles: Vec<f32> = (0..num_vertex)
            .map(|i| {
                let angle = if angle_max > angle_min {
                    rng.gen_range(angle_min..angle_max)
                } else {
                    angle_min
                };
                if i % 2 == 0 {
                    2.0 * std::f32::consts::PI - angle
                } else {
                    angle
                }
            })
            .collect();

        let line_width = if config.max_line_width > config.min_line_width {
            rng.gen_range(config.min_line_width..config.max_line_width)
        } else {
            config.min_line_width
        } as i32;
        let radius = (line_width / 2).max(1);

        let mut vertex = (rng.gen_range(0..w) as i32, rng.gen_range(0..h) as i32);
        for angle in angles.iter().skip(1) {
            let r = radius_dist
                .sample(rng)
                .clamp(0.0, 2.0 * average_radius);
            let new_x = (vertex.0 as f32 + r * angle.cos()).clamp(0.0, w as f32) as i32;
            let new_y = (vertex.1 as f32 + r * angle.sin()).clamp(0.0, h as f32) as i32;
            let next = (new_x, new_y);
            draw_thick_segment(&mut img, vertex, next, radius);
            vertex = next;
        }
    }

    let mut mask = Mask::from_gray(img);
    if rng.gen_bool(0.5) {
        mask.flip_vertical();
    }
    if rng.gen_bool(0.5) {
        mask.flip_horizontal();
    }
    mask
}

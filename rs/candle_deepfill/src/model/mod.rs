pub mod discriminator;
pub mod generator;
pub mod layers;

pub use discriminator::Discriminator;
pub use generator::{Generator, InpaintOutput};

//! Two-stage image inpainting with contextual attention on candle
//!
//! The core is [`ContextualAttention`], which fills a hole in a feature map by
//! borrowing patches from the rest of the map. It is built from the explicit
//! primitives in [`patches`] and used by the [`model::Generator`].

pub mod config;
pub mod contextual_attention;
pub mod debug;
pub mod error;
pub mod flow;
pub mod model;
pub mod ops;
pub mod patches;
pub mod preprocess;

pub use config::{ContextualAttentionConfig, InpaintConfig};
pub use contextual_attention::{AttentionOutput, ContextualAttention};
pub use error::{Error, Result};

use candle_core::Device;

/// Select the compute device
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("running on CPU, build with `--features metal` to run on GPU");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("running on CPU, build with `--features cuda` to run on GPU");
        }
        Ok(Device::Cpu)
    }
}

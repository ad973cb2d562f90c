//! Error type for the attention operator and the patch primitives.
//!
//! Layer code keeps returning `candle_core::Result`; only the operator surface
//! distinguishes shape problems from configuration problems.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Input tensors disagree with each other or with the configured rate.
    #[error("shape error: {0}")]
    Shape(String),

    /// The operator was configured with values it cannot run with.
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! shape_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Shape(format!($($arg)*)))
    };
}

macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Config(format!($($arg)*)))
    };
}

pub(crate) use config_bail;
pub(crate) use shape_bail;

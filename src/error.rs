use thiserror::Error;

use crate::Shape;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch { expected: Shape, found: Shape },

    #[error("{len} elements do not fit shape {shape:?}")]
    DataLength { shape: Shape, len: usize },

    #[error("unknown layer: {0}")]
    UnknownLayer(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

//! Shadow scheduling errors

use thiserror::Error;

use crate::light::LightId;

/// Errors raised while setting up or packing shadows.
///
/// Geometric failures are recoverable: the scheduler drops the affected
/// shadow for the frame. `AtlasOverflow` is an invariant violation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShadowError {
    #[error("Invalid shadow configuration: {0}")]
    InvalidConfig(String),

    #[error("Shadow projection is degenerate")]
    DegenerateProjection,

    #[error("Shadow subject projects behind the light")]
    BehindLight,

    #[error("Shadow resolution rounded to zero")]
    ZeroResolution,

    #[error("Shadow of {width}x{height} does not fit an empty {atlas_size}x{atlas_size} atlas")]
    AtlasOverflow {
        width: u32,
        height: u32,
        atlas_size: u32,
    },

    #[error("Unknown light: {0:?}")]
    UnknownLight(LightId),

    #[error("Preshadow cache layout error: {0}")]
    PreshadowLayout(String),
}

/// Result type for shadow operations
pub type Result<T> = std::result::Result<T, ShadowError>;

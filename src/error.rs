//! Error kinds surfaced by the renderer core.

use thiserror::Error;

/// Errors produced by the renderer.
///
/// Most of these are consumed internally by retry loops and never escape a
/// frame; the host-facing channels are the warning callback and the
/// `Result` of `present()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// A required argument was missing or unusable.
    #[error("invalid argument")]
    InvalidArgument,

    /// A coordinate did not fit the narrower wire type.
    #[error("arithmetic overflow during coordinate conversion")]
    ArithmeticOverflow,

    /// A scratch buffer was too small; the caller grows it and retries.
    #[error("insufficient buffer capacity")]
    InsufficientBuffer,

    /// The atlas packer could not place a rectangle; triggers the
    /// overflow protocol.
    #[error("glyph atlas is full")]
    AtlasFull,

    /// The atlas could not place a rectangle even after a reset.
    /// Fatal for the frame; surfaces to the host.
    #[error("glyph atlas cannot grow large enough (possible deadlock)")]
    PossibleDeadlock,

    /// A shader failed to compile; reported through the warning callback
    /// and the renderer proceeds without the custom stage.
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),

    /// The GPU device was lost; the next frame rebuilds all GPU state.
    #[error("GPU device lost")]
    DeviceLost,

    /// No font face covers the requested text. Internal fallback signal,
    /// never propagated past the shaping layer.
    #[error("no font face available")]
    NoFontFace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_stable() {
        assert_eq!(RenderError::AtlasFull.to_string(), "glyph atlas is full");
        assert_eq!(
            RenderError::ShaderCompile("bad wgsl".into()).to_string(),
            "shader compilation failed: bad wgsl",
        );
    }

    #[test]
    fn kinds_compare_by_variant() {
        assert_eq!(RenderError::DeviceLost, RenderError::DeviceLost);
        assert_ne!(RenderError::AtlasFull, RenderError::PossibleDeadlock);
        // Retry loops clone errors across the warning callback boundary.
        let e = RenderError::InsufficientBuffer;
        assert_eq!(e.clone(), e);
    }
}

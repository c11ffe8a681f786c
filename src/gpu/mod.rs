//! GPU rendering: device plumbing, glyph atlas, pipelines, and the
//! present layer.

pub mod atlas;
pub mod builtin_glyphs;
pub mod context;
pub mod instance;
pub mod pipeline;
pub mod renderer;

pub use context::GpuContext;
pub use instance::{QuadInstance, ShadingKind};
pub use renderer::Presenter;

//! GPU glyph-atlas text renderer core for cell-grid terminals.
//!
//! The crate is split along the thread boundary of the renderer:
//!
//! * [`engine::AtlasEngine`] is the producer surface. The host calls it on
//!   the buffer-owning thread to invalidate regions, paint rows of shaped
//!   text into the frame payload, and update settings.
//! * [`gpu::Presenter`] is the consumer. It runs on the render thread,
//!   rasterizes unseen glyphs into the atlas texture, and turns the
//!   accumulated payload into one instanced draw per frame.
//!
//! The two sides share a [`payload::RenderPayload`] guarded by the host (or
//! by [`sync::FrameLink`] when using the built-in handoff), plus an
//! immutable [`font::FontStore`] snapshot for rasterization.

pub mod color;
pub mod engine;
pub mod error;
pub mod font;
pub mod gpu;
pub mod payload;
pub mod row;
pub mod settings;
pub mod sync;

pub use engine::AtlasEngine;
pub use error::RenderError;
pub use gpu::{GpuContext, Presenter};
pub use payload::RenderPayload;
pub use sync::FrameLink;

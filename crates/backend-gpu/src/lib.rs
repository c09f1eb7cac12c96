//! GPU backend for tileforge, built on wgpu.

pub mod runtime;

pub use runtime::*;

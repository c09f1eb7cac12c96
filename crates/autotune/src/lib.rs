//! Autotuning support for tileforge kernels.

pub mod cache;
pub mod tuner;

pub use cache::*;
pub use tuner::*;

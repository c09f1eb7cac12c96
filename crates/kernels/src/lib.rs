//! Kernel generation for tileforge: data model, template engine, matmul
//! variants and the backend contract they are dispatched through.

pub mod backend;
pub mod config;
pub mod error;
pub mod matmul;
pub mod mutate;
pub mod reference;
pub mod registry;
pub mod shaders;
pub mod template;
pub mod utils;

pub use backend::*;
pub use config::*;
pub use error::*;
pub use matmul::*;
pub use mutate::*;
pub use reference::*;
pub use registry::*;
pub use template::*;
pub use utils::*;

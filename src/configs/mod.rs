pub mod adapter;
pub mod base;
pub mod engine;
pub mod logging;
pub mod surface;

pub use adapter::*;
pub use base::*;
pub use engine::*;
pub use logging::*;
pub use surface::*;

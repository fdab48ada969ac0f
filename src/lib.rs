pub mod adapter;
pub mod buffer;
pub mod common;
pub mod configs;
pub mod constants;
pub mod engine;
pub mod filters;
pub mod format;
pub mod surface;

pub use adapter::{Adapter, AdapterState, FillInfo, Notification, Request};
pub use common::errors::{AdapterError, ErrorKind, Result};
pub use engine::{BoxedEngine, EngineBinding, RemoteEngine, SoftwareEngine};
pub use surface::{BoxedSurface, DisplaySurface, FrameQueueSurface};

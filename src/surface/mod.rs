//! Display surface sink for output buffers.
//!
//! A surface takes ownership of output buffers for presentation and hands
//! them back later through a [`Recycler`], which posts into the adapter inbox.

pub mod frame_queue;

pub use frame_queue::{FrameQueueSurface, SurfaceControl};

use crate::{
    adapter::message::Message,
    buffer::BufferDescriptor,
    common::{errors::Result, types::BufferId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The surface is done with this buffer.
    Returned(BufferId),
}

/// Posts recycled buffers back to the adapter.
#[derive(Clone)]
pub struct Recycler {
    tx: flume::Sender<Message>,
}

impl Recycler {
    pub fn new(tx: flume::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the adapter is gone.
    pub fn returned(&self, id: BufferId) -> bool {
        self.tx
            .send(Message::Surface(SurfaceEvent::Returned(id)))
            .is_ok()
    }
}

pub trait DisplaySurface: Send {
    fn name(&self) -> &str;

    /// Register the output buffer set for one configuration epoch.
    fn attach(&mut self, buffers: &[BufferDescriptor], recycler: Recycler) -> Result<()>;

    /// Take a filled buffer for presentation.
    fn present(&mut self, buffer: BufferDescriptor) -> Result<()>;

    /// Forget the attached set. Buffers still held are not returned.
    fn detach(&mut self);
}

pub type BoxedSurface = Box<dyn DisplaySurface>;

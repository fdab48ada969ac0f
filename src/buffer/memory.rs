//! Backing memory for buffer payloads.
//!
//! A `SharedMemory` handle is cloned into every place that needs to touch a
//! buffer (port, engine worker, client). The handle itself never decides who
//! may write; the ownership tag on the descriptor does.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;

use crate::{
    common::errors::{AdapterError, Result},
    format::PixelFormat,
};

struct Region {
    bytes: Vec<u8>,
    capacity: usize,
}

/// Cloneable handle to a fixed-capacity byte region plus its filled range.
#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<Mutex<Region>>,
}

impl SharedMemory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_storage(Vec::with_capacity(capacity), capacity)
    }

    /// Wrap pool storage; `capacity` is the logical size, the vector may be larger.
    pub fn from_storage(mut storage: Vec<u8>, capacity: usize) -> Self {
        storage.clear();
        Self {
            inner: Arc::new(Mutex::new(Region {
                bytes: storage,
                capacity,
            })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Bytes currently filled.
    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the filled range with `data`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut region = self.inner.lock();
        if data.len() > region.capacity {
            return Err(AdapterError::protocol(format!(
                "{} bytes do not fit a {} byte buffer",
                data.len(),
                region.capacity
            )));
        }
        region.bytes.clear();
        region.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Copy of the filled range.
    pub fn read(&self) -> Vec<u8> {
        self.inner.lock().bytes.clone()
    }

    /// Mark the region as holding a prefix of `len` bytes; used after an
    /// engine wrote fewer bytes than the capacity.
    pub fn truncate(&self, len: usize) {
        self.inner.lock().bytes.truncate(len);
    }

    pub fn clear(&self) {
        self.inner.lock().bytes.clear();
    }

    /// Move the storage out so it can go back to a pool. The handle is left empty.
    pub fn take_storage(&self) -> Vec<u8> {
        let mut region = self.inner.lock();
        region.capacity = 0;
        std::mem::take(&mut region.bytes)
    }

    pub fn ptr_eq(&self, other: &SharedMemory) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let region = self.inner.lock();
        f.debug_struct("SharedMemory")
            .field("len", &region.bytes.len())
            .field("capacity", &region.capacity)
            .finish()
    }
}

/// Graphics buffer handed to a display surface.
#[derive(Debug, Clone)]
pub struct GraphicBuffer {
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<PixelFormat>,
    pub memory: SharedMemory,
}

/// What a descriptor points at.
#[derive(Debug, Clone)]
pub enum Payload {
    Linear(SharedMemory),
    Graphic(GraphicBuffer),
}

impl Payload {
    pub fn memory(&self) -> &SharedMemory {
        match self {
            Self::Linear(memory) => memory,
            Self::Graphic(graphic) => &graphic.memory,
        }
    }

    pub fn is_graphic(&self) -> bool {
        matches!(self, Self::Graphic(_))
    }
}

/// Synchronization token saying when a payload is safe to touch.
#[derive(Clone)]
pub struct Fence {
    id: u64,
    signalled: Arc<AtomicBool>,
}

impl Fence {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            signalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signal(&self) {
        self.signalled.store(true, Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fence({}, signalled={})", self.id, self.is_signalled())
    }
}

impl PartialEq for Fence {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.signalled, &other.signalled)
    }
}

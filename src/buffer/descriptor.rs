use serde::{Deserialize, Serialize};

use crate::{
    buffer::memory::{Fence, Payload},
    common::{
        errors::{AdapterError, Result},
        types::{BufferId, Generation, PortIndex},
    },
};

/// Who currently holds a buffer. Exactly one value at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Ownership {
    Adapter,
    Engine,
    UpstreamClient,
    DownstreamClient,
    DisplaySurface,
}

impl Ownership {
    /// Owners that return the buffer asynchronously.
    pub fn is_external(self) -> bool {
        !matches!(self, Self::Adapter)
    }
}

/// Per-buffer flags carried with fill and drain hand-outs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferFlags {
    pub end_of_stream: bool,
}

impl BufferFlags {
    pub const EOS: Self = Self {
        end_of_stream: true,
    };
}

/// One buffer slot.
///
/// The copy stored in a [`Port`](super::Port) is authoritative; clones handed
/// to the engine or the client are snapshots whose ownership field only tells
/// the receiver what role it was given.
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    id: BufferId,
    port: PortIndex,
    ownership: Ownership,
    pub payload: Payload,
    pub fence: Option<Fence>,
    pub generation: Generation,
    pub flags: BufferFlags,
    pub timestamp_us: u64,
    /// Position of this hand-out among all engine submissions on the port.
    pub sequence: u64,
}

impl BufferDescriptor {
    pub fn new(id: BufferId, port: PortIndex, payload: Payload, generation: Generation) -> Self {
        Self {
            id,
            port,
            ownership: Ownership::Adapter,
            payload,
            fence: None,
            generation,
            flags: BufferFlags::default(),
            timestamp_us: 0,
            sequence: 0,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn port(&self) -> PortIndex {
        self.port
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned_by(&self, owner: Ownership) -> bool {
        self.ownership == owner
    }

    /// Move the buffer to `to`.
    ///
    /// Every hand-out starts from `Adapter` and every return ends there.
    /// Upstream clients only ever hold input buffers; downstream clients and
    /// the display surface only ever hold output buffers.
    pub fn transition(&mut self, to: Ownership) -> Result<()> {
        let allowed = match (self.ownership, to) {
            (Ownership::Adapter, Ownership::Adapter) => false,
            (Ownership::Adapter, Ownership::Engine) => true,
            (Ownership::Adapter, Ownership::UpstreamClient) => self.port == PortIndex::Input,
            (Ownership::Adapter, Ownership::DownstreamClient | Ownership::DisplaySurface) => {
                self.port == PortIndex::Output
            }
            (_, Ownership::Adapter) => true,
            _ => false,
        };

        if !allowed {
            return Err(AdapterError::protocol(format!(
                "{} buffer {} cannot move from {:?} to {:?}",
                self.port, self.id, self.ownership, to
            )));
        }
        self.ownership = to;
        Ok(())
    }

    /// Reset per-trip metadata once the buffer is back with the adapter.
    pub fn reset_trip(&mut self) {
        self.flags = BufferFlags::default();
        self.timestamp_us = 0;
        self.fence = None;
    }
}

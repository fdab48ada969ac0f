use std::collections::VecDeque;

use crate::{
    buffer::{
        descriptor::{BufferDescriptor, Ownership},
        memory::{GraphicBuffer, Payload, SharedMemory},
        pool::BytePool,
    },
    common::{
        errors::{AdapterError, Result},
        types::{BufferId, Generation, PortIndex},
    },
    constants::MAX_BUFFERS_PER_PORT,
    format::{MediaFormat, PortFormat},
};

/// One direction of buffer flow.
///
/// `M` is the control message type parked in the deferred queue while the
/// port is being reconfigured.
pub struct Port<M> {
    index: PortIndex,
    format: Option<PortFormat>,
    buffers: Vec<BufferDescriptor>,
    end_of_stream_seen: bool,
    deferred: VecDeque<M>,
    parked: VecDeque<BufferId>,
    sequence: u64,
}

impl<M> Port<M> {
    pub fn new(index: PortIndex) -> Self {
        Self {
            index,
            format: None,
            buffers: Vec::new(),
            end_of_stream_seen: false,
            deferred: VecDeque::new(),
            parked: VecDeque::new(),
            sequence: 0,
        }
    }

    pub fn index(&self) -> PortIndex {
        self.index
    }

    pub fn format(&self) -> Option<PortFormat> {
        self.format
    }

    pub fn is_allocated(&self) -> bool {
        !self.buffers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Create `format.buffer_count` descriptors, all owned by the adapter.
    ///
    /// Ids come from `next_id` and are never reused by the caller, so ids
    /// handed out before a free never alias ids handed out after it.
    pub fn allocate(
        &mut self,
        format: PortFormat,
        graphic: bool,
        next_id: &mut u32,
        pool: &BytePool,
        generation: Generation,
    ) -> Result<()> {
        if self.is_allocated() {
            return Err(AdapterError::allocation(format!(
                "{} port is already allocated",
                self.index
            )));
        }
        if format.buffer_count == 0 || format.buffer_count > MAX_BUFFERS_PER_PORT {
            return Err(AdapterError::allocation(format!(
                "{} buffers requested on {} port, limit is 1..={}",
                format.buffer_count, self.index, MAX_BUFFERS_PER_PORT
            )));
        }
        if format.buffer_size == 0 {
            return Err(AdapterError::allocation(format!(
                "{} port format {} has zero-sized buffers",
                self.index, format.media
            )));
        }

        self.buffers.reserve_exact(format.buffer_count);
        for _ in 0..format.buffer_count {
            let memory = SharedMemory::from_storage(pool.acquire(format.buffer_size), format.buffer_size);
            let payload = if graphic {
                Payload::Graphic(graphic_buffer(format, memory))
            } else {
                Payload::Linear(memory)
            };
            let id = BufferId(*next_id);
            *next_id = next_id.wrapping_add(1);
            self.buffers
                .push(BufferDescriptor::new(id, self.index, payload, generation));
        }
        self.format = Some(format);
        Ok(())
    }

    /// Destroy every descriptor and hand the storage back to `pool`.
    ///
    /// Fails without touching anything if a buffer is still held elsewhere.
    pub fn free(&mut self, pool: &BytePool) -> Result<()> {
        if let Some(held) = self.buffers.iter().find(|b| b.ownership().is_external()) {
            return Err(AdapterError::State(format!(
                "{} port cannot be freed while {} is owned by {:?}",
                self.index,
                held.id(),
                held.ownership()
            )));
        }
        for desc in self.buffers.drain(..) {
            pool.release(desc.payload.memory().take_storage());
        }
        self.format = None;
        self.parked.clear();
        Ok(())
    }

    pub fn buffers(&self) -> &[BufferDescriptor] {
        &self.buffers
    }

    pub fn get(&self, id: BufferId) -> Option<&BufferDescriptor> {
        self.buffers.iter().find(|b| b.id() == id)
    }

    pub fn get_mut(&mut self, id: BufferId) -> Option<&mut BufferDescriptor> {
        self.buffers.iter_mut().find(|b| b.id() == id)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.get(id).is_some()
    }

    /// Move `id` to `to` and return a snapshot of the updated descriptor.
    pub fn transition(&mut self, id: BufferId, to: Ownership) -> Result<BufferDescriptor> {
        let index = self.index;
        let desc = self
            .get_mut(id)
            .ok_or_else(|| AdapterError::protocol(format!("unknown {index} buffer {id}")))?;
        desc.transition(to)?;
        if to == Ownership::Adapter {
            desc.reset_trip();
        }
        Ok(desc.clone())
    }

    pub fn ids_owned_by(&self, owner: Ownership) -> Vec<BufferId> {
        self.buffers
            .iter()
            .filter(|b| b.is_owned_by(owner))
            .map(|b| b.id())
            .collect()
    }

    pub fn count_owned_by(&self, owner: Ownership) -> usize {
        self.buffers.iter().filter(|b| b.is_owned_by(owner)).count()
    }

    pub fn all_owned_by_adapter(&self) -> bool {
        self.buffers.iter().all(|b| b.is_owned_by(Ownership::Adapter))
    }

    /// First adapter-owned buffer that is not parked for a retry.
    pub fn first_idle(&self) -> Option<BufferId> {
        self.buffers
            .iter()
            .find(|b| b.is_owned_by(Ownership::Adapter) && !self.parked.contains(&b.id()))
            .map(|b| b.id())
    }

    /// Bring every buffer held by `owner` back to the adapter.
    pub fn reclaim_all(&mut self, owner: Ownership) -> Vec<BufferId> {
        let mut reclaimed = Vec::new();
        for desc in self.buffers.iter_mut().filter(|b| b.is_owned_by(owner)) {
            if desc.transition(Ownership::Adapter).is_ok() {
                desc.reset_trip();
                reclaimed.push(desc.id());
            }
        }
        reclaimed
    }

    /// Stamp the next submission sequence number on `id`.
    pub fn next_sequence(&mut self, id: BufferId) -> u64 {
        self.sequence += 1;
        let seq = self.sequence;
        if let Some(desc) = self.get_mut(id) {
            desc.sequence = seq;
        }
        seq
    }

    pub fn end_of_stream_seen(&self) -> bool {
        self.end_of_stream_seen
    }

    pub fn set_end_of_stream_seen(&mut self, seen: bool) {
        self.end_of_stream_seen = seen;
    }

    pub fn defer(&mut self, message: M) {
        self.deferred.push_back(message);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn take_deferred(&mut self) -> VecDeque<M> {
        std::mem::take(&mut self.deferred)
    }

    /// Remember a buffer whose submission was refused with `WouldBlock`.
    pub fn park(&mut self, id: BufferId) {
        if !self.parked.contains(&id) {
            self.parked.push_back(id);
        }
    }

    pub fn unpark(&mut self, id: BufferId) {
        self.parked.retain(|p| *p != id);
    }

    pub fn take_parked(&mut self) -> VecDeque<BufferId> {
        std::mem::take(&mut self.parked)
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Forget every parked buffer and wipe the flags it was parked with.
    pub fn clear_parked(&mut self) {
        for id in std::mem::take(&mut self.parked) {
            if let Some(desc) = self.get_mut(id) {
                desc.reset_trip();
            }
        }
    }
}

fn graphic_buffer(format: PortFormat, memory: SharedMemory) -> GraphicBuffer {
    match format.media {
        MediaFormat::Video {
            width,
            height,
            pixel_format,
        } => GraphicBuffer {
            width,
            height,
            pixel_format: Some(pixel_format),
            memory,
        },
        MediaFormat::Audio { .. } => GraphicBuffer {
            width: format.buffer_size as u32,
            height: 1,
            pixel_format: None,
            memory,
        },
    }
}

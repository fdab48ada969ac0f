//! Processing engine abstraction.
//!
//! The adapter talks to a processing engine only through [`EngineBinding`].
//! Two concrete realizations exist:
//!
//! | Binding | Description |
//! |---|---|
//! | [`SoftwareEngine`] | In-process PCM filter engine on a worker thread |
//! | [`RemoteEngine`] | Proxy to an [`EngineHost`] reached over a framed message link |
//!
//! Every call is non-blocking. Work that finishes later comes back as an
//! [`EngineEvent`] posted into the adapter inbox through [`EngineEvents`].

pub mod pipeline;
pub mod processor;
pub mod remote;
pub mod software;

pub use remote::{EngineHost, HostControl, RemoteEngine};
pub use software::SoftwareEngine;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    adapter::message::Message,
    buffer::{BufferDescriptor, BufferFlags, SharedMemory},
    common::{
        errors::{AdapterError, Result},
        types::{BufferId, EngineHandle, Generation},
    },
    format::{ParameterUpdate, PortFormat, PortFormats, StreamParams},
};

use self::pipeline::Completion;

// ─── Completion channel ──────────────────────────────────────────────────────

/// Asynchronous completion reported by an engine.
///
/// Buffer completions carry the generation stamped on the descriptor when it
/// was submitted so the adapter can discard those that predate a flush.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started,
    InputConsumed {
        id: BufferId,
        generation: Generation,
    },
    OutputFilled {
        id: BufferId,
        generation: Generation,
        len: usize,
        flags: BufferFlags,
        timestamp_us: u64,
    },
    /// The output buffer comes back unfilled because the output format changed.
    OutputFormatChanged {
        id: BufferId,
        generation: Generation,
        format: PortFormat,
    },
    /// The output buffer comes back unfilled (drain or format change).
    OutputReturned {
        id: BufferId,
        generation: Generation,
    },
    /// Every buffer the engine held is implicitly returned.
    FlushCompleted,
    /// Every buffer the engine held is implicitly returned and the engine idles.
    Stopped,
    Error(AdapterError),
}

/// Handle the engine uses to post completions into the adapter inbox.
#[derive(Clone)]
pub struct EngineEvents {
    tx: flume::Sender<Message>,
}

impl EngineEvents {
    pub fn new(tx: flume::Sender<Message>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the adapter is gone.
    pub fn post(&self, event: EngineEvent) -> bool {
        self.tx.send(Message::Engine(event)).is_ok()
    }

    /// Translate a pipeline completion, writing produced bytes into the
    /// matching output memory from `outputs`.
    pub(crate) fn deliver(
        &self,
        completion: Completion,
        outputs: &mut HashMap<BufferId, SharedMemory>,
    ) -> bool {
        let event = match completion {
            Completion::Started => EngineEvent::Started,
            Completion::InputConsumed { id, generation } => {
                EngineEvent::InputConsumed { id, generation }
            }
            Completion::OutputFilled {
                id,
                generation,
                data,
                flags,
                timestamp_us,
            } => {
                let len = data.len();
                if let Some(memory) = outputs.remove(&id) {
                    if let Err(e) = memory.write(&data) {
                        return self.post(EngineEvent::Error(e));
                    }
                }
                EngineEvent::OutputFilled {
                    id,
                    generation,
                    len,
                    flags,
                    timestamp_us,
                }
            }
            Completion::FormatChanged {
                id,
                generation,
                format,
            } => {
                outputs.remove(&id);
                EngineEvent::OutputFormatChanged {
                    id,
                    generation,
                    format,
                }
            }
            Completion::OutputReturned { id, generation } => {
                outputs.remove(&id);
                EngineEvent::OutputReturned { id, generation }
            }
            Completion::FlushCompleted => {
                outputs.clear();
                EngineEvent::FlushCompleted
            }
            Completion::Stopped => {
                outputs.clear();
                EngineEvent::Stopped
            }
            Completion::Error(e) => EngineEvent::Error(e),
        };
        self.post(event)
    }
}

// ─── EngineBinding trait ─────────────────────────────────────────────────────

/// Capability set the adapter drives.
///
/// Guarantees every realization gives:
/// - at most one completion per submitted buffer;
/// - completions on one port arrive in submission order;
/// - `flush` and `stop` always complete, returning every held buffer in bulk.
pub trait EngineBinding: Send {
    fn name(&self) -> &'static str;

    /// Bind a fresh engine instance that posts completions to `events`.
    fn allocate(&mut self, events: EngineEvents) -> Result<EngineHandle>;

    /// Accept stream parameters and report the resulting port formats.
    fn configure(&mut self, params: &StreamParams) -> Result<PortFormats>;

    /// Begin running. Completes with [`EngineEvent::Started`].
    fn start(&mut self) -> Result<()>;

    /// Hand a filled input buffer to the engine.
    fn submit_input(&mut self, buffer: BufferDescriptor) -> Result<()>;

    /// Hand an empty output buffer to the engine.
    fn request_output(&mut self, buffer: BufferDescriptor) -> Result<()>;

    /// Return every queued output buffer unfilled.
    fn drain_output(&mut self) -> Result<()>;

    /// Output format the engine will produce from now on. Calling this
    /// commits a pending format change.
    fn output_format(&mut self) -> Result<PortFormat>;

    fn set_parameters(&mut self, update: &ParameterUpdate) -> Result<()>;

    /// Drop all queued work. Completes with [`EngineEvent::FlushCompleted`].
    fn flush(&mut self) -> Result<()>;

    /// Drop all queued work and idle. Completes with [`EngineEvent::Stopped`].
    fn stop(&mut self) -> Result<()>;

    /// Tear the instance down. No events follow.
    fn release(&mut self) -> Result<()>;
}

/// Type-erased engine, selected once at construction time.
pub type BoxedEngine = Box<dyn EngineBinding>;

/// Buffer commands sent to an engine but not yet taken off its queue.
///
/// Engine queues are unbounded so control commands never wait. Buffer
/// submissions take a credit first and report `WouldBlock` once `depth`
/// of them are outstanding; whoever dequeues a buffer command gives the
/// credit back.
#[derive(Clone)]
pub(crate) struct QueueCredits {
    queued: Arc<AtomicUsize>,
    depth: usize,
}

impl QueueCredits {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            queued: Arc::new(AtomicUsize::new(0)),
            depth: depth.max(1),
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.depth).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

/// Map a closed worker queue onto the error the adapter latches.
pub(crate) fn worker_gone(name: &str) -> AdapterError {
    AdapterError::engine(format!("{name} worker is gone"))
}

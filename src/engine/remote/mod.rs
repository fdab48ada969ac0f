//! Out-of-process engine binding.
//!
//! [`RemoteEngine`] is a proxy: every call is marshalled into a [`wire`]
//! frame and sent to an [`EngineHost`]. Payload bytes travel inside the
//! frames, so the host never touches adapter memory. A dedicated link thread
//! unmarshals replies back into [`EngineEvent`](super::EngineEvent)s and
//! watches for the host disappearing.

pub mod host;
pub mod wire;

pub use host::{EngineHost, HostControl};

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{Level, debug, error, info, span, warn};

use crate::{
    buffer::{BufferDescriptor, SharedMemory},
    common::{
        errors::{AdapterError, Result},
        types::{BufferId, EngineHandle},
    },
    constants::REMOTE_LINK_DEPTH,
    engine::{
        EngineBinding, EngineEvent, EngineEvents, QueueCredits,
        pipeline::{InputJob, OutputSlot},
        processor::FormatTracker,
    },
    format::{ParameterUpdate, PortFormat, PortFormats, StreamParams},
};

use self::wire::{Frame, Opcode, Reply};

type OutputMap = Arc<Mutex<HashMap<BufferId, SharedMemory>>>;

struct Link {
    handle: EngineHandle,
    tx: Sender<String>,
    credits: QueueCredits,
    seq: u64,
    released: Arc<AtomicBool>,
    outputs: OutputMap,
    host: HostControl,
}

pub struct RemoteEngine {
    link_depth: usize,
    tracker: FormatTracker,
    link: Option<Link>,
    instances: u64,
}

impl RemoteEngine {
    pub fn new() -> Self {
        Self {
            link_depth: REMOTE_LINK_DEPTH,
            tracker: FormatTracker::default(),
            link: None,
            instances: 0,
        }
    }

    /// Buffer frames in flight to the host before submissions report `WouldBlock`.
    pub fn with_link_depth(mut self, depth: usize) -> Self {
        self.link_depth = depth.max(1);
        self
    }

    /// Control over the current host, if one is allocated.
    pub fn host(&self) -> Option<HostControl> {
        self.link.as_ref().map(|l| l.host.clone())
    }

    fn link(&mut self) -> Result<&mut Link> {
        self.link
            .as_mut()
            .ok_or_else(|| AdapterError::state("Unallocated", "engine call"))
    }

    /// Control frames are never refused for lack of room.
    fn call(&mut self, op: Opcode) -> Result<()> {
        let link = self.link()?;
        link.seq += 1;
        let text = wire::encode(link.seq, &op)?;
        link.tx.send(text).map_err(|_| host_died())
    }

    fn submit(&mut self, op: Opcode) -> Result<()> {
        let link = self.link()?;
        let text = wire::encode(link.seq + 1, &op)?;
        if !link.credits.try_acquire() {
            return Err(AdapterError::WouldBlock);
        }
        if link.tx.send(text).is_err() {
            link.credits.release();
            return Err(host_died());
        }
        link.seq += 1;
        Ok(())
    }
}

impl Default for RemoteEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn host_died() -> AdapterError {
    AdapterError::engine("engine host died")
}

impl EngineBinding for RemoteEngine {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn allocate(&mut self, events: EngineEvents) -> Result<EngineHandle> {
        if let Some(link) = &self.link {
            return Err(AdapterError::allocation(format!(
                "{} is already allocated",
                link.handle
            )));
        }

        self.instances += 1;
        let handle = EngineHandle(self.instances);
        let (req_tx, req_rx) = flume::unbounded();
        let credits = QueueCredits::new(self.link_depth);
        let (reply_tx, reply_rx) = flume::bounded(self.link_depth);

        let host = EngineHost::spawn(handle, req_rx, reply_tx)
            .map_err(|e| AdapterError::allocation(format!("cannot start engine host: {e}")))?;

        let released = Arc::new(AtomicBool::new(false));
        let outputs: OutputMap = Arc::new(Mutex::new(HashMap::new()));
        {
            let released = released.clone();
            let outputs = outputs.clone();
            let credits = credits.clone();
            thread::Builder::new()
                .name(format!("engine-link-{}", handle.0))
                .spawn(move || {
                    read_replies(handle, reply_rx, events, outputs, credits, released)
                })
                .map_err(|e| {
                    host.crash();
                    AdapterError::allocation(format!("cannot start link reader: {e}"))
                })?;
        }

        self.link = Some(Link {
            handle,
            tx: req_tx,
            credits,
            seq: 0,
            released,
            outputs,
            host,
        });
        self.call(Opcode::Allocate { handle })?;
        info!("remote engine {} allocated", handle);
        Ok(handle)
    }

    fn configure(&mut self, params: &StreamParams) -> Result<PortFormats> {
        self.link()?;
        let formats = self.tracker.configure(params)?;
        self.call(Opcode::Configure(params.clone()))?;
        Ok(formats)
    }

    fn start(&mut self) -> Result<()> {
        self.call(Opcode::Start)
    }

    fn submit_input(&mut self, buffer: BufferDescriptor) -> Result<()> {
        self.submit(Opcode::QueueInput(InputJob {
            id: buffer.id(),
            generation: buffer.generation,
            flags: buffer.flags,
            timestamp_us: buffer.timestamp_us,
            data: buffer.payload.memory().read(),
        }))
    }

    fn request_output(&mut self, buffer: BufferDescriptor) -> Result<()> {
        let memory = buffer.payload.memory().clone();
        let slot = OutputSlot {
            id: buffer.id(),
            generation: buffer.generation,
            capacity: memory.capacity(),
        };
        let outputs = self.link()?.outputs.clone();
        outputs.lock().insert(slot.id, memory);
        let sent = self.submit(Opcode::QueueOutput(slot));
        if sent.is_err() {
            outputs.lock().remove(&slot.id);
        }
        sent
    }

    fn drain_output(&mut self) -> Result<()> {
        self.call(Opcode::DrainOutput)
    }

    fn output_format(&mut self) -> Result<PortFormat> {
        let output = self.tracker.commit_output()?;
        self.call(Opcode::CommitOutputFormat)?;
        Ok(output)
    }

    fn set_parameters(&mut self, update: &ParameterUpdate) -> Result<()> {
        self.link()?;
        self.tracker.apply(update)?;
        self.call(Opcode::SetParameters(update.clone()))
    }

    fn flush(&mut self) -> Result<()> {
        self.call(Opcode::Flush)
    }

    fn stop(&mut self) -> Result<()> {
        self.call(Opcode::Stop)
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        self.tracker = FormatTracker::default();
        link.released.store(true, Ordering::Release);
        link.seq += 1;
        let delivered = match wire::encode(link.seq, &Opcode::Release) {
            Ok(text) => link.tx.send(text).is_ok(),
            Err(e) => {
                warn!("cannot encode release: {}", e);
                false
            }
        };
        if !delivered {
            warn!("remote engine {} was gone before release", link.handle);
        }
        info!("remote engine {} released", link.handle);
        Ok(())
    }
}

fn read_replies(
    handle: EngineHandle,
    replies: Receiver<String>,
    events: EngineEvents,
    outputs: OutputMap,
    credits: QueueCredits,
    released: Arc<AtomicBool>,
) {
    let _span = span!(Level::DEBUG, "engine_link", engine = %handle).entered();
    let mut last_seq = 0;

    while let Ok(text) = replies.recv() {
        let frame: Frame<Reply> = match wire::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping reply: {}", e);
                continue;
            }
        };
        if frame.seq < last_seq {
            warn!("reply {} arrived after {}", frame.seq, last_seq);
        }
        last_seq = frame.seq;

        let completion = match frame.body {
            Reply::Credit => {
                credits.release();
                continue;
            }
            Reply::Completion(completion) => completion,
        };
        let delivered = events.deliver(completion, &mut outputs.lock());
        if !delivered {
            debug!("adapter inbox closed");
            return;
        }
    }

    if released.load(Ordering::Acquire) {
        debug!("link closed after release");
    } else {
        error!("engine host {} died", handle);
        events.post(EngineEvent::Error(host_died()));
    }
}

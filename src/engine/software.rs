//! In-process engine: an [`EngineCore`] driven by a worker thread.

use std::{collections::HashMap, thread, time::Duration};

use flume::{Receiver, Sender};
use tracing::{Level, debug, info, span, warn};

use crate::{
    buffer::{BufferDescriptor, SharedMemory},
    common::{
        errors::{AdapterError, Result},
        types::{BufferId, EngineHandle},
    },
    constants::REMOTE_LINK_DEPTH,
    engine::{
        EngineBinding, EngineEvents, QueueCredits, worker_gone,
        pipeline::{Completion, EngineCore, InputJob, OutputSlot},
        processor::FormatTracker,
    },
    format::{ParameterUpdate, PortFormat, PortFormats, StreamParams},
};

enum Command {
    Configure(StreamParams),
    Start,
    QueueInput(InputJob),
    QueueOutput(OutputSlot, SharedMemory),
    DrainOutput,
    SetParameters(ParameterUpdate),
    CommitOutputFormat,
    Flush,
    Stop,
    Release,
}

struct Worker {
    tx: Sender<Command>,
    credits: QueueCredits,
    handle: EngineHandle,
}

pub struct SoftwareEngine {
    latency: Duration,
    queue_depth: usize,
    tracker: FormatTracker,
    worker: Option<Worker>,
    instances: u64,
}

impl SoftwareEngine {
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Engine that spends `latency` on every buffer it fills.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            queue_depth: REMOTE_LINK_DEPTH,
            tracker: FormatTracker::default(),
            worker: None,
            instances: 0,
        }
    }

    /// Buffer commands the worker queues before submissions report `WouldBlock`.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    fn worker(&self) -> Result<&Worker> {
        self.worker
            .as_ref()
            .ok_or_else(|| AdapterError::state("Unallocated", "engine call"))
    }

    /// Control commands are never refused for lack of room.
    fn control(&self, cmd: Command) -> Result<()> {
        let worker = self.worker()?;
        worker.tx.send(cmd).map_err(|_| worker_gone(self.name()))
    }

    fn submit(&self, cmd: Command) -> Result<()> {
        let worker = self.worker()?;
        if !worker.credits.try_acquire() {
            return Err(AdapterError::WouldBlock);
        }
        worker.tx.send(cmd).map_err(|_| {
            worker.credits.release();
            worker_gone(self.name())
        })
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBinding for SoftwareEngine {
    fn name(&self) -> &'static str {
        "software"
    }

    fn allocate(&mut self, events: EngineEvents) -> Result<EngineHandle> {
        if let Some(worker) = &self.worker {
            return Err(AdapterError::allocation(format!(
                "{} is already allocated",
                worker.handle
            )));
        }

        self.instances += 1;
        let handle = EngineHandle(self.instances);
        let (tx, rx) = flume::unbounded();
        let credits = QueueCredits::new(self.queue_depth);
        let latency = self.latency;

        {
            let credits = credits.clone();
            thread::Builder::new()
                .name(format!("engine-software-{}", handle.0))
                .spawn(move || run_worker(handle, rx, events, credits, latency))
                .map_err(|e| {
                    AdapterError::allocation(format!("cannot spawn engine worker: {e}"))
                })?;
        }

        info!("software engine {} allocated", handle);
        self.worker = Some(Worker {
            tx,
            credits,
            handle,
        });
        Ok(handle)
    }

    fn configure(&mut self, params: &StreamParams) -> Result<PortFormats> {
        self.worker()?;
        let formats = self.tracker.configure(params)?;
        self.control(Command::Configure(params.clone()))?;
        Ok(formats)
    }

    fn start(&mut self) -> Result<()> {
        self.control(Command::Start)
    }

    fn submit_input(&mut self, buffer: BufferDescriptor) -> Result<()> {
        let job = InputJob {
            id: buffer.id(),
            generation: buffer.generation,
            flags: buffer.flags,
            timestamp_us: buffer.timestamp_us,
            data: buffer.payload.memory().read(),
        };
        self.submit(Command::QueueInput(job))
    }

    fn request_output(&mut self, buffer: BufferDescriptor) -> Result<()> {
        let memory = buffer.payload.memory().clone();
        let slot = OutputSlot {
            id: buffer.id(),
            generation: buffer.generation,
            capacity: memory.capacity(),
        };
        self.submit(Command::QueueOutput(slot, memory))
    }

    fn drain_output(&mut self) -> Result<()> {
        self.control(Command::DrainOutput)
    }

    fn output_format(&mut self) -> Result<PortFormat> {
        let output = self.tracker.commit_output()?;
        self.control(Command::CommitOutputFormat)?;
        Ok(output)
    }

    fn set_parameters(&mut self, update: &ParameterUpdate) -> Result<()> {
        self.worker()?;
        self.tracker.apply(update)?;
        self.control(Command::SetParameters(update.clone()))
    }

    fn flush(&mut self) -> Result<()> {
        self.control(Command::Flush)
    }

    fn stop(&mut self) -> Result<()> {
        self.control(Command::Stop)
    }

    fn release(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.tracker = FormatTracker::default();
        if worker.tx.send(Command::Release).is_err() {
            warn!("software engine {} exited before release", worker.handle);
        }
        info!("software engine {} released", worker.handle);
        Ok(())
    }
}

fn run_worker(
    handle: EngineHandle,
    rx: Receiver<Command>,
    events: EngineEvents,
    credits: QueueCredits,
    latency: Duration,
) {
    let _span = span!(Level::DEBUG, "software_engine", engine = %handle).entered();

    let mut core = EngineCore::new();
    let mut outputs: HashMap<BufferId, SharedMemory> = HashMap::new();

    while let Ok(cmd) = rx.recv() {
        if matches!(cmd, Command::QueueInput(_) | Command::QueueOutput(..)) {
            credits.release();
        }
        let completions = match cmd {
            Command::Configure(params) => match core.configure(&params) {
                Ok(_) => Vec::new(),
                Err(e) => vec![Completion::Error(e)],
            },
            Command::Start => core.start(),
            Command::QueueInput(job) => core.queue_input(job),
            Command::QueueOutput(slot, memory) => {
                outputs.insert(slot.id, memory);
                core.queue_output(slot)
            }
            Command::DrainOutput => core.drain_output(),
            Command::SetParameters(update) => core.set_parameters(&update),
            Command::CommitOutputFormat => match core.commit_output_format() {
                Ok(_) => Vec::new(),
                Err(e) => vec![Completion::Error(e)],
            },
            Command::Flush => core.flush(),
            Command::Stop => core.stop(),
            Command::Release => break,
        };

        for completion in completions {
            if !latency.is_zero() && matches!(completion, Completion::OutputFilled { .. }) {
                thread::sleep(latency);
            }
            if !events.deliver(completion, &mut outputs) {
                debug!("adapter inbox closed, worker exiting");
                return;
            }
        }
    }

    debug!("software engine worker finished");
}

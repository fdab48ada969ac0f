//! The queueing core every engine realization runs on its own thread.
//!
//! Inputs and output slots are paired strictly in submission order. Each
//! call returns the completions it produced; the caller decides how they
//! travel back to the adapter (direct post, or a reply frame).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    buffer::BufferFlags,
    common::{
        errors::{AdapterError, Result},
        types::{BufferId, Generation},
    },
    engine::processor::{FormatTracker, Processor},
    format::{ParameterUpdate, PortFormat, PortFormats, StreamParams},
};

/// A filled input buffer as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputJob {
    pub id: BufferId,
    pub generation: Generation,
    pub flags: BufferFlags,
    pub timestamp_us: u64,
    pub data: Vec<u8>,
}

/// An empty output buffer waiting to be filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSlot {
    pub id: BufferId,
    pub generation: Generation,
    pub capacity: usize,
}

/// Result of one engine step, in the order the adapter must see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Completion {
    Started,
    InputConsumed {
        id: BufferId,
        generation: Generation,
    },
    OutputFilled {
        id: BufferId,
        generation: Generation,
        data: Vec<u8>,
        flags: BufferFlags,
        timestamp_us: u64,
    },
    FormatChanged {
        id: BufferId,
        generation: Generation,
        format: PortFormat,
    },
    OutputReturned {
        id: BufferId,
        generation: Generation,
    },
    FlushCompleted,
    Stopped,
    Error(AdapterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Loaded,
    Configured,
    Running,
    Stopped,
}

pub struct EngineCore {
    phase: Phase,
    tracker: FormatTracker,
    processor: Option<Processor>,
    inputs: VecDeque<InputJob>,
    outputs: VecDeque<OutputSlot>,
    /// Set once a format change has been reported and until it is committed.
    awaiting_reconfig: bool,
}

impl EngineCore {
    pub fn new() -> Self {
        Self {
            phase: Phase::Loaded,
            tracker: FormatTracker::default(),
            processor: None,
            inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            awaiting_reconfig: false,
        }
    }

    pub fn configure(&mut self, params: &StreamParams) -> Result<PortFormats> {
        if self.phase == Phase::Running {
            return Err(AdapterError::state("Running", "Configure"));
        }
        let formats = self.tracker.configure(params)?;
        self.processor = Some(Processor::new(formats, &params.tuning));
        self.inputs.clear();
        self.outputs.clear();
        self.awaiting_reconfig = false;
        self.phase = Phase::Configured;
        Ok(formats)
    }

    pub fn start(&mut self) -> Vec<Completion> {
        match self.phase {
            Phase::Configured | Phase::Stopped if self.processor.is_some() => {
                self.phase = Phase::Running;
                vec![Completion::Started]
            }
            Phase::Running => vec![Completion::Started],
            _ => vec![Completion::Error(AdapterError::state(
                format!("{:?}", self.phase),
                "Start",
            ))],
        }
    }

    pub fn queue_input(&mut self, job: InputJob) -> Vec<Completion> {
        if let Err(e) = self.ensure_running("QueueInput") {
            return vec![Completion::Error(e)];
        }
        self.inputs.push_back(job);
        self.pump()
    }

    pub fn queue_output(&mut self, slot: OutputSlot) -> Vec<Completion> {
        if let Err(e) = self.ensure_running("QueueOutput") {
            return vec![Completion::Error(e)];
        }
        self.outputs.push_back(slot);
        if self.tracker.output_changed() && !self.awaiting_reconfig {
            return self.report_format_change();
        }
        self.pump()
    }

    /// Return every queued output slot unfilled.
    pub fn drain_output(&mut self) -> Vec<Completion> {
        self.outputs
            .drain(..)
            .map(|s| Completion::OutputReturned {
                id: s.id,
                generation: s.generation,
            })
            .collect()
    }

    pub fn set_parameters(&mut self, update: &ParameterUpdate) -> Vec<Completion> {
        if let Err(e) = self.tracker.apply(update) {
            return vec![Completion::Error(e)];
        }
        let tuning = self.tracker.tuning();
        if let Some(processor) = self.processor.as_mut() {
            processor.retune(&tuning);
        }
        if self.tracker.output_changed() && !self.awaiting_reconfig && !self.outputs.is_empty() {
            return self.report_format_change();
        }
        Vec::new()
    }

    /// Adopt the pending output format and resume pairing.
    pub fn commit_output_format(&mut self) -> Result<PortFormat> {
        let output = self.tracker.commit_output()?;
        if let Some(processor) = self.processor.as_mut() {
            processor.set_output(output.media);
        }
        self.awaiting_reconfig = false;
        Ok(output)
    }

    /// Bulk reclaim: queued buffers are dropped without individual completions.
    pub fn flush(&mut self) -> Vec<Completion> {
        self.inputs.clear();
        self.outputs.clear();
        if let Some(processor) = self.processor.as_mut() {
            processor.reset();
        }
        vec![Completion::FlushCompleted]
    }

    pub fn stop(&mut self) -> Vec<Completion> {
        self.inputs.clear();
        self.outputs.clear();
        self.awaiting_reconfig = false;
        if self.phase != Phase::Loaded {
            self.phase = Phase::Stopped;
        }
        vec![Completion::Stopped]
    }

    pub fn queued(&self) -> (usize, usize) {
        (self.inputs.len(), self.outputs.len())
    }

    fn ensure_running(&self, op: &str) -> Result<()> {
        if self.phase == Phase::Running {
            Ok(())
        } else {
            Err(AdapterError::state(format!("{:?}", self.phase), op))
        }
    }

    fn report_format_change(&mut self) -> Vec<Completion> {
        let format = match self.tracker.pending_output() {
            Ok(format) => format,
            Err(e) => return vec![Completion::Error(e)],
        };
        self.awaiting_reconfig = true;

        let mut out = Vec::with_capacity(self.outputs.len());
        if let Some(first) = self.outputs.pop_front() {
            out.push(Completion::FormatChanged {
                id: first.id,
                generation: first.generation,
                format,
            });
        }
        out.extend(self.drain_output());
        out
    }

    fn pump(&mut self) -> Vec<Completion> {
        let mut out = Vec::new();
        let Some(processor) = self.processor.as_mut() else {
            return out;
        };

        while !self.awaiting_reconfig && !self.inputs.is_empty() && !self.outputs.is_empty() {
            let (Some(input), Some(slot)) = (self.inputs.pop_front(), self.outputs.pop_front())
            else {
                break;
            };

            let data = processor.process(&input.data, slot.capacity);
            out.push(Completion::InputConsumed {
                id: input.id,
                generation: input.generation,
            });
            out.push(Completion::OutputFilled {
                id: slot.id,
                generation: slot.generation,
                data,
                flags: input.flags,
                timestamp_us: input.timestamp_us,
            });
        }
        out
    }
}

impl Default for EngineCore {
    fn default() -> Self {
        Self::new()
    }
}

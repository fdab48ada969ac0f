//! Buffer circulation while streaming.
//!
//! Input buffers go Adapter -> UpstreamClient -> Adapter -> Engine -> Adapter.
//! Output buffers go Adapter -> Engine -> Adapter -> (DownstreamClient |
//! DisplaySurface) -> Adapter. Every hop is a call to `transition`, so the
//! ownership tag is the only record of who may touch a buffer.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{
    adapter::{
        machine::AdapterCore,
        message::{FillInfo, Notification, Request},
        state::{AdapterState, AdapterStats},
    },
    buffer::{BufferFlags, Ownership, Port},
    common::{
        errors::AdapterError,
        types::{BufferId, Generation, PortIndex},
    },
    constants::FENCE_CHECK_INTERVAL_MS,
};

/// Outcome of handing one buffer to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submission {
    Accepted,
    /// Refused with `WouldBlock`; the buffer is parked for a retry.
    Busy,
    /// The client has not signalled the buffer's fence yet; parked.
    Fenced,
    Failed,
}

impl AdapterCore {
    pub(super) fn port_mut(&mut self, index: PortIndex) -> &mut Port<Request> {
        match index {
            PortIndex::Input => &mut self.input,
            PortIndex::Output => &mut self.output,
        }
    }

    pub(super) fn handle_buffer_ack(&mut self, request: Request) {
        if !self.state.is_streaming() {
            self.notify(Notification::Error(AdapterError::state(
                self.state,
                request.name(),
            )));
            return;
        }
        match request {
            Request::BufferFilled { id, info } => self.on_buffer_filled(id, info),
            Request::BufferReleased { id } => self.on_buffer_released(id),
            other => debug!("[{}] {} is not a buffer ack", self.name, other.name()),
        }
    }

    fn on_buffer_filled(&mut self, id: BufferId, info: FillInfo) {
        let Some(desc) = self.input.get_mut(id) else {
            let err = AdapterError::protocol(format!("BufferFilled names unknown input buffer {id}"));
            self.notify(Notification::Error(err));
            return;
        };
        if !desc.is_owned_by(Ownership::UpstreamClient) {
            let err = AdapterError::State(format!(
                "BufferFilled for {} which is owned by {:?}",
                id,
                desc.ownership()
            ));
            self.notify(Notification::Error(err));
            return;
        }
        if let Err(e) = desc.transition(Ownership::Adapter) {
            self.notify(Notification::Error(e));
            return;
        }
        desc.flags = info.flags;
        desc.timestamp_us = info.timestamp_us;
        desc.fence = info.fence;

        if info.flags.end_of_stream {
            self.input_eos_submitted = true;
            self.input_eos_pending = false;
        }
        if self.pending_fatal.is_some() {
            debug!("[{}] holding {} after fatal error", self.name, id);
            return;
        }
        if self.input.parked_len() > 0 {
            // Earlier buffers are waiting on the engine; keep submission order.
            self.input.park(id);
            return;
        }
        self.submit(PortIndex::Input, id);
    }

    fn on_buffer_released(&mut self, id: BufferId) {
        let Some(desc) = self.output.get(id) else {
            let err = AdapterError::protocol(format!("BufferReleased names unknown output buffer {id}"));
            self.notify(Notification::Error(err));
            return;
        };
        if !desc.is_owned_by(Ownership::DownstreamClient) {
            let err = AdapterError::State(format!(
                "BufferReleased for {} which is owned by {:?}",
                id,
                desc.ownership()
            ));
            self.notify(Notification::Error(err));
            return;
        }
        if let Err(e) = self.output.transition(id, Ownership::Adapter) {
            self.notify(Notification::Error(e));
            return;
        }
        if self.state == AdapterState::OutputPortReconfiguring {
            self.check_reconfigure_progress();
        }
    }

    /// Hand `id` to the engine, stamped with the current generation.
    fn submit(&mut self, index: PortIndex, id: BufferId) -> Submission {
        let generation = self.generation;
        let port = self.port_mut(index);
        let fenced = port
            .get(id)
            .and_then(|d| d.fence.as_ref())
            .is_some_and(|f| !f.is_signalled());
        if fenced {
            port.park(id);
            if self.fence_check.is_none() {
                self.fence_check =
                    Some(Instant::now() + Duration::from_millis(FENCE_CHECK_INTERVAL_MS));
            }
            debug!("[{}] {} {} waits on its fence", self.name, index, id);
            return Submission::Fenced;
        }
        port.unpark(id);
        port.next_sequence(id);
        let Some(desc) = port.get_mut(id) else {
            return Submission::Failed;
        };
        desc.generation = generation;
        if let Err(e) = desc.transition(Ownership::Engine) {
            self.notify(Notification::Error(e));
            return Submission::Failed;
        }
        let snapshot = desc.clone();

        let result = match index {
            PortIndex::Input => self.engine.submit_input(snapshot),
            PortIndex::Output => self.engine.request_output(snapshot),
        };

        match result {
            Ok(()) => {
                let counter = match index {
                    PortIndex::Input => &self.stats.input_queued,
                    PortIndex::Output => &self.stats.output_queued,
                };
                AdapterStats::bump(counter);
                debug!("[{}] {} {} -> engine ({})", self.name, index, id, generation);
                Submission::Accepted
            }
            Err(AdapterError::WouldBlock) => {
                let port = self.port_mut(index);
                if let Some(desc) = port.get_mut(id) {
                    // Descriptor-level move keeps the fill flags for the retry.
                    let _ = desc.transition(Ownership::Adapter);
                }
                port.park(id);
                AdapterStats::bump(&self.stats.would_block);
                debug!("[{}] engine busy, parked {} {}", self.name, index, id);
                Submission::Busy
            }
            Err(e) => {
                let _ = self.port_mut(index).transition(id, Ownership::Adapter);
                self.fail(e);
                Submission::Failed
            }
        }
    }

    /// Retry parked buffers in the order they were refused. Returns `false`
    /// while the engine is still refusing work on this port.
    fn retry_parked(&mut self, index: PortIndex) -> bool {
        let mut parked = self.port_mut(index).take_parked();
        while let Some(id) = parked.pop_front() {
            let still_idle = self
                .port_mut(index)
                .get(id)
                .is_some_and(|d| d.is_owned_by(Ownership::Adapter));
            if !still_idle {
                continue;
            }
            match self.submit(index, id) {
                Submission::Accepted => {}
                Submission::Busy | Submission::Fenced => {
                    let port = self.port_mut(index);
                    for rest in parked {
                        port.park(rest);
                    }
                    return false;
                }
                Submission::Failed => return false,
            }
        }
        true
    }

    pub(super) fn kick_input(&mut self) {
        if !self.retry_parked(PortIndex::Input) {
            return;
        }
        if self.input_eos_pending {
            if let Some(id) = self.input.first_idle() {
                self.submit_end_of_input(id);
            }
            return;
        }
        if self.input_eos_submitted {
            return;
        }

        let generation = self.generation;
        while let Some(id) = self.input.first_idle() {
            if let Some(desc) = self.input.get_mut(id) {
                desc.generation = generation;
            }
            match self.input.transition(id, Ownership::UpstreamClient) {
                Ok(desc) => self.notify(Notification::FillThisBuffer(desc)),
                Err(e) => {
                    warn!("[{}] {}", self.name, e);
                    break;
                }
            }
        }
    }

    /// Keep every idle output buffer queued on the engine.
    pub(super) fn kick_output(&mut self) {
        if !self.retry_parked(PortIndex::Output) {
            return;
        }
        while let Some(id) = self.output.first_idle() {
            if self.submit(PortIndex::Output, id) != Submission::Accepted {
                break;
            }
        }
    }

    pub(super) fn signal_end_of_input(&mut self) {
        if self.input_eos_submitted || self.input_eos_pending {
            debug!("[{}] end of input already signalled", self.name);
            return;
        }
        let reclaimed = self.input.reclaim_all(Ownership::UpstreamClient);
        if !reclaimed.is_empty() {
            debug!(
                "[{}] took back {} unfilled input buffers for end of input",
                self.name,
                reclaimed.len()
            );
        }
        match self.input.first_idle() {
            Some(id) => self.submit_end_of_input(id),
            None => {
                debug!("[{}] end of input waits for a free input buffer", self.name);
                self.input_eos_pending = true;
            }
        }
    }

    /// Send `id` to the engine as an empty buffer carrying the EOS flag.
    fn submit_end_of_input(&mut self, id: BufferId) {
        if let Some(desc) = self.input.get_mut(id) {
            desc.payload.memory().clear();
            desc.flags = BufferFlags::EOS;
            desc.timestamp_us = 0;
            desc.fence = None;
        }
        self.input_eos_pending = false;
        self.input_eos_submitted = true;
        self.submit(PortIndex::Input, id);
    }

    /// Give back a buffer from a completion that must not be acted on.
    ///
    /// The buffer only returns if it is still on the trip the completion
    /// describes; a reissued buffer keeps its current owner.
    fn absorb(&mut self, index: PortIndex, id: BufferId, generation: Generation) {
        let port = self.port_mut(index);
        let on_that_trip = port
            .get(id)
            .is_some_and(|d| d.is_owned_by(Ownership::Engine) && d.generation == generation);
        if on_that_trip {
            let _ = port.transition(id, Ownership::Adapter);
        }
    }

    /// Common triage for buffer completions. Returns `true` when the
    /// completion is current and its buffer is engine owned.
    fn accept_completion(&mut self, index: PortIndex, id: BufferId, generation: Generation) -> bool {
        let Some(desc) = self.port(index).get(id) else {
            debug!("[{}] completion for unknown {} buffer {}", self.name, index, id);
            AdapterStats::bump(&self.stats.unknown_dropped);
            return false;
        };
        let owner = desc.ownership();

        if generation < self.generation {
            debug!(
                "[{}] stale completion for {} {} ({} < {})",
                self.name, index, id, generation, self.generation
            );
            AdapterStats::bump(&self.stats.stale_dropped);
            self.absorb(index, id, generation);
            return false;
        }
        if !self.state.is_streaming() || self.pending_fatal.is_some() {
            debug!("[{}] absorbing {} {} in {}", self.name, index, id, self.state);
            self.absorb(index, id, generation);
            return false;
        }
        if owner != Ownership::Engine {
            debug!(
                "[{}] duplicate completion for {} {} owned by {:?}",
                self.name, index, id, owner
            );
            AdapterStats::bump(&self.stats.unknown_dropped);
            return false;
        }
        true
    }

    pub(super) fn on_input_consumed(&mut self, id: BufferId, generation: Generation) {
        if !self.accept_completion(PortIndex::Input, id, generation) {
            return;
        }
        let end_of_stream = self
            .input
            .get(id)
            .is_some_and(|d| d.flags.end_of_stream);
        if let Err(e) = self.input.transition(id, Ownership::Adapter) {
            warn!("[{}] {}", self.name, e);
            return;
        }
        AdapterStats::bump(&self.stats.input_completed);

        if end_of_stream {
            debug!("[{}] engine consumed end of input", self.name);
            self.input.set_end_of_stream_seen(true);
            self.check_eos();
        }
    }

    pub(super) fn on_output_filled(
        &mut self,
        id: BufferId,
        generation: Generation,
        len: usize,
        flags: BufferFlags,
        timestamp_us: u64,
    ) {
        if !self.accept_completion(PortIndex::Output, id, generation) {
            return;
        }
        let Some(desc) = self.output.get_mut(id) else {
            return;
        };
        if let Err(e) = desc.transition(Ownership::Adapter) {
            warn!("[{}] {}", self.name, e);
            return;
        }
        desc.flags = flags;
        desc.timestamp_us = timestamp_us;
        desc.payload.memory().truncate(len);
        AdapterStats::bump(&self.stats.output_completed);

        if flags.end_of_stream {
            self.output.set_end_of_stream_seen(true);
        }
        self.deliver_output(id, flags);
        if flags.end_of_stream {
            self.check_eos();
        }
    }

    /// Pass a filled output buffer to the surface, or to the client when
    /// no surface is attached.
    fn deliver_output(&mut self, id: BufferId, flags: BufferFlags) {
        if let (true, Some(surface)) = (self.surface_attached, self.surface.as_mut()) {
            let desc = match self.output.transition(id, Ownership::DisplaySurface) {
                Ok(desc) => desc,
                Err(e) => {
                    warn!("[{}] {}", self.name, e);
                    return;
                }
            };
            if let Err(e) = surface.present(desc) {
                let _ = self.output.transition(id, Ownership::Adapter);
                self.fail(e);
            }
            return;
        }

        match self.output.transition(id, Ownership::DownstreamClient) {
            Ok(desc) => self.notify(Notification::DrainThisBuffer(desc, flags)),
            Err(e) => warn!("[{}] {}", self.name, e),
        }
    }

    pub(super) fn on_output_returned(&mut self, id: BufferId, generation: Generation) {
        if self.accept_completion(PortIndex::Output, id, generation) {
            let _ = self.output.transition(id, Ownership::Adapter);
        }
        if self.state == AdapterState::OutputPortReconfiguring {
            self.check_reconfigure_progress();
        }
    }

    pub(super) fn handle_surface_returned(&mut self, id: BufferId) {
        let held = self
            .output
            .get(id)
            .is_some_and(|d| d.is_owned_by(Ownership::DisplaySurface));
        if !held {
            debug!("[{}] surface returned {} which it does not hold", self.name, id);
            AdapterStats::bump(&self.stats.unknown_dropped);
            return;
        }
        if let Err(e) = self.output.transition(id, Ownership::Adapter) {
            warn!("[{}] {}", self.name, e);
            return;
        }
        debug!("[{}] surface recycled {}", self.name, id);

        match self.state {
            AdapterState::OutputPortReconfiguring => self.check_reconfigure_progress(),
            AdapterState::IdleToLoaded => self.check_shutdown_progress(),
            _ => {}
        }
    }

    /// Emit `EndOfStream` once both ports have seen it.
    pub(super) fn check_eos(&mut self) {
        if self.eos_notified
            || !self.input.end_of_stream_seen()
            || !self.output.end_of_stream_seen()
        {
            return;
        }
        self.eos_notified = true;
        self.notify(Notification::EndOfStream);
    }
}

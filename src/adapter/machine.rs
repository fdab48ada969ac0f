//! The adapter state machine.
//!
//! `AdapterCore` is driven one message at a time by the run loop in
//! [`super::Adapter`] (or directly by tests). It never blocks: work handed to
//! the engine or the display surface completes later as another message.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use tracing::{debug, error, info, warn};

use crate::{
    adapter::{
        message::{Message, Notification, Request},
        notifier::Notifier,
        state::{AdapterState, AdapterStats},
    },
    buffer::{BytePool, Port},
    common::{
        errors::{AdapterError, ErrorKind},
        types::{EngineHandle, Generation, PortIndex},
    },
    configs::AdapterConfig,
    engine::{BoxedEngine, EngineEvent},
    format::{PortFormat, PortFormats, StreamParams},
    surface::{BoxedSurface, SurfaceEvent},
};

/// Why the output port is being rebuilt.
pub(super) enum ReconfigReason {
    /// The engine reported a new output format.
    FormatChange(PortFormat),
    /// The client swapped the output sink; payload kind may change.
    SinkChange(Option<BoxedSurface>),
}

/// Bounded wait for the display surface during shutdown.
#[derive(Debug, Clone, Copy)]
pub(super) struct SurfacePoll {
    pub attempts: u32,
    pub deadline: Instant,
}

pub struct AdapterCore {
    pub(super) name: String,
    pub(super) config: AdapterConfig,
    pub(super) state: AdapterState,
    pub(super) shared_state: Arc<AtomicU8>,
    pub(super) stats: Arc<AdapterStats>,

    pub(super) engine: BoxedEngine,
    pub(super) engine_handle: Option<EngineHandle>,
    pub(super) surface: Option<BoxedSurface>,
    pub(super) surface_attached: bool,

    pub(super) inbox: flume::Sender<Message>,
    pub(super) notifier: Notifier,

    pub(super) input: Port<Request>,
    pub(super) output: Port<Request>,
    pub(super) pool: BytePool,
    pub(super) next_buffer_id: u32,

    pub(super) generation: Generation,
    pub(super) keep_engine_allocated: bool,
    pub(super) pending_fatal: Option<AdapterError>,
    /// Control requests that arrived while a transition was in flight.
    pub(super) pending: VecDeque<Request>,

    pub(super) params: Option<StreamParams>,
    pub(super) formats: Option<PortFormats>,
    pub(super) reconfig: Option<ReconfigReason>,
    /// Format change reported while flushing, acted on once the flush completes.
    pub(super) format_change_after_flush: Option<PortFormat>,

    pub(super) input_eos_pending: bool,
    pub(super) input_eos_submitted: bool,
    pub(super) eos_notified: bool,
    pub(super) surface_poll: Option<SurfacePoll>,
    /// Set while an input buffer waits on its fence.
    pub(super) fence_check: Option<Instant>,
}

impl AdapterCore {
    pub fn new(
        config: AdapterConfig,
        engine: BoxedEngine,
        inbox: flume::Sender<Message>,
        notifier: Notifier,
    ) -> Self {
        Self {
            name: config.name.clone(),
            config,
            state: AdapterState::Uninitialized,
            shared_state: Arc::new(AtomicU8::new(AdapterState::Uninitialized as u8)),
            stats: Arc::new(AdapterStats::default()),
            engine,
            engine_handle: None,
            surface: None,
            surface_attached: false,
            inbox,
            notifier,
            input: Port::new(PortIndex::Input),
            output: Port::new(PortIndex::Output),
            pool: BytePool::new(),
            next_buffer_id: 1,
            generation: Generation::default(),
            keep_engine_allocated: false,
            pending_fatal: None,
            pending: VecDeque::new(),
            params: None,
            formats: None,
            reconfig: None,
            format_change_after_flush: None,
            input_eos_pending: false,
            input_eos_submitted: false,
            eos_notified: false,
            surface_poll: None,
            fence_check: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn shared_state(&self) -> Arc<AtomicU8> {
        self.shared_state.clone()
    }

    pub fn stats(&self) -> Arc<AdapterStats> {
        self.stats.clone()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn pending_fatal(&self) -> Option<&AdapterError> {
        self.pending_fatal.as_ref()
    }

    pub fn port(&self, index: PortIndex) -> &Port<Request> {
        match index {
            PortIndex::Input => &self.input,
            PortIndex::Output => &self.output,
        }
    }

    /// When the run loop must deliver the next [`Message::SurfacePoll`].
    pub fn next_poll(&self) -> Option<Instant> {
        self.surface_poll.map(|p| p.deadline)
    }

    /// When the run loop must deliver the next [`Message::FenceCheck`].
    pub fn next_fence_check(&self) -> Option<Instant> {
        self.fence_check
    }

    /// Process one inbox message, then anything it unblocked.
    pub fn handle(&mut self, message: Message) {
        match message {
            Message::Request(request) => self.handle_request(request),
            Message::Engine(event) => self.handle_engine(event),
            Message::Surface(SurfaceEvent::Returned(id)) => self.handle_surface_returned(id),
            Message::SurfacePoll => self.poll_surface(),
            Message::FenceCheck => self.fence_check = None,
        }
        self.drain_pending();
        self.kick();
    }

    pub(super) fn set_state(&mut self, next: AdapterState) {
        if self.state != next {
            info!("[{}] {} -> {}", self.name, self.state, next);
            self.state = next;
            self.shared_state.store(next as u8, Ordering::Release);
        }
    }

    pub(super) fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }

    fn handle_request(&mut self, request: Request) {
        debug!("[{}] <- {:?} in {}", self.name, request, self.state);

        if request.is_buffer_ack() {
            self.handle_buffer_ack(request);
            return;
        }

        match self.state {
            AdapterState::OutputPortReconfiguring => {
                debug!("[{}] deferring {} until the output port is rebuilt", self.name, request.name());
                self.output.defer(request);
            }
            state if state.is_transient() => {
                debug!("[{}] queueing {} behind {}", self.name, request.name(), state);
                self.pending.push_back(request);
            }
            _ => self.dispatch_control(request),
        }
    }

    /// Execute a control request in a settled state.
    pub(super) fn dispatch_control(&mut self, request: Request) {
        if let Some(fatal) = &self.pending_fatal {
            if !matches!(request, Request::Shutdown { .. }) {
                let err = AdapterError::State(format!(
                    "{} rejected after fatal error ({})",
                    request.name(),
                    fatal
                ));
                self.notify(Notification::Error(err));
                return;
            }
        }

        use AdapterState as S;
        match (self.state, request) {
            (S::Uninitialized, Request::Allocate) => self.allocate(),
            (_, Request::Allocate) => {
                debug!("[{}] engine already allocated", self.name);
            }

            (S::Initialized | S::Configured, Request::Configure(params)) => self.configure(params),

            (_, Request::SetOutputSink(sink)) => self.set_output_sink(sink),

            (S::Configured, Request::Start) => self.start(),
            (S::Active, Request::Start) => {
                debug!("[{}] already active", self.name);
            }

            (S::Active, Request::Flush) => self.flush(),

            (S::Configured | S::Active, Request::SetParameters(update)) => {
                self.set_parameters(update)
            }

            (S::Active, Request::SignalEndOfInput) => self.signal_end_of_input(),

            (_, Request::Shutdown { keep_allocated }) => self.shutdown(keep_allocated),

            (state, request) => {
                self.notify(Notification::Error(AdapterError::state(state, request.name())));
            }
        }
    }

    /// Run queued control requests for as long as the state stays settled.
    fn drain_pending(&mut self) {
        while !self.state.is_transient() {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            self.dispatch_control(request);
        }
    }

    fn handle_engine(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Started => self.on_started(),
            EngineEvent::InputConsumed { id, generation } => self.on_input_consumed(id, generation),
            EngineEvent::OutputFilled {
                id,
                generation,
                len,
                flags,
                timestamp_us,
            } => self.on_output_filled(id, generation, len, flags, timestamp_us),
            EngineEvent::OutputFormatChanged {
                id,
                generation,
                format,
            } => self.on_output_format_changed(id, generation, format),
            EngineEvent::OutputReturned { id, generation } => {
                self.on_output_returned(id, generation)
            }
            EngineEvent::FlushCompleted => self.on_flush_completed(),
            EngineEvent::Stopped => self.on_stopped(),
            EngineEvent::Error(e) => self.on_engine_error(e),
        }
    }

    fn on_engine_error(&mut self, err: AdapterError) {
        if err.kind().is_benign() {
            debug!("[{}] engine busy", self.name);
            return;
        }

        match self.state {
            AdapterState::LoadedToActive => self.roll_back(err),
            AdapterState::ActiveToIdle => {
                self.report_once(err);
                self.enter_idle_to_loaded();
            }
            AdapterState::IdleToLoaded => self.report_once(err),
            AdapterState::Active
            | AdapterState::OutputPortReconfiguring
            | AdapterState::Flushing => self.fail(err),
            _ => self.notify(Notification::Error(err)),
        }
    }

    /// Report a failure raised while streaming.
    ///
    /// Engine and allocation faults in `Active` are latched: work stops on
    /// both ports and every later request except `Shutdown` is refused. The
    /// same faults during a flush or a reconfiguration roll back to
    /// `Initialized` instead. Anything else is reported and the state is
    /// left alone.
    pub(super) fn fail(&mut self, err: AdapterError) {
        let kind = err.kind();
        if kind.is_benign() {
            return;
        }
        if !kind.is_fatal_in_steady_state() {
            self.notify(Notification::Error(err));
            return;
        }
        if matches!(
            self.state,
            AdapterState::Flushing | AdapterState::OutputPortReconfiguring
        ) {
            return self.roll_back(err);
        }
        if self.pending_fatal.is_some() {
            warn!("[{}] further fault after latch: {}", self.name, err);
        } else {
            error!("[{}] fatal: {}", self.name, err);
            self.pending_fatal = Some(err.clone());
            self.notify(Notification::Error(err));
        }
    }

    /// Report an error unless it is the fault already latched.
    pub(super) fn report_once(&mut self, err: AdapterError) {
        if self.pending_fatal.as_ref() == Some(&err) {
            return;
        }
        if err.kind() == ErrorKind::WouldBlock {
            return;
        }
        self.notify(Notification::Error(err));
    }

    /// Hand idle buffers back out while streaming.
    fn kick(&mut self) {
        if self.pending_fatal.is_some() || !self.state.is_streaming() {
            return;
        }
        self.kick_input();
        if self.state == AdapterState::Active {
            self.kick_output();
        }
    }

    /// Best-effort cleanup when the run loop ends without a shutdown.
    pub fn close(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            surface.detach();
        }
        if self.engine_handle.take().is_some() {
            if let Err(e) = self.engine.release() {
                warn!("[{}] engine release on close failed: {}", self.name, e);
            }
        }
    }
}

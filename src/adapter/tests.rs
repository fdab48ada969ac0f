use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use proptest::prelude::*;

use super::{
    Adapter, AdapterCore, AdapterState, FillInfo, Message, Notification, Notifier, Request,
    StatsSnapshot,
};
use crate::{
    buffer::{BufferDescriptor, BufferFlags, Fence, Ownership},
    common::{
        errors::{AdapterError, ErrorKind},
        types::{BufferId, EngineHandle, Generation, PortIndex},
    },
    configs::{AdapterConfig, SurfaceConfig},
    engine::{
        EngineBinding, EngineEvent, EngineEvents, RemoteEngine, SoftwareEngine,
        processor::negotiate,
    },
    format::{MediaFormat, ParameterUpdate, PortFormat, PortFormats, StreamParams},
    surface::{BoxedSurface, DisplaySurface, FrameQueueSurface, Recycler, SurfaceEvent},
};

// ─── Scripted engine ─────────────────────────────────────────────────────────

/// What the engine double has been asked to do, and what it still holds.
#[derive(Default)]
struct Script {
    events: Option<EngineEvents>,
    calls: Vec<&'static str>,
    inputs: VecDeque<(BufferId, Generation, BufferFlags)>,
    outputs: VecDeque<(BufferId, Generation)>,
    /// Trips cut short by a flush or stop; tests replay them as late completions.
    dropped_inputs: Vec<(BufferId, Generation)>,
    dropped_outputs: Vec<(BufferId, Generation)>,
    /// Number of upcoming submissions refused with `WouldBlock`.
    busy: usize,
    fail_start: bool,
    auto_stop: bool,
    flush_pending: bool,
    next_output_format: Option<PortFormat>,
}

impl Script {
    fn post(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            events.post(event);
        }
    }

    fn position(&self, call: &str) -> Option<usize> {
        self.calls.iter().position(|c| *c == call)
    }
}

struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
    formats: Option<PortFormats>,
}

impl EngineBinding for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn allocate(&mut self, events: EngineEvents) -> crate::Result<EngineHandle> {
        let mut script = self.script.lock();
        script.calls.push("allocate");
        script.events = Some(events);
        Ok(EngineHandle(7))
    }

    fn configure(&mut self, params: &StreamParams) -> crate::Result<PortFormats> {
        self.script.lock().calls.push("configure");
        let formats = negotiate(params)?;
        self.formats = Some(formats);
        Ok(formats)
    }

    fn start(&mut self) -> crate::Result<()> {
        let mut script = self.script.lock();
        script.calls.push("start");
        if script.fail_start {
            return Err(AdapterError::engine("start refused"));
        }
        script.post(EngineEvent::Started);
        Ok(())
    }

    fn submit_input(&mut self, buffer: BufferDescriptor) -> crate::Result<()> {
        let mut script = self.script.lock();
        if script.busy > 0 {
            script.busy -= 1;
            return Err(AdapterError::WouldBlock);
        }
        script
            .inputs
            .push_back((buffer.id(), buffer.generation, buffer.flags));
        Ok(())
    }

    fn request_output(&mut self, buffer: BufferDescriptor) -> crate::Result<()> {
        let mut script = self.script.lock();
        if script.busy > 0 {
            script.busy -= 1;
            return Err(AdapterError::WouldBlock);
        }
        script.outputs.push_back((buffer.id(), buffer.generation));
        Ok(())
    }

    fn drain_output(&mut self) -> crate::Result<()> {
        let mut script = self.script.lock();
        script.calls.push("drain_output");
        while let Some((id, generation)) = script.outputs.pop_front() {
            script.post(EngineEvent::OutputReturned { id, generation });
        }
        Ok(())
    }

    fn output_format(&mut self) -> crate::Result<PortFormat> {
        let mut script = self.script.lock();
        script.calls.push("output_format");
        let current = self
            .formats
            .map(|f| f.output)
            .ok_or_else(|| AdapterError::state("Unconfigured", "output_format"))?;
        let format = script.next_output_format.take().unwrap_or(current);
        if let Some(formats) = self.formats.as_mut() {
            formats.output = format;
        }
        Ok(format)
    }

    fn set_parameters(&mut self, _update: &ParameterUpdate) -> crate::Result<()> {
        self.script.lock().calls.push("set_parameters");
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        let mut script = self.script.lock();
        script.calls.push("flush");
        drop_trips(&mut script);
        script.flush_pending = true;
        Ok(())
    }

    fn stop(&mut self) -> crate::Result<()> {
        let mut script = self.script.lock();
        script.calls.push("stop");
        drop_trips(&mut script);
        if script.auto_stop {
            script.post(EngineEvent::Stopped);
        }
        Ok(())
    }

    fn release(&mut self) -> crate::Result<()> {
        self.script.lock().calls.push("release");
        Ok(())
    }
}

fn drop_trips(script: &mut Script) {
    let inputs: Vec<_> = script.inputs.drain(..).map(|(id, g, _)| (id, g)).collect();
    let outputs: Vec<_> = script.outputs.drain(..).collect();
    script.dropped_inputs.extend(inputs);
    script.dropped_outputs.extend(outputs);
}

// ─── Recording surface ───────────────────────────────────────────────────────

#[derive(Default)]
struct SurfaceLog {
    attached: Vec<Vec<BufferId>>,
    presented: Vec<BufferId>,
    detached: usize,
}

struct RecordingSurface(Arc<Mutex<SurfaceLog>>);

impl RecordingSurface {
    fn boxed() -> (BoxedSurface, Arc<Mutex<SurfaceLog>>) {
        let log = Arc::new(Mutex::new(SurfaceLog::default()));
        let surface: BoxedSurface = Box::new(Self(log.clone()));
        (surface, log)
    }
}

impl DisplaySurface for RecordingSurface {
    fn name(&self) -> &str {
        "recording"
    }

    fn attach(&mut self, buffers: &[BufferDescriptor], _recycler: Recycler) -> crate::Result<()> {
        self.0
            .lock()
            .attached
            .push(buffers.iter().map(|b| b.id()).collect());
        Ok(())
    }

    fn present(&mut self, buffer: BufferDescriptor) -> crate::Result<()> {
        self.0.lock().presented.push(buffer.id());
        Ok(())
    }

    fn detach(&mut self) {
        self.0.lock().detached += 1;
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

fn test_config() -> AdapterConfig {
    AdapterConfig {
        name: "test".into(),
        surface_poll_interval_ms: 1,
        surface_poll_retries: 3,
        input_buffer_count: 2,
        output_buffer_count: 2,
    }
}

/// Drives an `AdapterCore` synchronously, pumping whatever the engine double
/// posts back into the inbox after every message.
struct Harness {
    core: AdapterCore,
    inbox: flume::Receiver<Message>,
    notifications: flume::Receiver<Notification>,
    script: Arc<Mutex<Script>>,
}

impl Harness {
    fn new() -> Self {
        let script = Arc::new(Mutex::new(Script {
            auto_stop: true,
            ..Default::default()
        }));
        let engine = ScriptedEngine {
            script: script.clone(),
            formats: None,
        };
        let (tx, inbox) = flume::unbounded();
        let (notifier, notifications) = Notifier::new("test");
        let core = AdapterCore::new(test_config(), Box::new(engine), tx, notifier);
        Self {
            core,
            inbox,
            notifications,
            script,
        }
    }

    fn deliver(&mut self, message: Message) {
        self.core.handle(message);
        self.pump();
    }

    fn pump(&mut self) {
        while let Ok(message) = self.inbox.try_recv() {
            self.core.handle(message);
        }
    }

    fn send(&mut self, request: Request) {
        self.deliver(Message::Request(request));
    }

    fn engine(&mut self, event: EngineEvent) {
        self.deliver(Message::Engine(event));
    }

    fn take(&self) -> Vec<Notification> {
        self.notifications.try_iter().collect()
    }

    fn names(&self) -> Vec<&'static str> {
        self.take().iter().map(|n| n.name()).collect()
    }

    /// Allocate, configure and start; returns the input buffers handed out.
    fn activate(&mut self) -> Vec<BufferDescriptor> {
        self.send(Request::Allocate);
        self.send(Request::Configure(StreamParams::default()));
        self.send(Request::Start);
        assert_eq!(self.core.state(), AdapterState::Active);
        self.take()
            .into_iter()
            .filter_map(|n| match n {
                Notification::FillThisBuffer(desc) => Some(desc),
                _ => None,
            })
            .collect()
    }

    fn fill(&mut self, id: BufferId) {
        self.send(Request::BufferFilled {
            id,
            info: FillInfo::default(),
        });
    }

    fn owner(&self, index: PortIndex, id: BufferId) -> Option<Ownership> {
        self.core.port(index).get(id).map(|d| d.ownership())
    }

    /// Complete the oldest input the engine holds.
    fn consume_input(&mut self) -> Option<BufferId> {
        let (id, generation, _) = self.script.lock().inputs.pop_front()?;
        self.engine(EngineEvent::InputConsumed { id, generation });
        Some(id)
    }

    /// Complete the oldest output the engine holds.
    fn fill_output(&mut self, flags: BufferFlags) -> Option<BufferId> {
        let (id, generation) = self.script.lock().outputs.pop_front()?;
        self.engine(EngineEvent::OutputFilled {
            id,
            generation,
            len: 0,
            flags,
            timestamp_us: 0,
        });
        Some(id)
    }

    fn stats(&self) -> StatsSnapshot {
        self.core.stats().snapshot()
    }
}

fn mono() -> PortFormat {
    PortFormat::new(
        MediaFormat::Audio {
            sample_rate: 48_000,
            channels: 1,
        },
        2,
    )
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn start_reaches_active_and_hands_out_buffers_once() {
    let mut h = Harness::new();
    h.send(Request::Allocate);
    h.send(Request::Configure(StreamParams::default()));
    assert_eq!(h.names(), vec!["Allocated", "Configured"]);

    h.send(Request::Start);
    assert_eq!(h.core.state(), AdapterState::Active);
    assert_eq!(h.names(), vec!["FillThisBuffer", "FillThisBuffer"]);
    assert_eq!(h.script.lock().outputs.len(), 2);
    assert_eq!(h.core.port(PortIndex::Input).count_owned_by(Ownership::UpstreamClient), 2);
    assert_eq!(h.core.port(PortIndex::Output).count_owned_by(Ownership::Engine), 2);
}

#[test]
fn requests_during_start_wait_for_the_engine() {
    let mut h = Harness::new();
    h.send(Request::Allocate);
    h.send(Request::Configure(StreamParams::default()));

    h.core.handle(Request::Start.into());
    assert_eq!(h.core.state(), AdapterState::LoadedToActive);
    h.core.handle(
        Request::SetParameters(ParameterUpdate {
            gain: Some(0.5),
            ..Default::default()
        })
        .into(),
    );
    assert!(h.script.lock().position("set_parameters").is_none());

    h.pump();
    assert_eq!(h.core.state(), AdapterState::Active);
    let script = h.script.lock();
    assert!(script.position("start") < script.position("set_parameters"));
}

#[test]
fn flush_absorbs_racing_completions() {
    let mut h = Harness::new();
    let fills = h.activate();
    for desc in &fills {
        h.fill(desc.id());
    }
    assert_eq!(h.script.lock().inputs.len(), 2);
    assert_eq!(h.script.lock().outputs.len(), 2);
    let before = h.core.generation();

    h.send(Request::Flush);
    assert_eq!(h.core.state(), AdapterState::Flushing);

    // The engine filled an output before it saw the flush.
    let (raced, raced_gen) = h.script.lock().dropped_outputs[0];
    h.engine(EngineEvent::OutputFilled {
        id: raced,
        generation: raced_gen,
        len: 0,
        flags: BufferFlags::default(),
        timestamp_us: 0,
    });
    assert_eq!(h.owner(PortIndex::Output, raced), Some(Ownership::Adapter));
    assert!(h.take().is_empty());

    h.engine(EngineEvent::FlushCompleted);
    assert_eq!(h.core.state(), AdapterState::Active);
    let after = h.core.generation();
    assert!(after > before);

    let notes = h.take();
    assert_eq!(notes[0].name(), "FlushCompleted");
    assert!(!notes.iter().any(|n| n.name() == "DrainThisBuffer"));

    // Every buffer came back and went out again in the new generation.
    for index in [PortIndex::Input, PortIndex::Output] {
        for desc in h.core.port(index).buffers() {
            assert_eq!(desc.generation, after, "{} {}", index, desc.id());
        }
    }

    // A completion from before the flush is still absorbed afterwards.
    let (late, late_gen) = h.script.lock().dropped_inputs[0];
    let owner = h.owner(PortIndex::Input, late);
    h.engine(EngineEvent::InputConsumed {
        id: late,
        generation: late_gen,
    });
    assert_eq!(h.owner(PortIndex::Input, late), owner);
    assert_eq!(h.stats().stale_dropped, 1);
    assert!(h.take().is_empty());
}

#[test]
fn format_change_waits_for_the_surface_then_replays() {
    let mut h = Harness::new();
    let (surface, log) = RecordingSurface::boxed();
    h.send(Request::SetOutputSink(Some(surface)));
    h.activate();

    let shown = h.fill_output(BufferFlags::default()).unwrap();
    assert_eq!(h.owner(PortIndex::Output, shown), Some(Ownership::DisplaySurface));
    assert_eq!(log.lock().presented, vec![shown]);

    let (other, generation) = h.script.lock().outputs.pop_front().unwrap();
    h.script.lock().next_output_format = Some(mono());
    h.engine(EngineEvent::OutputFormatChanged {
        id: other,
        generation,
        format: mono(),
    });
    assert_eq!(h.core.state(), AdapterState::OutputPortReconfiguring);

    h.send(Request::SetParameters(ParameterUpdate {
        gain: Some(0.5),
        ..Default::default()
    }));
    assert!(h.script.lock().position("set_parameters").is_none());
    assert!(h.core.port(PortIndex::Output).contains(shown));
    assert_eq!(h.core.port(PortIndex::Output).deferred_len(), 1);

    h.deliver(Message::Surface(SurfaceEvent::Returned(shown)));
    assert_eq!(h.core.state(), AdapterState::Active);
    assert!(!h.core.port(PortIndex::Output).contains(shown));
    assert_eq!(h.core.port(PortIndex::Output).format(), Some(mono()));

    let notes = h.take();
    assert!(notes
        .iter()
        .any(|n| matches!(n, Notification::OutputFormatChanged(f) if *f == mono())));
    let script = h.script.lock();
    assert!(script.position("output_format") < script.position("set_parameters"));
    assert_eq!(log.lock().attached.len(), 2);
    assert_eq!(h.stats().reconfigurations, 1);
}

#[test]
fn shutdown_keeping_the_engine_lands_in_initialized() {
    let mut h = Harness::new();
    h.activate();
    h.send(Request::Shutdown {
        keep_allocated: true,
    });
    assert_eq!(h.core.state(), AdapterState::Initialized);
    assert_eq!(h.names().last(), Some(&"ShutdownCompleted"));
    assert!(h.script.lock().position("release").is_none());
    assert!(!h.core.port(PortIndex::Input).is_allocated());

    // The kept engine can be configured again straight away.
    h.send(Request::Configure(StreamParams::default()));
    assert_eq!(h.core.state(), AdapterState::Configured);
}

#[test]
fn shutdown_releasing_the_engine_lands_in_uninitialized() {
    let mut h = Harness::new();
    h.activate();
    let before = h.core.generation();
    h.send(Request::Shutdown {
        keep_allocated: false,
    });
    assert_eq!(h.core.state(), AdapterState::Uninitialized);
    assert!(h.core.generation() > before);
    assert!(h.script.lock().position("release").is_some());
}

#[test]
fn engine_fault_leaves_only_shutdown() {
    let mut h = Harness::new();
    let fills = h.activate();
    h.engine(EngineEvent::Error(AdapterError::engine("dsp crashed")));

    let notes = h.take();
    assert!(matches!(&notes[..], [Notification::Error(AdapterError::Engine(_))]));
    assert!(h.core.pending_fatal().is_some());

    h.send(Request::Flush);
    assert_eq!(h.core.state(), AdapterState::Active);
    match h.take().as_slice() {
        [Notification::Error(e)] => assert_eq!(e.kind(), ErrorKind::State),
        other => panic!("unexpected {other:?}"),
    }

    // No new work reaches the engine.
    h.fill(fills[0].id());
    assert!(h.script.lock().inputs.is_empty());
    assert!(h.take().is_empty());

    h.send(Request::Shutdown {
        keep_allocated: false,
    });
    assert_eq!(h.core.state(), AdapterState::Uninitialized);
    assert_eq!(h.names(), vec!["ShutdownCompleted"]);
    assert!(h.core.pending_fatal().is_none());
}

// ─── Shutdown and the display surface ───────────────────────────────────────

#[test]
fn shutdown_force_reclaims_a_stuck_surface() {
    let mut h = Harness::new();
    let (surface, _log) = RecordingSurface::boxed();
    h.send(Request::SetOutputSink(Some(surface)));
    h.activate();
    h.fill_output(BufferFlags::default()).unwrap();

    h.send(Request::Shutdown {
        keep_allocated: false,
    });
    assert_eq!(h.core.state(), AdapterState::IdleToLoaded);
    assert!(h.core.next_poll().is_some());

    for _ in 0..3 {
        h.deliver(Message::SurfacePoll);
    }
    assert_eq!(h.core.state(), AdapterState::Uninitialized);
    assert!(h.core.next_poll().is_none());
    let notes = h.take();
    assert!(matches!(
        notes.first(),
        Some(Notification::Error(AdapterError::Surface(_)))
    ));
    assert_eq!(notes.last().map(|n| n.name()), Some("ShutdownCompleted"));
    assert_eq!(h.stats().surface_force_reclaimed, 1);
}

#[test]
fn shutdown_finishes_when_the_surface_returns() {
    let mut h = Harness::new();
    let (surface, log) = RecordingSurface::boxed();
    h.send(Request::SetOutputSink(Some(surface)));
    h.activate();
    let shown = h.fill_output(BufferFlags::default()).unwrap();

    h.send(Request::Shutdown {
        keep_allocated: true,
    });
    h.deliver(Message::SurfacePoll);
    assert_eq!(h.core.state(), AdapterState::IdleToLoaded);

    h.deliver(Message::Surface(SurfaceEvent::Returned(shown)));
    assert_eq!(h.core.state(), AdapterState::Initialized);
    assert_eq!(h.names(), vec!["ShutdownCompleted"]);
    assert_eq!(log.lock().detached, 1);
}

#[test]
fn shutdown_during_reconfiguration_runs_after_it() {
    let mut h = Harness::new();
    let (surface, _log) = RecordingSurface::boxed();
    h.send(Request::SetOutputSink(Some(surface)));
    h.activate();
    let shown = h.fill_output(BufferFlags::default()).unwrap();
    let (other, generation) = h.script.lock().outputs.pop_front().unwrap();
    h.engine(EngineEvent::OutputFormatChanged {
        id: other,
        generation,
        format: mono(),
    });

    h.send(Request::Shutdown {
        keep_allocated: false,
    });
    assert_eq!(h.core.state(), AdapterState::OutputPortReconfiguring);

    h.deliver(Message::Surface(SurfaceEvent::Returned(shown)));
    assert_eq!(h.core.state(), AdapterState::Uninitialized);
    let names = h.names();
    let changed = names.iter().position(|n| *n == "OutputFormatChanged");
    let done = names.iter().position(|n| *n == "ShutdownCompleted");
    assert!(changed.is_some() && changed < done);
}

// ─── Flow details ────────────────────────────────────────────────────────────

#[test]
fn busy_engine_parks_and_keeps_order() {
    let mut h = Harness::new();
    let fills = h.activate();
    h.script.lock().busy = 2;

    h.fill(fills[0].id());
    assert_eq!(h.owner(PortIndex::Input, fills[0].id()), Some(Ownership::Adapter));
    assert_eq!(h.core.port(PortIndex::Input).parked_len(), 1);

    h.fill(fills[1].id());
    let order: Vec<_> = h.script.lock().inputs.iter().map(|t| t.0).collect();
    assert_eq!(order, vec![fills[0].id(), fills[1].id()]);
    assert_eq!(h.stats().would_block, 2);
    assert_eq!(h.core.port(PortIndex::Input).parked_len(), 0);
}

#[test]
fn fenced_input_waits_for_the_client_signal() {
    let mut h = Harness::new();
    let fills = h.activate();
    let fence = Fence::new(1);
    h.send(Request::BufferFilled {
        id: fills[0].id(),
        info: FillInfo {
            fence: Some(fence.clone()),
            ..Default::default()
        },
    });
    h.fill(fills[1].id());

    // Neither buffer may pass the unsignalled one.
    assert!(h.script.lock().inputs.is_empty());
    assert_eq!(h.core.port(PortIndex::Input).parked_len(), 2);
    assert!(h.core.next_fence_check().is_some());

    h.deliver(Message::FenceCheck);
    assert!(h.script.lock().inputs.is_empty());
    assert!(h.core.next_fence_check().is_some());

    fence.signal();
    h.deliver(Message::FenceCheck);
    let order: Vec<_> = h.script.lock().inputs.iter().map(|t| t.0).collect();
    assert_eq!(order, vec![fills[0].id(), fills[1].id()]);
    assert!(h.core.next_fence_check().is_none());
    assert!(h.take().is_empty());
}

#[test]
fn fence_is_dropped_when_the_buffer_comes_back() {
    let mut h = Harness::new();
    let fills = h.activate();
    let id = fills[0].id();
    let fence = Fence::new(2);
    fence.signal();
    h.send(Request::BufferFilled {
        id,
        info: FillInfo {
            fence: Some(fence),
            ..Default::default()
        },
    });
    assert_eq!(h.owner(PortIndex::Input, id), Some(Ownership::Engine));

    assert_eq!(h.consume_input(), Some(id));
    let reissued = h
        .take()
        .into_iter()
        .find_map(|n| match n {
            Notification::FillThisBuffer(desc) if desc.id() == id => Some(desc),
            _ => None,
        })
        .unwrap();
    assert!(reissued.fence.is_none());
    assert!(h.core.port(PortIndex::Input).get(id).unwrap().fence.is_none());
}

#[test]
fn end_of_stream_is_reported_once() {
    let mut h = Harness::new();
    let fills = h.activate();
    h.fill(fills[0].id());

    h.send(Request::SignalEndOfInput);
    {
        let script = h.script.lock();
        assert_eq!(script.inputs.len(), 2);
        assert!(script.inputs[1].2.end_of_stream);
        assert_eq!(script.inputs[1].0, fills[1].id());
    }

    // The client lost that buffer when end of input was signalled.
    h.fill(fills[1].id());
    assert!(matches!(
        h.take().as_slice(),
        [Notification::Error(AdapterError::State(_))]
    ));

    h.send(Request::SignalEndOfInput);
    assert_eq!(h.script.lock().inputs.len(), 2);

    h.consume_input();
    h.consume_input();
    h.fill_output(BufferFlags::EOS);
    h.fill_output(BufferFlags::EOS);

    let names = h.names();
    assert_eq!(names.iter().filter(|n| **n == "EndOfStream").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "FillThisBuffer").count(), 0);
    let drain = names.iter().position(|n| *n == "DrainThisBuffer");
    let eos = names.iter().position(|n| *n == "EndOfStream");
    assert!(drain < eos);
}

#[test]
fn end_of_input_waits_for_a_free_buffer() {
    let mut h = Harness::new();
    let fills = h.activate();
    for desc in &fills {
        h.fill(desc.id());
    }
    h.send(Request::SignalEndOfInput);
    assert_eq!(h.script.lock().inputs.len(), 2);

    let freed = h.consume_input().unwrap();
    let script = h.script.lock();
    assert_eq!(script.inputs.back().map(|t| (t.0, t.2)), Some((freed, BufferFlags::EOS)));
}

#[test]
fn unknown_ids_and_bad_states_are_reported_not_fatal() {
    let mut h = Harness::new();
    h.send(Request::Start);
    assert_eq!(h.core.state(), AdapterState::Uninitialized);
    assert!(matches!(
        h.take().as_slice(),
        [Notification::Error(AdapterError::State(_))]
    ));

    h.activate();
    h.send(Request::BufferReleased { id: BufferId(999) });
    assert!(matches!(
        h.take().as_slice(),
        [Notification::Error(AdapterError::Protocol(_))]
    ));

    let generation = h.core.generation();
    h.engine(EngineEvent::InputConsumed {
        id: BufferId(999),
        generation,
    });
    assert!(h.take().is_empty());
    assert_eq!(h.stats().unknown_dropped, 1);
    assert!(h.core.pending_fatal().is_none());
    assert_eq!(h.core.state(), AdapterState::Active);
}

#[test]
fn failed_start_rolls_back_to_initialized() {
    let mut h = Harness::new();
    h.script.lock().fail_start = true;
    h.send(Request::Allocate);
    h.send(Request::Configure(StreamParams::default()));
    h.take();

    h.send(Request::Start);
    assert_eq!(h.core.state(), AdapterState::Initialized);
    assert!(matches!(
        h.take().as_slice(),
        [Notification::Error(AdapterError::Engine(_))]
    ));
    assert!(!h.core.port(PortIndex::Input).is_allocated());
    assert!(!h.core.port(PortIndex::Output).is_allocated());
}

#[test]
fn engine_fault_while_flushing_rolls_back_to_initialized() {
    let mut h = Harness::new();
    let fills = h.activate();
    for desc in &fills {
        h.fill(desc.id());
    }
    let before = h.core.generation();
    h.send(Request::Flush);
    assert_eq!(h.core.state(), AdapterState::Flushing);
    h.take();

    h.engine(EngineEvent::Error(AdapterError::engine("dsp crashed")));
    assert_eq!(h.core.state(), AdapterState::Initialized);
    assert!(h.core.pending_fatal().is_none());
    assert!(h.core.generation() > before);
    assert!(matches!(
        h.take().as_slice(),
        [Notification::Error(AdapterError::Engine(_))]
    ));
    assert!(!h.core.port(PortIndex::Input).is_allocated());
    assert!(!h.core.port(PortIndex::Output).is_allocated());

    // The flush the engine never finished is ignored when it does.
    h.engine(EngineEvent::FlushCompleted);
    assert_eq!(h.core.state(), AdapterState::Initialized);
    assert!(h.take().is_empty());

    h.send(Request::Configure(StreamParams::default()));
    h.send(Request::Start);
    assert_eq!(h.core.state(), AdapterState::Active);
    let names = h.names();
    assert_eq!(names[0], "Configured");
    assert!(names.iter().all(|n| *n != "Error"));
}

#[test]
fn engine_fault_while_reconfiguring_rolls_back_to_initialized() {
    let mut h = Harness::new();
    let (surface, log) = RecordingSurface::boxed();
    h.send(Request::SetOutputSink(Some(surface)));
    h.activate();
    h.fill_output(BufferFlags::default()).unwrap();
    let (other, generation) = h.script.lock().outputs.pop_front().unwrap();
    h.engine(EngineEvent::OutputFormatChanged {
        id: other,
        generation,
        format: mono(),
    });
    assert_eq!(h.core.state(), AdapterState::OutputPortReconfiguring);
    h.send(Request::SetParameters(ParameterUpdate {
        gain: Some(0.5),
        ..Default::default()
    }));
    h.take();

    h.engine(EngineEvent::Error(AdapterError::engine("dsp crashed")));
    assert_eq!(h.core.state(), AdapterState::Initialized);
    assert!(h.core.pending_fatal().is_none());
    assert_eq!(log.lock().detached, 1);
    assert_eq!(h.core.port(PortIndex::Output).deferred_len(), 0);

    // The deferred request runs once the state settles and is refused there.
    match h.take().as_slice() {
        [Notification::Error(AdapterError::Engine(_)), Notification::Error(e)] => {
            assert_eq!(e.kind(), ErrorKind::State)
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.script.lock().position("set_parameters").is_none());

    // The same surface is attached again on the next start.
    h.send(Request::Configure(StreamParams::default()));
    h.send(Request::Start);
    assert_eq!(h.core.state(), AdapterState::Active);
    assert_eq!(log.lock().attached.len(), 2);
}

#[test]
fn sink_change_rebuilds_without_format_notification() {
    let mut h = Harness::new();
    h.activate();
    let old: Vec<_> = h.core.port(PortIndex::Output).buffers().iter().map(|b| b.id()).collect();

    let (surface, log) = RecordingSurface::boxed();
    h.send(Request::SetOutputSink(Some(surface)));
    assert_eq!(h.core.state(), AdapterState::Active);
    assert!(h.take().iter().all(|n| n.name() != "OutputFormatChanged"));
    assert_eq!(h.stats().reconfigurations, 1);

    let attached = log.lock().attached.clone();
    assert_eq!(attached.len(), 1);
    assert!(attached[0].iter().all(|id| !old.contains(id)));
    assert!(h.core.port(PortIndex::Output).buffers().iter().all(|b| b.payload.is_graphic()));

    let shown = h.fill_output(BufferFlags::default()).unwrap();
    assert_eq!(log.lock().presented, vec![shown]);
}

#[test]
fn format_change_during_flush_is_applied_after_it() {
    let mut h = Harness::new();
    h.activate();
    h.send(Request::Flush);
    let (id, generation) = h.script.lock().dropped_outputs[0];
    h.engine(EngineEvent::OutputFormatChanged {
        id,
        generation,
        format: mono(),
    });
    assert_eq!(h.core.state(), AdapterState::Flushing);

    h.script.lock().next_output_format = Some(mono());
    h.engine(EngineEvent::FlushCompleted);
    assert_eq!(h.core.state(), AdapterState::Active);
    let names = h.names();
    assert_eq!(&names[..2], &["FlushCompleted", "OutputFormatChanged"]);
    assert_eq!(h.core.port(PortIndex::Output).format(), Some(mono()));
}

#[test]
fn requests_queued_while_flushing_run_in_order() {
    let mut h = Harness::new();
    h.activate();
    h.send(Request::Flush);
    h.send(Request::SetParameters(ParameterUpdate {
        gain: Some(0.2),
        ..Default::default()
    }));
    h.send(Request::Flush);
    assert_eq!(h.script.lock().calls.iter().filter(|c| **c == "flush").count(), 1);

    h.engine(EngineEvent::FlushCompleted);
    // Parameters first, then the second flush.
    assert_eq!(h.core.state(), AdapterState::Flushing);
    let script = h.script.lock();
    let params = script.position("set_parameters").unwrap();
    let second_flush = script.calls.iter().rposition(|c| *c == "flush").unwrap();
    assert!(params < second_flush);
}

// ─── Properties ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Step {
    FillInput,
    ReleaseOutput,
    ConsumeInput,
    FillOutput { eos: bool },
    Flush,
    CompleteFlush,
    ReplayDropped,
    SignalEndOfInput,
    Busy,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::FillInput),
        3 => Just(Step::ReleaseOutput),
        3 => Just(Step::ConsumeInput),
        3 => any::<bool>().prop_map(|eos| Step::FillOutput { eos }),
        1 => Just(Step::Flush),
        2 => Just(Step::CompleteFlush),
        2 => Just(Step::ReplayDropped),
        1 => Just(Step::SignalEndOfInput),
        1 => Just(Step::Busy),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn interleavings_keep_ownership_generation_and_delivery(steps in prop::collection::vec(step(), 1..80)) {
        let mut h = Harness::new();
        let mut client_inputs: Vec<BufferId> = h.activate().iter().map(|d| d.id()).collect();
        let mut client_outputs: Vec<BufferId> = Vec::new();
        let mut last_generation = h.core.generation();
        let mut flush_generation = None;
        let mut eos_seen = 0;

        for step in steps {
            let active = h.core.state() == AdapterState::Active;
            match step {
                Step::FillInput => {
                    if let Some(id) = client_inputs.pop() {
                        h.fill(id);
                    }
                }
                Step::ReleaseOutput => {
                    if let Some(id) = client_outputs.pop() {
                        h.send(Request::BufferReleased { id });
                    }
                }
                Step::ConsumeInput => {
                    h.consume_input();
                }
                Step::FillOutput { eos } => {
                    let flags = if eos { BufferFlags::EOS } else { BufferFlags::default() };
                    h.fill_output(flags);
                }
                Step::Flush if active => {
                    client_inputs.clear();
                    client_outputs.clear();
                    flush_generation = Some(h.core.generation());
                    h.send(Request::Flush);
                }
                Step::CompleteFlush => {
                    let pending = std::mem::take(&mut h.script.lock().flush_pending);
                    if pending {
                        h.engine(EngineEvent::FlushCompleted);
                    }
                }
                Step::ReplayDropped => {
                    let input = h.script.lock().dropped_inputs.pop();
                    if let Some((id, generation)) = input {
                        h.engine(EngineEvent::InputConsumed { id, generation });
                    }
                    let output = h.script.lock().dropped_outputs.pop();
                    if let Some((id, generation)) = output {
                        h.engine(EngineEvent::OutputFilled {
                            id,
                            generation,
                            len: 0,
                            flags: BufferFlags::default(),
                            timestamp_us: 0,
                        });
                    }
                }
                Step::SignalEndOfInput if active => {
                    client_inputs.clear();
                    h.send(Request::SignalEndOfInput);
                }
                Step::Busy => h.script.lock().busy += 1,
                Step::Flush | Step::SignalEndOfInput => {}
            }

            let generation = h.core.generation();
            for note in h.take() {
                match note {
                    Notification::FillThisBuffer(desc) => {
                        prop_assert!(!client_inputs.contains(&desc.id()));
                        prop_assert_eq!(desc.generation, generation);
                        client_inputs.push(desc.id());
                    }
                    Notification::DrainThisBuffer(desc, _) => {
                        prop_assert!(!client_outputs.contains(&desc.id()));
                        prop_assert_eq!(desc.generation, generation);
                        client_outputs.push(desc.id());
                    }
                    Notification::FlushCompleted => {
                        let started = flush_generation.take();
                        prop_assert!(started.is_some_and(|g| generation > g));
                        eos_seen = 0;
                    }
                    Notification::EndOfStream => {
                        eos_seen += 1;
                        prop_assert_eq!(eos_seen, 1);
                    }
                    Notification::Error(e) => prop_assert!(false, "unexpected error {}", e),
                    _ => {}
                }
            }

            prop_assert!(generation >= last_generation);
            last_generation = generation;

            // The client holds exactly what it was handed and has not returned.
            let input = h.core.port(PortIndex::Input);
            let output = h.core.port(PortIndex::Output);
            prop_assert_eq!(input.count_owned_by(Ownership::UpstreamClient), client_inputs.len());
            prop_assert_eq!(output.count_owned_by(Ownership::DownstreamClient), client_outputs.len());
            for id in &client_inputs {
                prop_assert_eq!(input.get(*id).map(|d| d.ownership()), Some(Ownership::UpstreamClient));
            }
            for id in &client_outputs {
                prop_assert_eq!(output.get(*id).map(|d| d.ownership()), Some(Ownership::DownstreamClient));
            }

            // Outside a flush the engine holds exactly the engine-owned buffers.
            if h.core.state() == AdapterState::Active {
                let script = h.script.lock();
                let mut engine_inputs: Vec<_> = script.inputs.iter().map(|t| t.0).collect();
                let mut owned = input.ids_owned_by(Ownership::Engine);
                engine_inputs.sort();
                owned.sort();
                prop_assert_eq!(engine_inputs, owned);

                let mut engine_outputs: Vec<_> = script.outputs.iter().map(|t| t.0).collect();
                let mut owned = output.ids_owned_by(Ownership::Engine);
                engine_outputs.sort();
                owned.sort();
                prop_assert_eq!(engine_outputs, owned);
            }
        }
    }
}

// ─── End to end ──────────────────────────────────────────────────────────────

async fn next(adapter: &Adapter) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), adapter.next_notification())
        .await
        .expect("adapter went quiet")
        .expect("adapter closed")
}

async fn wait_for(adapter: &Adapter, name: &str) {
    loop {
        let note = next(adapter).await;
        if let Notification::Error(e) = &note {
            panic!("unexpected error {e}");
        }
        if note.name() == name {
            return;
        }
    }
}

/// Feed `frames` input buffers, signal end of input and drain until
/// `EndOfStream`. Returns the number of output buffers the client saw.
async fn stream(adapter: &Adapter, frames: u64) -> usize {
    adapter.allocate().unwrap();
    adapter.configure(StreamParams::default()).unwrap();
    adapter.start().unwrap();

    let mut fed = 0;
    let mut drained = 0;
    loop {
        match next(adapter).await {
            Notification::FillThisBuffer(desc) if fed < frames => {
                let memory = desc.payload.memory();
                memory.write(&vec![0x20; memory.capacity()]).unwrap();
                fed += 1;
                adapter
                    .buffer_filled(
                        desc.id(),
                        FillInfo {
                            timestamp_us: fed * 20_000,
                            ..Default::default()
                        },
                    )
                    .unwrap();
                if fed == frames {
                    adapter.signal_end_of_input().unwrap();
                }
            }
            Notification::DrainThisBuffer(desc, _) => {
                drained += 1;
                adapter.buffer_released(desc.id()).unwrap();
            }
            Notification::EndOfStream => return drained,
            Notification::Error(e) => panic!("unexpected error {e}"),
            _ => {}
        }
    }
}

#[tokio::test]
async fn software_engine_streams_to_end_of_stream() {
    let adapter = Adapter::spawn(test_config(), Box::new(SoftwareEngine::new()));
    let drained = stream(&adapter, 6).await;
    assert!(drained >= 6, "drained {drained}");
    assert_eq!(adapter.state(), AdapterState::Active);

    adapter.shutdown(false).unwrap();
    wait_for(&adapter, "ShutdownCompleted").await;
    assert_eq!(adapter.state(), AdapterState::Uninitialized);
    assert!(adapter.stats().input_completed >= 6);
    adapter.close().await;
}

#[tokio::test]
async fn remote_engine_streams_to_end_of_stream() {
    let adapter = Adapter::spawn(test_config(), Box::new(RemoteEngine::new()));
    let drained = stream(&adapter, 4).await;
    assert!(drained >= 4, "drained {drained}");

    adapter.shutdown(true).unwrap();
    wait_for(&adapter, "ShutdownCompleted").await;
    assert_eq!(adapter.state(), AdapterState::Initialized);
    adapter.close().await;
}

#[tokio::test]
async fn frame_queue_surface_recycles_through_the_adapter() {
    let surface = FrameQueueSurface::new(&SurfaceConfig {
        enabled: true,
        present_interval_ms: 1,
        queue_depth: 4,
    });
    let control = surface.control();

    let adapter = Adapter::spawn(test_config(), Box::new(SoftwareEngine::new()));
    adapter.set_output_sink(Some(Box::new(surface))).unwrap();
    let drained = stream(&adapter, 5).await;
    assert_eq!(drained, 0);

    adapter.shutdown(false).unwrap();
    wait_for(&adapter, "ShutdownCompleted").await;
    // Shutdown waited for every presented buffer to come back.
    assert!(control.presented() >= 5);
    assert_eq!(control.held(), 0);
    assert_eq!(adapter.stats().surface_force_reclaimed, 0);
    adapter.close().await;
}

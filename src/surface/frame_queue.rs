use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::{
    buffer::BufferDescriptor,
    common::{
        errors::{AdapterError, Result},
        types::BufferId,
    },
    configs::SurfaceConfig,
};

use super::{DisplaySurface, Recycler};

/// Knobs shared with the presentation thread.
#[derive(Clone, Default)]
pub struct SurfaceControl {
    stalled: Arc<AtomicBool>,
    held: Arc<AtomicUsize>,
    presented: Arc<AtomicU64>,
}

impl SurfaceControl {
    /// While stalled the surface keeps every buffer it is given.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    /// Buffers currently on the surface.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Buffers shown since creation.
    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }
}

/// Bounded presentation queue: each buffer is shown for one present
/// interval and then recycled, oldest first.
pub struct FrameQueueSurface {
    interval: Duration,
    depth: usize,
    control: SurfaceControl,
    attached: HashSet<BufferId>,
    queue: Option<Sender<BufferId>>,
    epochs: u64,
}

impl FrameQueueSurface {
    pub fn new(config: &SurfaceConfig) -> Self {
        Self {
            interval: config.present_interval(),
            depth: config.queue_depth.max(1),
            control: SurfaceControl::default(),
            attached: HashSet::new(),
            queue: None,
            epochs: 0,
        }
    }

    pub fn control(&self) -> SurfaceControl {
        self.control.clone()
    }
}

impl DisplaySurface for FrameQueueSurface {
    fn name(&self) -> &str {
        "frame-queue"
    }

    fn attach(&mut self, buffers: &[BufferDescriptor], recycler: Recycler) -> Result<()> {
        self.detach();

        self.epochs += 1;
        let (tx, rx) = flume::unbounded();
        let control = self.control.clone();
        let interval = self.interval;
        thread::Builder::new()
            .name(format!("surface-present-{}", self.epochs))
            .spawn(move || present_loop(rx, recycler, control, interval))
            .map_err(|e| AdapterError::surface(format!("cannot start presentation: {e}")))?;

        self.attached = buffers.iter().map(|b| b.id()).collect();
        self.queue = Some(tx);
        info!(
            "surface attached {} buffers (epoch {})",
            self.attached.len(),
            self.epochs
        );
        Ok(())
    }

    fn present(&mut self, buffer: BufferDescriptor) -> Result<()> {
        let id = buffer.id();
        if !self.attached.contains(&id) {
            return Err(AdapterError::surface(format!("buffer {id} is not attached")));
        }
        if self.control.held() >= self.depth {
            return Err(AdapterError::surface(format!(
                "presentation queue full ({} buffers)",
                self.depth
            )));
        }
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| AdapterError::surface("surface is detached"))?;

        self.control.held.fetch_add(1, Ordering::AcqRel);
        if queue.send(id).is_err() {
            self.control.held.fetch_sub(1, Ordering::AcqRel);
            return Err(AdapterError::surface("presentation thread is gone"));
        }
        Ok(())
    }

    fn detach(&mut self) {
        if self.queue.take().is_some() {
            debug!("surface detached (epoch {})", self.epochs);
        }
        self.attached.clear();
        self.control.held.store(0, Ordering::Release);
    }
}

impl Drop for FrameQueueSurface {
    fn drop(&mut self) {
        self.detach();
    }
}

fn present_loop(
    rx: Receiver<BufferId>,
    recycler: Recycler,
    control: SurfaceControl,
    interval: Duration,
) {
    let mut on_screen: VecDeque<BufferId> = VecDeque::new();
    let tick = interval.max(Duration::from_millis(1));

    loop {
        match rx.recv_timeout(tick) {
            Ok(id) => {
                control.presented.fetch_add(1, Ordering::Relaxed);
                on_screen.push_back(id);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        if control.is_stalled() {
            continue;
        }

        while let Some(id) = on_screen.pop_front() {
            thread::sleep(interval);
            if rx.is_disconnected() {
                // Detached: the adapter already took these buffers back.
                return;
            }
            let _ = control
                .held
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| h.checked_sub(1));
            if !recycler.returned(id) {
                return;
            }
        }
    }
}

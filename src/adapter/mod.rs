//! The stream processing adapter.
//!
//! [`Adapter`] is the client handle. It owns a tokio task that feeds every
//! inbox message (client requests, engine completions, surface recycles and
//! poll ticks) one at a time into an [`AdapterCore`]. The core is plain
//! synchronous code, which is also how the tests drive it.

pub mod message;
pub mod notifier;
pub mod state;

mod flow;
mod lifecycle;
mod machine;
mod reconfigure;

#[cfg(test)]
mod tests;

pub use self::machine::AdapterCore;
pub use message::{FillInfo, Message, Notification, Request};
pub use notifier::Notifier;
pub use state::{AdapterState, AdapterStats, StatsSnapshot};

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

use flume::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, span};

use crate::{
    common::{
        errors::{AdapterError, Result},
        types::BufferId,
    },
    configs::AdapterConfig,
    engine::BoxedEngine,
    format::{ParameterUpdate, StreamParams},
    surface::BoxedSurface,
};

/// Client handle to a running adapter. Dropping it stops the loop and
/// releases the engine.
pub struct Adapter {
    name: String,
    inbox: Sender<Message>,
    notifications: Receiver<Notification>,
    state: Arc<AtomicU8>,
    stats: Arc<AdapterStats>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl Adapter {
    /// Start the adapter loop on the current tokio runtime.
    pub fn spawn(config: AdapterConfig, engine: BoxedEngine) -> Self {
        let name = config.name.clone();
        let (inbox, rx) = flume::unbounded();
        let (notifier, notifications) = Notifier::new(name.clone());
        let core = AdapterCore::new(config, engine, inbox.clone(), notifier);
        let state = core.shared_state();
        let stats = core.stats();
        let cancel_token = CancellationToken::new();

        let span = span!(Level::DEBUG, "adapter", name = %name);
        let task = tokio::spawn(run(core, rx, cancel_token.clone()).instrument(span));

        Self {
            name,
            inbox,
            notifications,
            state,
            stats,
            cancel_token,
            task: Some(task),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue a request. Fails only once the loop has stopped.
    pub fn request(&self, request: Request) -> Result<()> {
        self.inbox
            .send(Message::Request(request))
            .map_err(|_| AdapterError::State(format!("adapter {} is closed", self.name)))
    }

    pub fn allocate(&self) -> Result<()> {
        self.request(Request::Allocate)
    }

    pub fn configure(&self, params: StreamParams) -> Result<()> {
        self.request(Request::Configure(params))
    }

    pub fn set_output_sink(&self, sink: Option<BoxedSurface>) -> Result<()> {
        self.request(Request::SetOutputSink(sink))
    }

    pub fn start(&self) -> Result<()> {
        self.request(Request::Start)
    }

    pub fn flush(&self) -> Result<()> {
        self.request(Request::Flush)
    }

    pub fn set_parameters(&self, update: ParameterUpdate) -> Result<()> {
        self.request(Request::SetParameters(update))
    }

    pub fn signal_end_of_input(&self) -> Result<()> {
        self.request(Request::SignalEndOfInput)
    }

    pub fn shutdown(&self, keep_allocated: bool) -> Result<()> {
        self.request(Request::Shutdown { keep_allocated })
    }

    pub fn buffer_filled(&self, id: BufferId, info: FillInfo) -> Result<()> {
        self.request(Request::BufferFilled { id, info })
    }

    pub fn buffer_released(&self, id: BufferId) -> Result<()> {
        self.request(Request::BufferReleased { id })
    }

    /// A receiver for the notification stream. Every clone competes for the
    /// same events.
    pub fn notifications(&self) -> Receiver<Notification> {
        self.notifications.clone()
    }

    pub async fn next_notification(&self) -> Option<Notification> {
        self.notifications.recv_async().await.ok()
    }

    /// Stop the loop and wait for it to release the engine.
    pub async fn close(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("[{}] adapter task ended abnormally: {}", self.name, e);
            }
        }
    }
}

async fn run(mut core: AdapterCore, inbox: Receiver<Message>, cancel_token: CancellationToken) {
    debug!("[{}] loop started", core.name());
    loop {
        let poll = core.next_poll();
        let fence_check = core.next_fence_check();
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            message = inbox.recv_async() => match message {
                Ok(message) => core.handle(message),
                Err(_) => break,
            },
            _ = poll_due(poll) => core.handle(Message::SurfacePoll),
            _ = poll_due(fence_check) => core.handle(Message::FenceCheck),
        }
    }
    core.close();
    debug!("[{}] loop stopped in {}", core.name(), core.state());
}

async fn poll_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

//! Engine host: the far side of the remote link.
//!
//! Runs an [`EngineCore`] on its own thread and talks to the proxy only
//! through serialized frames. Nothing is shared with the proxy.

use std::thread;

use flume::{Receiver, Sender};
use tracing::{Level, debug, error, span, warn};

use crate::{
    common::types::EngineHandle,
    engine::{
        pipeline::{Completion, EngineCore},
        remote::wire::{self, Frame, Opcode, Reply},
    },
};

/// Lets the owner of a host simulate it dying.
#[derive(Clone)]
pub struct HostControl {
    kill: Sender<()>,
}

impl HostControl {
    /// Make the host exit immediately, as if its process crashed.
    pub fn crash(&self) {
        let _ = self.kill.send(());
    }
}

pub struct EngineHost {
    handle: EngineHandle,
    core: EngineCore,
    requests: Receiver<String>,
    replies: Sender<String>,
    kill: Receiver<()>,
}

enum Step {
    Frame(String),
    Gone,
    Killed,
}

impl EngineHost {
    /// Start a host thread that reads requests from `requests` and writes
    /// reply frames to `replies`.
    pub fn spawn(
        handle: EngineHandle,
        requests: Receiver<String>,
        replies: Sender<String>,
    ) -> std::io::Result<HostControl> {
        let (kill_tx, kill_rx) = flume::bounded(1);
        let host = Self {
            handle,
            core: EngineCore::new(),
            requests,
            replies,
            kill: kill_rx,
        };

        thread::Builder::new()
            .name(format!("engine-host-{}", handle.0))
            .spawn(move || host.run())?;

        Ok(HostControl { kill: kill_tx })
    }

    fn run(mut self) {
        let _span = span!(Level::DEBUG, "engine_host", engine = %self.handle).entered();

        loop {
            let step = flume::Selector::new()
                .recv(&self.requests, |r| match r {
                    Ok(text) => Step::Frame(text),
                    Err(_) => Step::Gone,
                })
                .recv(&self.kill, |_| Step::Killed)
                .wait();

            let text = match step {
                Step::Frame(text) => text,
                Step::Gone => {
                    debug!("proxy closed the link");
                    return;
                }
                Step::Killed => {
                    error!("host killed");
                    return;
                }
            };

            let frame: Frame<Opcode> = match wire::decode(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("dropping request: {}", e);
                    continue;
                }
            };

            if frame.body == Opcode::Release {
                debug!("released by proxy");
                return;
            }
            let mut replies = Vec::new();
            if matches!(frame.body, Opcode::QueueInput(_) | Opcode::QueueOutput(_)) {
                replies.push(Reply::Credit);
            }
            replies.extend(self.apply(frame.body).into_iter().map(Reply::Completion));
            for reply in replies {
                let text = match wire::encode(frame.seq, &reply) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("dropping reply: {}", e);
                        continue;
                    }
                };
                if self.replies.send(text).is_err() {
                    debug!("proxy stopped reading replies");
                    return;
                }
            }
        }
    }

    fn apply(&mut self, op: Opcode) -> Vec<Completion> {
        debug!("op {}", op.name());
        match op {
            Opcode::Allocate { handle } => {
                if handle != self.handle {
                    warn!("allocate for {} on host {}", handle, self.handle);
                }
                Vec::new()
            }
            Opcode::Configure(params) => match self.core.configure(&params) {
                Ok(_) => Vec::new(),
                Err(e) => vec![Completion::Error(e)],
            },
            Opcode::Start => self.core.start(),
            Opcode::QueueInput(job) => self.core.queue_input(job),
            Opcode::QueueOutput(slot) => self.core.queue_output(slot),
            Opcode::DrainOutput => self.core.drain_output(),
            Opcode::SetParameters(update) => self.core.set_parameters(&update),
            Opcode::CommitOutputFormat => match self.core.commit_output_format() {
                Ok(_) => Vec::new(),
                Err(e) => vec![Completion::Error(e)],
            },
            Opcode::Flush => self.core.flush(),
            Opcode::Stop => self.core.stop(),
            Opcode::Release => Vec::new(),
        }
    }
}

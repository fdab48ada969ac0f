use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::adapter::message::Notification;

/// Outbound event channel from the adapter to its client.
#[derive(Clone)]
pub struct Notifier {
    name: String,
    tx: Sender<Notification>,
}

impl Notifier {
    pub fn new(name: impl Into<String>) -> (Self, Receiver<Notification>) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    pub fn notify(&self, notification: Notification) {
        match &notification {
            Notification::Error(e) => warn!("[{}] -> Error: {}", self.name, e),
            Notification::FillThisBuffer(desc) => {
                debug!("[{}] -> FillThisBuffer {}", self.name, desc.id())
            }
            Notification::DrainThisBuffer(desc, flags) => debug!(
                "[{}] -> DrainThisBuffer {} eos={}",
                self.name,
                desc.id(),
                flags.end_of_stream
            ),
            other => debug!("[{}] -> {}", self.name, other.name()),
        }

        if self.tx.send(notification).is_err() {
            debug!("[{}] client stopped listening", self.name);
        }
    }
}

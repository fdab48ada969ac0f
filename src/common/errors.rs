use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories surfaced by the adapter, the engine bindings and the
/// display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Engine queue is momentarily full; retry later.
    WouldBlock,
    /// Request is illegal in the current state.
    State,
    /// Engine instance or buffer memory could not be allocated.
    Allocation,
    /// Engine reported a runtime fault.
    Engine,
    /// Display surface failed to take or recycle a buffer.
    Surface,
    /// A completion or acknowledgement named a buffer we do not know.
    Protocol,
}

impl ErrorKind {
    /// `WouldBlock` is the only kind that never changes adapter state.
    pub fn is_benign(self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Kinds that get latched as `pendingFatalError` when raised while the
    /// adapter is streaming.
    pub fn is_fatal_in_steady_state(self) -> bool {
        matches!(self, Self::Allocation | Self::Engine)
    }
}

/// Adapter error with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "camelCase")]
pub enum AdapterError {
    #[error("engine busy, try again")]
    WouldBlock,
    #[error("{0}")]
    State(String),
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("engine fault: {0}")]
    Engine(String),
    #[error("display surface: {0}")]
    Surface(String),
    #[error("protocol: {0}")]
    Protocol(String),
}

impl AdapterError {
    /// A request named `request` arrived while the adapter was in `state`.
    pub fn state(state: impl Display, request: impl Display) -> Self {
        Self::State(format!("{request} is not accepted in state {state}"))
    }

    pub fn allocation(reason: impl Display) -> Self {
        Self::Allocation(reason.to_string())
    }

    pub fn engine(reason: impl Display) -> Self {
        Self::Engine(reason.to_string())
    }

    pub fn surface(reason: impl Display) -> Self {
        Self::Surface(reason.to_string())
    }

    pub fn protocol(reason: impl Display) -> Self {
        Self::Protocol(reason.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WouldBlock => ErrorKind::WouldBlock,
            Self::State(_) => ErrorKind::State,
            Self::Allocation(_) => ErrorKind::Allocation,
            Self::Engine(_) => ErrorKind::Engine,
            Self::Surface(_) => ErrorKind::Surface,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// Result alias used by every engine, surface and adapter operation.
pub type Result<T> = std::result::Result<T, AdapterError>;

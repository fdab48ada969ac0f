//! Frames exchanged between [`RemoteEngine`](super::RemoteEngine) and
//! [`EngineHost`](super::EngineHost). Each frame is one serde_json text message.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    common::{
        errors::{AdapterError, Result},
        types::EngineHandle,
    },
    engine::pipeline::{Completion, InputJob, OutputSlot},
    format::{ParameterUpdate, StreamParams},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame<T> {
    /// Request frames count up from 1; a reply carries the seq of the request
    /// that produced it.
    pub seq: u64,
    pub body: T,
}

/// Request sent from the proxy to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "camelCase")]
pub enum Opcode {
    Allocate { handle: EngineHandle },
    Configure(StreamParams),
    Start,
    QueueInput(InputJob),
    QueueOutput(OutputSlot),
    DrainOutput,
    SetParameters(ParameterUpdate),
    CommitOutputFormat,
    Flush,
    Stop,
    Release,
}

impl Opcode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Allocate { .. } => "Allocate",
            Self::Configure(_) => "Configure",
            Self::Start => "Start",
            Self::QueueInput(_) => "QueueInput",
            Self::QueueOutput(_) => "QueueOutput",
            Self::DrainOutput => "DrainOutput",
            Self::SetParameters(_) => "SetParameters",
            Self::CommitOutputFormat => "CommitOutputFormat",
            Self::Flush => "Flush",
            Self::Stop => "Stop",
            Self::Release => "Release",
        }
    }
}

/// Reply sent from the host back to the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "args", rename_all = "camelCase")]
pub enum Reply {
    /// The host took one buffer frame off the request link.
    Credit,
    Completion(Completion),
}

pub fn encode<T: Serialize>(seq: u64, body: &T) -> Result<String> {
    #[derive(Serialize)]
    struct Borrowed<'a, T> {
        seq: u64,
        body: &'a T,
    }
    serde_json::to_string(&Borrowed { seq, body })
        .map_err(|e| AdapterError::protocol(format!("cannot encode frame {seq}: {e}")))
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<Frame<T>> {
    serde_json::from_str(text).map_err(|e| AdapterError::protocol(format!("malformed frame: {e}")))
}

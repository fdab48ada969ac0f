use crate::{
    buffer::{BufferDescriptor, BufferFlags, Fence},
    common::{errors::AdapterError, types::BufferId},
    engine::EngineEvent,
    format::{ParameterUpdate, PortFormat, StreamParams},
    surface::{BoxedSurface, SurfaceEvent},
};

/// What the client says about an input buffer it filled.
#[derive(Debug, Clone, Default)]
pub struct FillInfo {
    pub flags: BufferFlags,
    pub timestamp_us: u64,
    /// Signalled by the client once the payload write is visible.
    pub fence: Option<Fence>,
}

/// Control requests accepted from the client.
pub enum Request {
    Allocate,
    Configure(StreamParams),
    SetOutputSink(Option<BoxedSurface>),
    Start,
    Flush,
    SetParameters(ParameterUpdate),
    SignalEndOfInput,
    Shutdown { keep_allocated: bool },
    BufferFilled { id: BufferId, info: FillInfo },
    BufferReleased { id: BufferId },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Allocate => "Allocate",
            Self::Configure(_) => "Configure",
            Self::SetOutputSink(_) => "SetOutputSink",
            Self::Start => "Start",
            Self::Flush => "Flush",
            Self::SetParameters(_) => "SetParameters",
            Self::SignalEndOfInput => "SignalEndOfInput",
            Self::Shutdown { .. } => "Shutdown",
            Self::BufferFilled { .. } => "BufferFilled",
            Self::BufferReleased { .. } => "BufferReleased",
        }
    }

    /// Buffer acknowledgements move buffers, they never change state.
    pub fn is_buffer_ack(&self) -> bool {
        matches!(self, Self::BufferFilled { .. } | Self::BufferReleased { .. })
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configure(params) => f.debug_tuple("Configure").field(params).finish(),
            Self::SetOutputSink(sink) => f
                .debug_tuple("SetOutputSink")
                .field(&sink.as_ref().map(|s| s.name().to_string()))
                .finish(),
            Self::SetParameters(update) => f.debug_tuple("SetParameters").field(update).finish(),
            Self::Shutdown { keep_allocated } => f
                .debug_struct("Shutdown")
                .field("keep_allocated", keep_allocated)
                .finish(),
            Self::BufferFilled { id, info } => f
                .debug_struct("BufferFilled")
                .field("id", id)
                .field("info", info)
                .finish(),
            Self::BufferReleased { id } => {
                f.debug_struct("BufferReleased").field("id", id).finish()
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Everything that arrives in the adapter inbox.
#[derive(Debug)]
pub enum Message {
    Request(Request),
    Engine(EngineEvent),
    Surface(SurfaceEvent),
    /// Shutdown is waiting on the display surface and the poll interval elapsed.
    SurfacePoll,
    /// An input buffer is held on an unsignalled fence; look again.
    FenceCheck,
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

/// Events emitted to the client.
#[derive(Debug, Clone)]
pub enum Notification {
    Allocated,
    Configured {
        input: PortFormat,
        output: PortFormat,
    },
    OutputFormatChanged(PortFormat),
    /// The client may write into this input buffer, then answer `BufferFilled`.
    FillThisBuffer(BufferDescriptor),
    /// The client may read this output buffer, then answer `BufferReleased`.
    DrainThisBuffer(BufferDescriptor, BufferFlags),
    EndOfStream,
    FlushCompleted,
    ShutdownCompleted,
    Error(AdapterError),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Allocated => "Allocated",
            Self::Configured { .. } => "Configured",
            Self::OutputFormatChanged(_) => "OutputFormatChanged",
            Self::FillThisBuffer(_) => "FillThisBuffer",
            Self::DrainThisBuffer(..) => "DrainThisBuffer",
            Self::EndOfStream => "EndOfStream",
            Self::FlushCompleted => "FlushCompleted",
            Self::ShutdownCompleted => "ShutdownCompleted",
            Self::Error(_) => "Error",
        }
    }
}

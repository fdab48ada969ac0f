//! Buffer slots and the two directional ports that own them.

pub mod descriptor;
pub mod memory;
pub mod pool;
pub mod port;

pub use descriptor::{BufferDescriptor, BufferFlags, Ownership};
pub use memory::{Fence, GraphicBuffer, Payload, SharedMemory};
pub use pool::{BytePool, PoolStats};
pub use port::Port;

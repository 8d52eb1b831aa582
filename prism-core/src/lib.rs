//! Remote rendering bridge.
//!
//! Forwards a rendering-API session from a remote client to a locally
//! instantiated render device: parameter updates stream in, compressed
//! framebuffer channels stream out. The rendering API itself lives
//! behind the [`device`] adapter; everything else is resource
//! translation, message dispatch, and frame streaming.

mod datatype;
mod dispatch;
mod error;
mod opcode;
mod payload;
mod queue;
mod resources;
mod wire;

pub mod compress;
pub mod device;
pub mod frame;
pub mod server;

pub use compress::CompressionFeatures;
pub use datatype::{DataType, Parameter};
pub use device::{Backend, BackendRegistry, ObjectHandle, RenderDevice, StatusSink, WaitMask};
pub use dispatch::Dispatcher;
pub use error::PrismError;
pub use opcode::Opcode;
pub use payload::{PayloadReader, PayloadWriter};
pub use queue::WorkQueue;
pub use resources::{ArrayInfo, ObjectRecord, ResourceManager};
pub use server::Server;
pub use wire::{Message, WireCodec};

/// Default TCP port of the bridge.
pub const DEFAULT_PORT: u16 = 31050;

/// Bytes of `<u32 opcode><u32 length>` preceding every payload.
pub const FRAME_HEADER_LENGTH: usize = 8;

/// Upper bound on a single payload; a length field beyond this is an
/// unrecoverable framing error.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 28;

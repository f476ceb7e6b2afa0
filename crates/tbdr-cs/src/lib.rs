//! Command stream buffers for the tiled renderer.
//!
//! This crate provides:
//! - [`CommandStream`]: a growable, chunked, append-only stream of PM4 packets with
//!   indirect-buffer calls into other streams and render-mode conditional regions.
//! - [`SubStreamPool`]: a bump arena for short-lived per-draw state blocks, returned as
//!   [`DrawState`] address/size pairs.
//! - [`Emit`]: packet framing shared by both.
//! - [`reader`]: packet decoding and call flattening for tests and tooling.

mod arena;
mod emit;
mod error;
pub mod packet;
pub mod reader;
mod stream;
mod substream;

pub use arena::BumpArena;
pub use emit::Emit;
pub use error::{Result, StreamError};
pub use packet::{Opcode, VgtEvent};
pub use reader::{flatten, packets, DecodeError, IovaResolver, Packet, PacketReader};
pub use stream::{CommandStream, CondExec, StreamId, CHUNK_IOVA_SPAN, COND_REG_EXEC_MODE_RENDER_MODE};
pub use substream::{DrawState, SubAlloc, SubStream, SubStreamPool};

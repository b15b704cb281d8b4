//! Wire protocol.
//!
//! The control network speaks typed frames over TCP: a 4-byte big-endian
//! length prefix followed by a JSON document. The frame vocabulary covers
//! unary requests, server-streaming watches and client-streaming actual
//! uploads; which of the three a request opens is a static property of
//! its operation.
//!
//! The framing is deliberately minimal. The engineering contract lives in
//! the logical operations, not the transport.

mod codec;
mod frame;

pub use codec::{CodecError, JsonFrameCodec, MAX_FRAME_LEN};
pub use frame::{ClientFrame, Request, ServerFrame, StreamItem, WireError};

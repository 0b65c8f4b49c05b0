//! Bidirectional JSON-RPC over a newline-delimited byte stream.
//!
//! One [`peer::Peer`] owns the method registry and the pending-call table
//! for a single connection. The reader and writer tasks in [`io`] move
//! lines between the stream and the peer.
//!
//! Submodules:
//! - `message`: wire envelope classification and serialization.
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing.
//! - `peer`: call correlation, timeouts, and inbound dispatch.
//! - `io`: reader/writer tasks binding a peer to an async stream.

pub mod codec;
pub mod io;
pub mod message;
pub mod peer;

pub use message::{Message, RequestId, RpcError};
pub use peer::Peer;

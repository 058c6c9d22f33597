//! C3: long-lived framed TCP links between every pair of members.
//! `codec` implements the length-prefixed wire framing, `peer` the
//! connection table, reconnect scheduler, and reader/writer tasks.

pub mod codec;
pub mod peer;

pub use peer::{PeerHandle, PeerTransport};

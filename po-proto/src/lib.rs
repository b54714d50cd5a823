//! po-proto: compiler <-> advisor wire protocol.
//!
//! Every message travels in a length-delimited frame; the payload inside uses one of the
//! encodings in [`po_core::Encoding`], chosen at startup.

pub mod codec;
pub mod frame;
pub mod protocol;
pub mod wire;

pub use codec::{check_state_len, decode, encode, DecodeError, EncodeError, WireMessage};
pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use protocol::{Advice, AdviceRequest, MsgKind, PeerMessage, PROTOCOL_VERSION};
pub use wire::{recv, send, WireError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

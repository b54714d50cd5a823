//! Framed, encoded messages over any byte stream.

use std::io::{Read, Write};

use po_core::Encoding;
use thiserror::Error;

use crate::codec::{decode, encode, DecodeError, EncodeError, WireMessage};
use crate::frame::{read_frame, write_frame, FrameError};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
}

pub fn send<W: Write, M: WireMessage>(w: &mut W, enc: Encoding, msg: &M) -> Result<(), WireError> {
    let payload = encode(enc, msg)?;
    write_frame(w, &payload)?;
    Ok(())
}

/// Blocking receive of one message. A malformed payload still consumes its frame, so the
/// stream stays aligned for the next message.
pub fn recv<R: Read, M: WireMessage>(r: &mut R, enc: Encoding) -> Result<M, WireError> {
    let payload = read_frame(r)?;
    Ok(decode(enc, &payload)?)
}

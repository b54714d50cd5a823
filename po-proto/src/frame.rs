//! Length-delimited framing (u32 little-endian length prefix).
//!
//! The reader tells a peer that hung up between frames ([`FrameError::Closed`]) apart from one
//! that vanished halfway through a frame ([`FrameError::UnexpectedEof`]).

use std::io::{ErrorKind, Read, Write};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: {len} > {max}")]
    TooLarge { len: u64, max: u32 },
    #[error("peer closed the channel")]
    Closed,
    #[error("unexpected EOF while reading frame")]
    UnexpectedEof,
}

impl FrameError {
    /// True if the peer is gone, cleanly or not.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Closed | FrameError::UnexpectedEof => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::UnexpectedEof
            ),
            FrameError::TooLarge { .. } => false,
        }
    }
}

pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024; // 64 MiB guardrail

pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&l| l <= MAX_FRAME_LEN)
        .ok_or(FrameError::TooLarge {
            len: payload.len() as u64,
            max: MAX_FRAME_LEN,
        })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame. Blocks until a whole frame arrives or the peer goes away.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut len_bytes = [0u8; 4];
    match fill(r, &mut len_bytes)? {
        0 => return Err(FrameError::Closed),
        n if n < len_bytes.len() => return Err(FrameError::UnexpectedEof),
        _ => {}
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: u64::from(len),
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len as usize];
    if fill(r, &mut payload)? < payload.len() {
        return Err(FrameError::UnexpectedEof);
    }
    Ok(payload)
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn fill<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    let mut off = 0usize;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => break,
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(off)
}

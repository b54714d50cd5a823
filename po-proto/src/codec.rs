//! Payload encodings (inside a length-delimited frame).
//!
//! `json` and `msgpack` go through serde. `binary` is a hand-written little-endian layout:
//!
//! ```text
//! header: u32 version | u8 kind | u8 flags | u16 reserved
//! vec<f32>:  u32 len | f32 * len
//! opt<T>:    u8 present (0/1) | T
//! bytes/str: u32 len | u8 * len
//! metrics:   f64 size | f64 throughput
//! ```

use po_core::{Encoding, UnitMetrics};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::protocol::{Advice, AdviceRequest, MsgKind, PeerMessage, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short")]
    TooShort,
    #[error("unsupported protocol version: {0}")]
    BadVersion(u32),
    #[error("unexpected message kind: {0}")]
    BadKind(u8),
    #[error("invalid boolean byte: {0}")]
    BadBool(u8),
    #[error("string is not valid utf-8")]
    BadUtf8,
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("state vector has length {got}, expected {expected}")]
    BadStateLen { got: usize, expected: usize },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack: {0}")]
    MsgPack(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack: {0}")]
    MsgPack(#[from] rmp_serde::encode::Error),
    #[error("field too long for the binary layout: {0} elements")]
    TooLong(usize),
}

/// A message that can travel in every [`Encoding`].
pub trait WireMessage: Serialize + DeserializeOwned {
    fn encode_binary(&self, out: &mut Vec<u8>) -> Result<(), EncodeError>;
    fn decode_binary(c: &mut Cursor<'_>) -> Result<Self, DecodeError>;
}

pub fn encode<M: WireMessage>(enc: Encoding, msg: &M) -> Result<Vec<u8>, EncodeError> {
    match enc {
        Encoding::Json => Ok(serde_json::to_vec(msg)?),
        Encoding::MsgPack => Ok(rmp_serde::to_vec_named(msg)?),
        Encoding::Binary => {
            let mut out = Vec::with_capacity(64);
            msg.encode_binary(&mut out)?;
            Ok(out)
        }
    }
}

pub fn decode<M: WireMessage>(enc: Encoding, bytes: &[u8]) -> Result<M, DecodeError> {
    match enc {
        Encoding::Json => Ok(serde_json::from_slice(bytes)?),
        Encoding::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
        Encoding::Binary => {
            let mut c = Cursor::new(bytes);
            let m = M::decode_binary(&mut c)?;
            c.finish()?;
            Ok(m)
        }
    }
}

/// Reject a state vector whose length differs from the configured size.
pub fn check_state_len(state: &[f32], expected: usize) -> Result<(), DecodeError> {
    if state.len() != expected {
        return Err(DecodeError::BadStateLen {
            got: state.len(),
            expected,
        });
    }
    Ok(())
}

impl WireMessage for PeerMessage {
    fn encode_binary(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        put_header(out, self.kind());
        match self {
            PeerMessage::Reset {
                unit,
                state,
                metrics,
            } => {
                put_opt_str(out, unit.as_deref())?;
                put_f32s(out, state)?;
                put_opt_metrics(out, metrics.as_ref());
            }
            PeerMessage::Step {
                state,
                reward,
                metrics,
                done,
                response,
            } => {
                put_f32s(out, state)?;
                put_opt_f32(out, *reward);
                put_opt_metrics(out, metrics.as_ref());
                out.push(u8::from(*done));
                put_opt_bytes(out, response.as_deref())?;
            }
            PeerMessage::Shutdown => {}
        }
        Ok(())
    }

    fn decode_binary(c: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        match c.read_header()? {
            MsgKind::Reset => Ok(PeerMessage::Reset {
                unit: c.read_opt_str()?,
                state: c.read_f32s()?,
                metrics: c.read_opt_metrics()?,
            }),
            MsgKind::Step => Ok(PeerMessage::Step {
                state: c.read_f32s()?,
                reward: c.read_opt_f32()?,
                metrics: c.read_opt_metrics()?,
                done: c.read_bool()?,
                response: c.read_opt_bytes()?,
            }),
            MsgKind::Shutdown => Ok(PeerMessage::Shutdown),
            other => Err(DecodeError::BadKind(other as u8)),
        }
    }
}

impl WireMessage for Advice {
    fn encode_binary(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        put_header(out, MsgKind::Advice);
        out.extend_from_slice(&self.action.to_le_bytes());
        Ok(())
    }

    fn decode_binary(c: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        c.expect_kind(MsgKind::Advice)?;
        Ok(Advice {
            action: c.read_i32()?,
        })
    }
}

impl WireMessage for AdviceRequest {
    fn encode_binary(&self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        put_header(out, MsgKind::AdviceRequest);
        put_f32s(out, &self.embedding)?;
        put_opt_f32(out, self.reward);
        put_opt_metrics(out, self.metrics.as_ref());
        out.push(u8::from(self.done));
        put_opt_bytes(out, self.response.as_deref())?;
        put_opt_str(out, self.unit.as_deref())?;
        Ok(())
    }

    fn decode_binary(c: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        c.expect_kind(MsgKind::AdviceRequest)?;
        Ok(AdviceRequest {
            embedding: c.read_f32s()?,
            reward: c.read_opt_f32()?,
            metrics: c.read_opt_metrics()?,
            done: c.read_bool()?,
            response: c.read_opt_bytes()?,
            unit: c.read_opt_str()?,
        })
    }
}

fn put_header(out: &mut Vec<u8>, kind: MsgKind) {
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.push(kind as u8);
    out.push(0); // flags
    out.extend_from_slice(&[0, 0]); // reserved
}

fn put_len(out: &mut Vec<u8>, n: usize) -> Result<(), EncodeError> {
    let n32 = u32::try_from(n).map_err(|_| EncodeError::TooLong(n))?;
    out.extend_from_slice(&n32.to_le_bytes());
    Ok(())
}

fn put_f32s(out: &mut Vec<u8>, v: &[f32]) -> Result<(), EncodeError> {
    put_len(out, v.len())?;
    out.reserve(v.len() * 4);
    for &f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    Ok(())
}

fn put_opt_f32(out: &mut Vec<u8>, v: Option<f32>) {
    match v {
        Some(f) => {
            out.push(1);
            out.extend_from_slice(&f.to_le_bytes());
        }
        None => out.push(0),
    }
}

fn put_opt_metrics(out: &mut Vec<u8>, m: Option<&UnitMetrics>) {
    match m {
        Some(m) => {
            out.push(1);
            out.extend_from_slice(&m.size.to_le_bytes());
            out.extend_from_slice(&m.throughput.to_le_bytes());
        }
        None => out.push(0),
    }
}

fn put_opt_bytes(out: &mut Vec<u8>, b: Option<&[u8]>) -> Result<(), EncodeError> {
    match b {
        Some(b) => {
            out.push(1);
            put_len(out, b.len())?;
            out.extend_from_slice(b);
        }
        None => out.push(0),
    }
    Ok(())
}

fn put_opt_str(out: &mut Vec<u8>, s: Option<&str>) -> Result<(), EncodeError> {
    put_opt_bytes(out, s.map(str::as_bytes))
}

pub struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.off.checked_add(n).ok_or(DecodeError::TooShort)?;
        if end > self.bytes.len() {
            return Err(DecodeError::TooShort);
        }
        let s = &self.bytes[self.off..end];
        self.off = end;
        Ok(s)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.bytes.len() - self.off {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    fn read_header(&mut self) -> Result<MsgKind, DecodeError> {
        let version = self.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        let kind = self.read_u8()?;
        let _flags = self.read_u8()?;
        self.take(2)?;
        MsgKind::from_u8(kind).ok_or(DecodeError::BadKind(kind))
    }

    fn expect_kind(&mut self, want: MsgKind) -> Result<(), DecodeError> {
        let got = self.read_header()?;
        if got != want {
            return Err(DecodeError::BadKind(got as u8));
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::BadBool(b)),
        }
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let b = self.take(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(f64::from_le_bytes(a))
    }

    fn read_f32s(&mut self) -> Result<Vec<f32>, DecodeError> {
        let n = self.read_u32()? as usize;
        // Bounds-check the whole vector before allocating for it.
        let raw = self.take(n.checked_mul(4).ok_or(DecodeError::TooShort)?)?;
        Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn read_present(&mut self) -> Result<bool, DecodeError> {
        self.read_bool()
    }

    fn read_opt_f32(&mut self) -> Result<Option<f32>, DecodeError> {
        if self.read_present()? {
            Ok(Some(self.read_f32()?))
        } else {
            Ok(None)
        }
    }

    fn read_opt_metrics(&mut self) -> Result<Option<UnitMetrics>, DecodeError> {
        if self.read_present()? {
            Ok(Some(UnitMetrics {
                size: self.read_f64()?,
                throughput: self.read_f64()?,
            }))
        } else {
            Ok(None)
        }
    }

    fn read_opt_bytes(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        if self.read_present()? {
            let n = self.read_u32()? as usize;
            Ok(Some(self.take(n)?.to_vec()))
        } else {
            Ok(None)
        }
    }

    fn read_opt_str(&mut self) -> Result<Option<String>, DecodeError> {
        match self.read_opt_bytes()? {
            Some(b) => String::from_utf8(b).map(Some).map_err(|_| DecodeError::BadUtf8),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Encoding; 3] = [Encoding::Json, Encoding::Binary, Encoding::MsgPack];

    fn step_msg() -> PeerMessage {
        PeerMessage::Step {
            state: vec![0.25, -1.5, 3.0],
            reward: Some(0.5),
            metrics: Some(UnitMetrics {
                size: 1024.0,
                throughput: 88.5,
            }),
            done: true,
            response: Some(b"-simplifycfg -instcombine".to_vec()),
        }
    }

    #[test]
    fn every_encoding_carries_every_message() {
        let reset = PeerMessage::Reset {
            unit: Some("bench/a.ll".to_string()),
            state: vec![1.0; 4],
            metrics: None,
        };
        let req = AdviceRequest {
            embedding: vec![0.1, 0.2],
            reward: None,
            metrics: None,
            done: false,
            response: None,
            unit: None,
        };
        for enc in ALL {
            for m in [reset.clone(), step_msg(), PeerMessage::Shutdown] {
                let bytes = encode(enc, &m).unwrap();
                assert_eq!(decode::<PeerMessage>(enc, &bytes).unwrap(), m, "{enc}");
            }
            let bytes = encode(enc, &Advice::terminal()).unwrap();
            assert_eq!(decode::<Advice>(enc, &bytes).unwrap(), Advice::terminal());
            let bytes = encode(enc, &req).unwrap();
            assert_eq!(decode::<AdviceRequest>(enc, &bytes).unwrap(), req);
        }
    }

    #[test]
    fn binary_advice_layout_is_fixed() {
        let bytes = encode(Encoding::Binary, &Advice { action: 3 }).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 4, 0, 0, 0, 3, 0, 0, 0]);
    }

    #[test]
    fn truncated_payloads_fail_to_decode() {
        for enc in ALL {
            let bytes = encode(enc, &step_msg()).unwrap();
            let cut = &bytes[..bytes.len() / 2];
            assert!(decode::<PeerMessage>(enc, cut).is_err(), "{enc}");
        }
    }

    #[test]
    fn binary_rejects_wrong_version_and_kind() {
        let mut bytes = encode(Encoding::Binary, &PeerMessage::Shutdown).unwrap();
        bytes[0] = 9;
        assert!(matches!(
            decode::<PeerMessage>(Encoding::Binary, &bytes),
            Err(DecodeError::BadVersion(9))
        ));

        let bytes = encode(Encoding::Binary, &Advice { action: 1 }).unwrap();
        assert!(matches!(
            decode::<PeerMessage>(Encoding::Binary, &bytes),
            Err(DecodeError::BadKind(4))
        ));
    }

    #[test]
    fn binary_rejects_trailing_bytes_and_bad_bools() {
        let mut bytes = encode(Encoding::Binary, &Advice { action: 1 }).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode::<Advice>(Encoding::Binary, &bytes),
            Err(DecodeError::TrailingBytes(1))
        ));

        let req = AdviceRequest {
            embedding: Vec::new(),
            ..AdviceRequest::default()
        };
        let mut bytes = encode(Encoding::Binary, &req).unwrap();
        // header(8) + len(4) + reward flag(1) + metrics flag(1) -> done byte
        bytes[14] = 7;
        assert!(matches!(
            decode::<AdviceRequest>(Encoding::Binary, &bytes),
            Err(DecodeError::BadBool(7))
        ));
    }

    #[test]
    fn huge_vector_length_does_not_allocate() {
        let mut bytes = Vec::new();
        put_header(&mut bytes, MsgKind::AdviceRequest);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode::<AdviceRequest>(Encoding::Binary, &bytes),
            Err(DecodeError::TooShort)
        ));
    }

    #[test]
    fn json_garbage_is_a_decode_error() {
        assert!(matches!(
            decode::<PeerMessage>(Encoding::Json, b"{\"kind\":\"reset\""),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode::<PeerMessage>(Encoding::MsgPack, &[0xc1]),
            Err(DecodeError::MsgPack(_))
        ));
    }

    #[test]
    fn state_len_check() {
        assert!(check_state_len(&[0.0; 3], 3).is_ok());
        assert!(matches!(
            check_state_len(&[0.0; 2], 3),
            Err(DecodeError::BadStateLen {
                got: 2,
                expected: 3
            })
        ));
    }
}

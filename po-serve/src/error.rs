use std::io;

use po_core::ConfigError;
use po_logging::NdjsonError;
use po_policy::LoadError;
use po_proto::{DecodeError, EncodeError, FrameError, MsgKind, WireError};
use po_runtime::EpisodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("policy load failed: {0}")]
    Load(#[from] LoadError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("malformed peer message: {0}")]
    TransportDecode(#[from] DecodeError),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("unexpected {got:?} message, expected {expected}")]
    UnexpectedMessage { expected: &'static str, got: MsgKind },
    #[error(transparent)]
    Episode(#[from] EpisodeError),
    #[error("frame: {0}")]
    Frame(FrameError),
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
    #[error("journal: {0}")]
    Journal(#[from] NdjsonError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for ServeError {
    fn from(e: FrameError) -> Self {
        if e.is_disconnect() {
            ServeError::PeerDisconnected
        } else {
            ServeError::Frame(e)
        }
    }
}

impl From<WireError> for ServeError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Frame(f) => f.into(),
            WireError::Decode(d) => ServeError::TransportDecode(d),
            WireError::Encode(e) => ServeError::Encode(e),
        }
    }
}

impl ServeError {
    /// Errors confined to one episode; the transport keeps serving after them.
    pub fn is_episode_local(&self) -> bool {
        matches!(
            self,
            ServeError::TransportDecode(_)
                | ServeError::UnexpectedMessage { .. }
                | ServeError::Episode(_)
        )
    }

    /// The byte stream can no longer be split into frames, so the session ends but the
    /// process keeps serving.
    pub fn is_stream_desync(&self) -> bool {
        matches!(
            self,
            ServeError::Frame(FrameError::TooLarge { .. }) | ServeError::Frame(FrameError::Io(_))
        )
    }

    /// The peer already sent its final report and is not waiting for advice.
    pub(crate) fn peer_expects_no_reply(&self) -> bool {
        matches!(
            self,
            ServeError::Episode(EpisodeError::MissingTerminalPayload(_))
        )
    }
}

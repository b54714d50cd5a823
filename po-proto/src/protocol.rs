//! Message definitions for both transports.
//!
//! Duplex channel: the compiler sends [`PeerMessage`]s, the advisor answers each `Reset` and
//! each non-final `Step` with an [`Advice`]. Remote call: one [`AdviceRequest`] in, one
//! [`Advice`] out.

use po_core::{UnitMetrics, TERMINAL_ACTION};
use serde::{Deserialize, Serialize};

/// Binary layout version carried in every binary header.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Reset = 1,
    Step = 2,
    Shutdown = 3,
    Advice = 4,
    AdviceRequest = 5,
}

impl MsgKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(MsgKind::Reset),
            2 => Some(MsgKind::Step),
            3 => Some(MsgKind::Shutdown),
            4 => Some(MsgKind::Advice),
            5 => Some(MsgKind::AdviceRequest),
            _ => None,
        }
    }
}

/// Compiler -> advisor on the duplex channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A new compilation unit: its initial state.
    Reset {
        #[serde(default)]
        unit: Option<String>,
        state: Vec<f32>,
        #[serde(default)]
        metrics: Option<UnitMetrics>,
    },
    /// Result of applying the last advised action.
    Step {
        state: Vec<f32>,
        #[serde(default)]
        reward: Option<f32>,
        #[serde(default)]
        metrics: Option<UnitMetrics>,
        done: bool,
        #[serde(default)]
        response: Option<Vec<u8>>,
    },
    /// No more compilation units.
    Shutdown,
}

impl PeerMessage {
    pub fn kind(&self) -> MsgKind {
        match self {
            PeerMessage::Reset { .. } => MsgKind::Reset,
            PeerMessage::Step { .. } => MsgKind::Step,
            PeerMessage::Shutdown => MsgKind::Shutdown,
        }
    }
}

/// Advisor -> compiler: the pass to apply, or [`TERMINAL_ACTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    pub action: i32,
}

impl Advice {
    pub fn act(action: u32) -> Self {
        Self {
            action: po_core::action_to_wire(action),
        }
    }

    pub fn terminal() -> Self {
        Self {
            action: TERMINAL_ACTION,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.action == TERMINAL_ACTION
    }
}

/// One `getAdvice` call. The first call of an episode only needs `embedding`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdviceRequest {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub reward: Option<f32>,
    #[serde(default)]
    pub metrics: Option<UnitMetrics>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<Vec<u8>>,
    #[serde(default)]
    pub unit: Option<String>,
}

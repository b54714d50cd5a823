//! Duplex-loop adapter: one implicit session driven over a bidirectional byte channel.
//!
//! ```text
//! peer: Reset ----------> advisor
//!       <---------- Advice(a0)
//!       Step(done=false) ->
//!       <---------- Advice(a1)
//!       ...
//!       Step(done=true) ->            (no reply; next unit starts with Reset)
//!       Shutdown | EOF ---->          (loop ends)
//! ```

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use po_core::Encoding;
use po_proto::{check_state_len, recv, send, Advice, FrameError, MsgKind, PeerMessage, WireError};
use po_runtime::{lock_episode, EpisodeError, SessionId, StepReport, Transition};

use crate::advisor::Advisor;
use crate::error::ServeError;

/// The duplex channel has no session ids on the wire; every unit runs under this one.
pub const DUPLEX_SESSION: SessionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    /// Peer sent `Shutdown`.
    Shutdown,
    /// Peer closed the channel between units.
    PeerClosed,
    /// Local shutdown flag was raised.
    Stopped,
    /// Framing was lost (bad length prefix or read failure); the channel must be reopened.
    Desynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    pub completed: u64,
    pub aborted: u64,
    pub end: LoopEnd,
}

enum UnitEnd {
    Completed,
    Shutdown,
    Closed,
}

pub struct DuplexLoop<'a, R, W> {
    advisor: &'a Advisor,
    encoding: Encoding,
    reader: R,
    writer: W,
}

impl<'a, R: Read, W: Write> DuplexLoop<'a, R, W> {
    pub fn new(advisor: &'a Advisor, encoding: Encoding, reader: R, writer: W) -> Self {
        Self {
            advisor,
            encoding,
            reader,
            writer,
        }
    }

    /// Serve units until the peer says stop or goes away between units.
    ///
    /// Failures inside one unit are answered with the terminal advice and the loop moves on.
    /// A desynced stream gets a best-effort terminal advice and ends the loop with
    /// [`LoopEnd::Desynced`].
    /// `shutdown` is checked between units only; a blocked read is not interrupted.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<LoopSummary, ServeError> {
        let mut completed = 0u64;
        let mut aborted = 0u64;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(LoopSummary {
                    completed,
                    aborted,
                    end: LoopEnd::Stopped,
                });
            }
            match self.run_unit() {
                Ok(UnitEnd::Completed) => completed += 1,
                Ok(UnitEnd::Shutdown) => {
                    return Ok(LoopSummary {
                        completed,
                        aborted,
                        end: LoopEnd::Shutdown,
                    })
                }
                Ok(UnitEnd::Closed) => {
                    return Ok(LoopSummary {
                        completed,
                        aborted,
                        end: LoopEnd::PeerClosed,
                    })
                }
                Err(e) if e.is_episode_local() => {
                    aborted += 1;
                    if self.advisor.abort(DUPLEX_SESSION, &e).is_none() {
                        eprintln!("[po-serve] duplex: unit rejected: {e}");
                    }
                    if !e.peer_expects_no_reply() {
                        self.send(Advice::terminal())?;
                    }
                }
                Err(e) if e.is_stream_desync() => {
                    aborted += 1;
                    self.advisor.abort(DUPLEX_SESSION, &e);
                    eprintln!("[po-serve] duplex: framing lost, ending session: {e}");
                    // The peer may already be gone; nothing more can be read either way.
                    let _ = self.send(Advice::terminal());
                    return Ok(LoopSummary {
                        completed,
                        aborted,
                        end: LoopEnd::Desynced,
                    });
                }
                Err(e) => {
                    self.advisor.abort(DUPLEX_SESSION, &e);
                    return Err(e);
                }
            }
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    fn run_unit(&mut self) -> Result<UnitEnd, ServeError> {
        let (unit, state, metrics) = match self.recv()? {
            None => return Ok(UnitEnd::Closed),
            Some(PeerMessage::Shutdown) => return Ok(UnitEnd::Shutdown),
            Some(PeerMessage::Reset {
                unit,
                state,
                metrics,
            }) => (unit, state, metrics),
            Some(other) => {
                return Err(ServeError::UnexpectedMessage {
                    expected: "reset",
                    got: other.kind(),
                })
            }
        };

        let advisor = self.advisor;
        let policy = advisor.policy();
        check_state_len(&state, policy.input_len())?;
        let lookup = advisor.store().get_or_create(DUPLEX_SESSION, &state)?;
        let mut ep = lock_episode(&lookup.episode);
        if !lookup.created {
            return Err(EpisodeError::ProtocolViolation {
                session: DUPLEX_SESSION,
                op: "reset",
                phase: ep.phase(),
            }
            .into());
        }
        ep.set_unit(unit);
        ep.set_baseline(metrics);

        loop {
            let action = ep.choose_action(policy)?;
            self.send(Advice::act(action))?;

            match self.recv()?.ok_or(ServeError::PeerDisconnected)? {
                PeerMessage::Step {
                    state,
                    reward,
                    metrics,
                    done,
                    response,
                } => {
                    if !done {
                        check_state_len(&state, policy.input_len())?;
                    }
                    let reward = ep.shape_reward(reward, metrics);
                    let report = StepReport {
                        next_state: state,
                        reward,
                        done,
                        response,
                    };
                    if ep.advance(report)? == Transition::Finished {
                        break;
                    }
                }
                PeerMessage::Shutdown => {
                    drop(ep);
                    advisor.abort(
                        DUPLEX_SESSION,
                        &ServeError::UnexpectedMessage {
                            expected: "step",
                            got: MsgKind::Shutdown,
                        },
                    );
                    return Ok(UnitEnd::Shutdown);
                }
                other => {
                    return Err(ServeError::UnexpectedMessage {
                        expected: "step",
                        got: other.kind(),
                    })
                }
            }
        }

        drop(ep);
        advisor.finish(DUPLEX_SESSION);
        Ok(UnitEnd::Completed)
    }

    /// `Ok(None)` is a clean close at a frame boundary.
    fn recv(&mut self) -> Result<Option<PeerMessage>, ServeError> {
        match recv(&mut self.reader, self.encoding) {
            Ok(m) => Ok(Some(m)),
            Err(WireError::Frame(FrameError::Closed)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn send(&mut self, advice: Advice) -> Result<(), ServeError> {
        send(&mut self.writer, self.encoding, &advice)?;
        self.writer.flush()?;
        Ok(())
    }
}

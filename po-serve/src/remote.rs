//! Remote-call adapter: one `get_advice` per compiler request, session state kept here.

use std::sync::Arc;

use po_proto::{check_state_len, Advice, AdviceRequest};
use po_runtime::{lock_episode, SessionId, StepReport, Transition};

use crate::advisor::Advisor;
use crate::error::ServeError;

/// Thin driver over [`Advisor`]; cheap to clone into connection threads.
#[derive(Clone)]
pub struct AdviceService {
    advisor: Arc<Advisor>,
}

impl AdviceService {
    pub fn new(advisor: Arc<Advisor>) -> Self {
        Self { advisor }
    }

    pub fn advisor(&self) -> &Advisor {
        &self.advisor
    }

    /// Answer one call. Never fails: any error ends the episode and yields the terminal advice.
    pub fn get_advice(&self, session: SessionId, req: &AdviceRequest) -> Advice {
        match self.try_get_advice(session, req) {
            Ok(advice) => advice,
            Err(e) => {
                self.fail(session, &e);
                Advice::terminal()
            }
        }
    }

    /// Map a transport-level failure for `session` to the terminal advice.
    pub fn fail(&self, session: SessionId, err: &ServeError) -> Advice {
        if self.advisor.abort(session, err).is_none() {
            eprintln!("[po-serve] session {session}: {err}");
        }
        Advice::terminal()
    }

    /// The caller is gone; drop its episode if one is still live.
    pub fn end_session(&self, session: SessionId) {
        if self.advisor.store().contains(session) {
            self.advisor.abort(session, &ServeError::PeerDisconnected);
        }
    }

    fn try_get_advice(&self, session: SessionId, req: &AdviceRequest) -> Result<Advice, ServeError> {
        let policy = self.advisor.policy();
        let lookup = self.advisor.store().get_or_create(session, &req.embedding)?;
        let mut ep = lock_episode(&lookup.episode);

        if lookup.created {
            ep.set_unit(req.unit.clone());
            ep.set_baseline(req.metrics);
            return Ok(Advice::act(ep.choose_action(policy)?));
        }

        if !req.done {
            check_state_len(&req.embedding, policy.input_len())?;
        }
        if req.unit.is_some() && ep.unit().is_none() {
            ep.set_unit(req.unit.clone());
        }
        let reward = ep.shape_reward(req.reward, req.metrics);
        let transition = ep.advance(StepReport {
            next_state: req.embedding.clone(),
            reward,
            done: req.done,
            response: req.response.clone(),
        })?;
        match transition {
            Transition::Continue => Ok(Advice::act(ep.choose_action(policy)?)),
            Transition::Finished => {
                drop(ep);
                self.advisor.finish(session);
                Ok(Advice::terminal())
            }
        }
    }
}

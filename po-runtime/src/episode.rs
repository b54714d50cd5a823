//! One compilation episode: reset, then alternate choose/advance until the compiler says done.
//!
//! ```text
//! Fresh --reset--> AwaitingAction --choose_action--> AwaitingObservation
//!                       ^                                   |
//!                       +------advance(done=false)----------+
//!                                                           |
//!                                  Done <--advance(done=true)
//! ```

use po_core::{Action, RewardConfig, RewardShaper, StateVector, UnitMetrics};
use po_policy::{PolicyError, PolicyOracle};
use thiserror::Error;

use crate::session_store::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodePhase {
    Fresh,
    AwaitingAction,
    AwaitingObservation,
    Done,
}

#[derive(Debug, Error)]
pub enum EpisodeError {
    #[error("session {session}: `{op}` is not valid while {phase:?}")]
    ProtocolViolation {
        session: SessionId,
        op: &'static str,
        phase: EpisodePhase,
    },
    #[error("session {0}: episode finished without a terminal payload")]
    MissingTerminalPayload(SessionId),
    #[error("state vector has length {got}, expected {expected}")]
    BadState { got: usize, expected: usize },
    #[error("policy: {0}")]
    Policy(#[from] PolicyError),
}

/// Everything the compiler reports after applying the pending action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepReport {
    pub next_state: StateVector,
    pub reward: f32,
    pub done: bool,
    /// Opaque compiler-side result; required when `done`.
    pub response: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Continue,
    Finished,
}

/// Values every new episode is created with.
#[derive(Debug, Clone, Copy)]
pub struct EpisodeParams {
    pub state_len: usize,
    pub reward: RewardConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSummary {
    pub session: SessionId,
    /// 1-based creation order within the store.
    pub ordinal: u64,
    pub unit: Option<String>,
    pub steps: u32,
    pub cumulative_reward: f64,
    pub trace: Vec<Action>,
    pub aborted: bool,
}

impl EpisodeSummary {
    /// Line written to the completion log: the unit id, or a synthetic one.
    pub fn label(&self) -> String {
        match &self.unit {
            Some(u) => u.clone(),
            None => format!("session-{}-episode-{}", self.session, self.ordinal),
        }
    }
}

#[derive(Debug)]
pub struct Episode {
    session: SessionId,
    ordinal: u64,
    phase: EpisodePhase,
    state_len: usize,
    state: StateVector,
    pending_action: Option<Action>,
    step_count: u32,
    cumulative_reward: f64,
    unit: Option<String>,
    trace: Vec<Action>,
    response: Option<Vec<u8>>,
    aborted: bool,
    shaper: RewardShaper,
}

impl Episode {
    pub fn new(session: SessionId, params: EpisodeParams) -> Self {
        Self {
            session,
            ordinal: 0,
            phase: EpisodePhase::Fresh,
            state_len: params.state_len,
            state: Vec::new(),
            pending_action: None,
            step_count: 0,
            cumulative_reward: 0.0,
            unit: None,
            trace: Vec::new(),
            response: None,
            aborted: false,
            shaper: RewardShaper::new(params.reward),
        }
    }

    pub fn reset(&mut self, initial: StateVector) -> Result<(), EpisodeError> {
        self.expect_phase("reset", EpisodePhase::Fresh)?;
        self.check_state(&initial)?;
        self.state = initial;
        self.step_count = 0;
        self.cumulative_reward = 0.0;
        self.pending_action = None;
        self.trace.clear();
        self.shaper.reset(None);
        self.phase = EpisodePhase::AwaitingAction;
        Ok(())
    }

    /// Ask the policy for the next pass. Increments the step counter.
    pub fn choose_action(&mut self, policy: &dyn PolicyOracle) -> Result<Action, EpisodeError> {
        self.expect_phase("choose_action", EpisodePhase::AwaitingAction)?;
        let action = policy.choose_action(&self.state)?;
        self.pending_action = Some(action);
        self.step_count += 1;
        self.trace.push(action);
        self.phase = EpisodePhase::AwaitingObservation;
        Ok(action)
    }

    /// Fold in the compiler's report for the pending action.
    pub fn advance(&mut self, report: StepReport) -> Result<Transition, EpisodeError> {
        self.expect_phase("advance", EpisodePhase::AwaitingObservation)?;

        if report.done {
            if report.response.as_ref().map_or(true, |r| r.is_empty()) {
                self.abort();
                return Err(EpisodeError::MissingTerminalPayload(self.session));
            }
        } else {
            self.check_state(&report.next_state)?;
        }

        self.cumulative_reward += f64::from(report.reward);
        self.state = report.next_state;
        self.pending_action = None;
        if report.done {
            self.response = report.response;
            self.phase = EpisodePhase::Done;
            Ok(Transition::Finished)
        } else {
            self.phase = EpisodePhase::AwaitingAction;
            Ok(Transition::Continue)
        }
    }

    /// Terminate without a normal completion. Idempotent.
    pub fn abort(&mut self) {
        if self.phase != EpisodePhase::Done {
            self.aborted = true;
            self.pending_action = None;
            self.phase = EpisodePhase::Done;
        }
    }

    /// Record the compilation unit this episode belongs to.
    pub fn set_unit(&mut self, unit: Option<String>) {
        self.unit = unit;
    }

    /// Seed reward shaping with the unit's metrics before the first pass.
    pub fn set_baseline(&mut self, metrics: Option<UnitMetrics>) {
        self.shaper.reset(metrics);
    }

    /// Reward for the current step, from an explicit value or raw metrics.
    pub fn shape_reward(&mut self, explicit: Option<f32>, metrics: Option<UnitMetrics>) -> f32 {
        self.shaper.reward(explicit, metrics)
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub(crate) fn set_ordinal(&mut self, ordinal: u64) {
        self.ordinal = ordinal;
    }

    pub fn phase(&self) -> EpisodePhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == EpisodePhase::Done
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn state(&self) -> &[f32] {
        &self.state
    }

    pub fn pending_action(&self) -> Option<Action> {
        self.pending_action
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn cumulative_reward(&self) -> f64 {
        self.cumulative_reward
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn trace(&self) -> &[Action] {
        &self.trace
    }

    pub fn response(&self) -> Option<&[u8]> {
        self.response.as_deref()
    }

    pub fn summary(&self) -> EpisodeSummary {
        EpisodeSummary {
            session: self.session,
            ordinal: self.ordinal,
            unit: self.unit.clone(),
            steps: self.step_count,
            cumulative_reward: self.cumulative_reward,
            trace: self.trace.clone(),
            aborted: self.aborted,
        }
    }

    fn expect_phase(&self, op: &'static str, want: EpisodePhase) -> Result<(), EpisodeError> {
        if self.phase != want {
            return Err(EpisodeError::ProtocolViolation {
                session: self.session,
                op,
                phase: self.phase,
            });
        }
        Ok(())
    }

    fn check_state(&self, s: &[f32]) -> Result<(), EpisodeError> {
        if s.len() != self.state_len {
            return Err(EpisodeError::BadState {
                got: s.len(),
                expected: self.state_len,
            });
        }
        Ok(())
    }
}
